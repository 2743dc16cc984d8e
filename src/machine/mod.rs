//! Per-user trigger/hit state machines.
//!
//! Each machine counts consecutive blocks matching its trigger state and
//! emits a TRIGGER when the count reaches its threshold. After a trigger the
//! machine is gated behind `waiting_reverse`: counting only resumes once the
//! opposite state has been observed. A trigger may also arm a one-shot HIT,
//! evaluated exactly once, `hit_offset` admitted blocks later.
//!
//! Runtime state is deliberately volatile — zeroed on boot, on rule switch,
//! and on explicit reset. Only the configs persist.

use crate::config::MachineConfig;
use crate::judge::State;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalType {
    #[serde(rename = "TRIGGER")]
    Trigger,
    #[serde(rename = "HIT")]
    Hit,
}

/// One broadcast frame. `base_height` / `base_hash` / `offset` are present
/// only on HIT signals, referencing the trigger that armed them.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(rename = "machineId")]
    pub machine_id: String,
    pub state: State,
    pub height: String,
    pub hash: String,
    /// Unix seconds.
    pub time: i64,
    #[serde(rename = "baseHeight", skip_serializing_if = "Option::is_none")]
    pub base_height: Option<String>,
    #[serde(rename = "baseHash", skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

/// Volatile per-machine state.
#[derive(Debug, Clone, Serialize)]
pub struct Runtime {
    pub counter: u32,
    pub waiting_reverse: bool,
    pub hit_pending: bool,
    pub hit_countdown: u32,
    /// Snapshots taken at trigger time — hit evaluation never re-reads the
    /// config, so edits between trigger and evaluation cannot change an
    /// already-armed hit.
    #[serde(skip)]
    armed_expect: State,
    #[serde(skip)]
    armed_offset: u32,
    pub last_trigger_height: String,
    pub last_trigger_hash: String,
    pub last_trigger_time_unix: i64,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            counter: 0,
            waiting_reverse: true,
            hit_pending: false,
            hit_countdown: 0,
            armed_expect: State::On,
            armed_offset: 0,
            last_trigger_height: String::new(),
            last_trigger_hash: String::new(),
            last_trigger_time_unix: 0,
        }
    }
}

struct EngineInner {
    cfgs: HashMap<String, MachineConfig>,
    runtimes: HashMap<String, Runtime>,
    /// UI order, preserved across upserts.
    order: Vec<String>,
}

/// The multi-machine engine. All mutation happens under one write lock; the
/// orchestrator is the only block-driven caller.
pub struct Engine {
    inner: RwLock<EngineInner>,
}

impl Engine {
    pub fn new(cfgs: Vec<MachineConfig>) -> Self {
        let engine = Self {
            inner: RwLock::new(EngineInner {
                cfgs: HashMap::new(),
                runtimes: HashMap::new(),
                order: Vec::new(),
            }),
        };
        for cfg in cfgs {
            engine.upsert(cfg);
        }
        // every boot starts cold — no runtime state survives a restart
        engine.reset_all();
        engine
    }

    /// Insert or replace a machine config, normalising degenerate values.
    /// A new machine gets a fresh runtime; an existing one keeps its state.
    pub fn upsert(&self, mut cfg: MachineConfig) {
        if cfg.threshold < 1 {
            cfg.threshold = 1;
        }
        if cfg.hit_offset < 1 {
            cfg.hit_offset = 1;
        }

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.cfgs.contains_key(&cfg.id) {
            inner.order.push(cfg.id.clone());
        }
        inner
            .runtimes
            .entry(cfg.id.clone())
            .or_insert_with(Runtime::default);
        inner.cfgs.insert(cfg.id.clone(), cfg);
    }

    pub fn delete(&self, id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.cfgs.remove(id);
        inner.runtimes.remove(id);
        inner.order.retain(|x| x != id);
    }

    /// Configs in UI order.
    pub fn list(&self) -> Vec<MachineConfig> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .filter_map(|id| inner.cfgs.get(id).cloned())
            .collect()
    }

    pub fn runtime_snapshot(&self) -> HashMap<String, Runtime> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.runtimes.clone()
    }

    pub fn count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .order
            .len()
    }

    /// Disable every machine. Runtime state is untouched.
    pub fn stop_all(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for cfg in inner.cfgs.values_mut() {
            cfg.enabled = false;
        }
    }

    /// Zero every runtime back to the construction state.
    pub fn reset_all(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for rt in inner.runtimes.values_mut() {
            *rt = Runtime::default();
        }
    }

    pub fn reset_one(&self, id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(rt) = inner.runtimes.get_mut(id) {
            *rt = Runtime::default();
        }
    }

    /// Advance every enabled machine over one admitted, classified block.
    /// Signals come out in machine UI order.
    pub fn on_block(&self, state: State, height: u64, hash: &str, time_unix: i64) -> Vec<Signal> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();

        let order = inner.order.clone();
        for id in &order {
            let Some(cfg) = inner.cfgs.get(id).cloned() else {
                continue;
            };
            let Some(rt) = inner.runtimes.get_mut(id) else {
                continue;
            };

            // A disabled machine freezes entirely: no counting, and an armed
            // hit countdown holds its value until the machine is re-enabled.
            if !cfg.enabled {
                continue;
            }

            // Hit countdown ticks independently of the trigger logic, and is
            // evaluated against the snapshot taken when it was armed.
            if rt.hit_pending {
                rt.hit_countdown = rt.hit_countdown.saturating_sub(1);
                if rt.hit_countdown == 0 {
                    if state == rt.armed_expect {
                        out.push(Signal {
                            signal_type: SignalType::Hit,
                            machine_id: id.clone(),
                            state,
                            height: height.to_string(),
                            hash: hash.to_string(),
                            time: time_unix,
                            base_height: Some(rt.last_trigger_height.clone()),
                            base_hash: Some(rt.last_trigger_hash.clone()),
                            offset: Some(rt.armed_offset),
                        });
                    }
                    rt.hit_pending = false;
                }
            }

            // After a trigger, counting stays locked until the reverse state
            // shows up. The unlocking block itself never counts.
            if rt.waiting_reverse {
                if state == cfg.trigger_state.reverse() {
                    rt.waiting_reverse = false;
                    rt.counter = 0;
                }
                continue;
            }

            if state == cfg.trigger_state {
                rt.counter += 1;
            } else {
                rt.counter = 0;
            }

            if rt.counter >= cfg.threshold {
                out.push(Signal {
                    signal_type: SignalType::Trigger,
                    machine_id: id.clone(),
                    state,
                    height: height.to_string(),
                    hash: hash.to_string(),
                    time: time_unix,
                    base_height: None,
                    base_hash: None,
                    offset: None,
                });

                rt.last_trigger_height = height.to_string();
                rt.last_trigger_hash = hash.to_string();
                rt.last_trigger_time_unix = time_unix;

                rt.counter = 0;
                rt.waiting_reverse = true;

                if cfg.hit_enabled {
                    rt.hit_pending = true;
                    rt.hit_countdown = cfg.hit_offset.max(1);
                    rt.armed_expect = cfg.hit_expect;
                    rt.armed_offset = cfg.hit_offset.max(1);
                } else {
                    rt.hit_pending = false;
                    rt.hit_countdown = 0;
                }
            }
        }

        out
    }

    /// Flip a machine's enabled flag without touching anything else.
    /// Returns false when the id is unknown.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.cfgs.get_mut(id) {
            Some(cfg) => {
                cfg.enabled = enabled;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machine(id: &str, trigger: State, threshold: u32) -> MachineConfig {
        MachineConfig {
            id: id.to_string(),
            name: String::new(),
            enabled: true,
            trigger_state: trigger,
            threshold,
            hit_enabled: false,
            hit_expect: State::On,
            hit_offset: 1,
        }
    }

    fn hit_machine(id: &str, threshold: u32, expect: State, offset: u32) -> MachineConfig {
        MachineConfig {
            hit_enabled: true,
            hit_expect: expect,
            hit_offset: offset,
            ..machine(id, State::On, threshold)
        }
    }

    /// Feed a sequence of states; heights start at `base` and step by 1.
    fn feed(engine: &Engine, base: u64, states: &[State]) -> Vec<Vec<Signal>> {
        states
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let h = base + i as u64;
                engine.on_block(s, h, &format!("hash{h}"), 1_700_000_000 + h as i64)
            })
            .collect()
    }

    #[test]
    fn threshold_one_triggers_after_each_unlock() {
        // spec scenario: OFF unlocks, ON triggers, OFF unlocks, ON triggers
        let engine = Engine::new(vec![machine("m", State::On, 1)]);
        let rounds = feed(
            &engine,
            100,
            &[State::Off, State::On, State::Off, State::On],
        );
        assert!(rounds[0].is_empty()); // unlock only
        assert_eq!(rounds[1].len(), 1);
        assert_eq!(rounds[1][0].signal_type, SignalType::Trigger);
        assert_eq!(rounds[1][0].height, "101");
        assert!(rounds[2].is_empty()); // re-unlock, no signal
        assert_eq!(rounds[3].len(), 1);
        assert_eq!(rounds[3][0].height, "103");
    }

    #[test]
    fn streak_before_unlock_never_counts() {
        let engine = Engine::new(vec![machine("m", State::On, 3)]);
        let rounds = feed(
            &engine,
            1,
            &[
                State::On,
                State::On,
                State::Off,
                State::On,
                State::On,
                State::On,
            ],
        );
        for r in &rounds[..5] {
            assert!(r.is_empty());
        }
        assert_eq!(rounds[5].len(), 1);
        assert_eq!(rounds[5][0].height, "6");
    }

    #[test]
    fn interrupted_streak_resets_the_counter() {
        let engine = Engine::new(vec![machine("m", State::On, 3)]);
        let rounds = feed(
            &engine,
            1,
            &[
                State::Off, // unlock
                State::On,
                State::On,
                State::Off, // reset
                State::On,
                State::On,
                State::On,
            ],
        );
        assert!(rounds[..6].iter().all(|r| r.is_empty()));
        assert_eq!(rounds[6].len(), 1);
    }

    #[test]
    fn hit_fires_at_offset_when_state_matches() {
        let engine = Engine::new(vec![hit_machine("m", 2, State::On, 2)]);
        // unlock, trigger at 200, then two blocks; hit evaluated on the second
        let rounds = feed(
            &engine,
            198,
            &[State::Off, State::On, State::On, State::Off, State::On],
        );
        assert_eq!(rounds[2].len(), 1); // trigger at 200
        assert_eq!(rounds[2][0].signal_type, SignalType::Trigger);
        assert!(rounds[3].is_empty()); // countdown 2 -> 1, gate unlocks
        assert_eq!(rounds[4].len(), 1);
        let hit = &rounds[4][0];
        assert_eq!(hit.signal_type, SignalType::Hit);
        assert_eq!(hit.base_height.as_deref(), Some("200"));
        assert_eq!(hit.base_hash.as_deref(), Some("hash200"));
        assert_eq!(hit.offset, Some(2));
        assert_eq!(hit.height, "202");
    }

    #[test]
    fn hit_misses_silently_and_never_re_fires() {
        let engine = Engine::new(vec![hit_machine("m", 1, State::On, 2)]);
        let rounds = feed(
            &engine,
            199,
            &[State::Off, State::On, State::Off, State::Off, State::On],
        );
        assert_eq!(rounds[1].len(), 1); // trigger
        assert!(rounds[2].is_empty());
        assert!(rounds[3].is_empty()); // countdown expired on OFF: no hit
        // the later ON must not resurrect the expired hit; it re-triggers
        // instead (gate was released at block 201)
        assert_eq!(rounds[4].len(), 1);
        assert_eq!(rounds[4][0].signal_type, SignalType::Trigger);
    }

    #[test]
    fn hit_and_trigger_in_the_same_block_do_not_collide() {
        // offset 1: block 201 evaluates the hit AND unlocks the gate
        let engine = Engine::new(vec![hit_machine("m", 1, State::Off, 1)]);
        let rounds = feed(&engine, 199, &[State::Off, State::On, State::Off]);
        assert_eq!(rounds[1].len(), 1); // trigger at 200
        // block 201: hit countdown reaches zero, state OFF == expect -> HIT;
        // same block unlocks the gate but must not trigger
        assert_eq!(rounds[2].len(), 1);
        assert_eq!(rounds[2][0].signal_type, SignalType::Hit);
    }

    #[test]
    fn hit_evaluation_uses_the_trigger_time_snapshot() {
        let engine = Engine::new(vec![hit_machine("m", 3, State::On, 2)]);
        let rounds = feed(
            &engine,
            197,
            &[State::Off, State::On, State::On, State::On],
        );
        assert_eq!(rounds[3].len(), 1); // trigger at 200 armed the hit

        // flip the config under the armed hit: disable hit, change expect
        let mut cfg = engine.list().remove(0);
        cfg.hit_enabled = false;
        cfg.hit_expect = State::Off;
        engine.upsert(cfg);

        let rounds = feed(&engine, 201, &[State::Off, State::On]);
        assert!(rounds[0].is_empty());
        // still evaluated, against the armed expect (ON), not the new config
        assert_eq!(rounds[1].len(), 1);
        assert_eq!(rounds[1][0].signal_type, SignalType::Hit);
    }

    #[test]
    fn disabled_machine_freezes_armed_hit() {
        let engine = Engine::new(vec![hit_machine("m", 1, State::On, 2)]);
        let rounds = feed(&engine, 199, &[State::Off, State::On]);
        assert_eq!(rounds[1].len(), 1);

        engine.set_enabled("m", false);
        // blocks pass while disabled; the countdown must not move
        assert!(feed(&engine, 201, &[State::On, State::On, State::On])
            .iter()
            .all(|r| r.is_empty()));
        let rt = engine.runtime_snapshot().remove("m").expect("runtime");
        assert!(rt.hit_pending);
        assert_eq!(rt.hit_countdown, 2);

        engine.set_enabled("m", true);
        let rounds = feed(&engine, 204, &[State::On, State::On]);
        assert!(rounds[0].is_empty());
        assert_eq!(rounds[1].len(), 1);
        assert_eq!(rounds[1][0].signal_type, SignalType::Hit);
    }

    #[test]
    fn zero_hit_offset_normalises_to_one() {
        let engine = Engine::new(vec![hit_machine("m", 1, State::On, 0)]);
        let rounds = feed(&engine, 199, &[State::Off, State::On, State::On]);
        assert_eq!(rounds[1].len(), 1); // trigger
        assert_eq!(rounds[2].len(), 1); // hit on the very next block
        assert_eq!(rounds[2][0].offset, Some(1));
    }

    #[test]
    fn reset_all_restores_construction_state() {
        let engine = Engine::new(vec![hit_machine("m", 2, State::On, 3)]);
        feed(&engine, 1, &[State::Off, State::On, State::On]); // trigger + armed hit
        engine.reset_all();
        let rt = engine.runtime_snapshot().remove("m").expect("runtime");
        assert_eq!(rt.counter, 0);
        assert!(rt.waiting_reverse);
        assert!(!rt.hit_pending);
        assert_eq!(rt.hit_countdown, 0);
        assert!(rt.last_trigger_height.is_empty());
    }

    #[test]
    fn stop_all_disables_without_touching_runtimes() {
        let engine = Engine::new(vec![machine("m", State::On, 2)]);
        feed(&engine, 1, &[State::Off, State::On]); // counter = 1
        engine.stop_all();
        assert!(engine.list().iter().all(|c| !c.enabled));
        let rt = engine.runtime_snapshot().remove("m").expect("runtime");
        assert_eq!(rt.counter, 1);
    }

    #[test]
    fn upsert_preserves_order_and_delete_removes() {
        let engine = Engine::new(vec![
            machine("a", State::On, 1),
            machine("b", State::On, 1),
            machine("c", State::On, 1),
        ]);
        // re-upserting an existing machine must not move it
        engine.upsert(machine("a", State::Off, 5));
        let ids: Vec<String> = engine.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        engine.delete("b");
        let ids: Vec<String> = engine.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(engine.runtime_snapshot().get("b").is_none());
    }

    #[test]
    fn signals_preserve_machine_order_within_one_block() {
        let engine = Engine::new(vec![
            machine("first", State::On, 1),
            machine("second", State::On, 1),
        ]);
        let rounds = feed(&engine, 1, &[State::Off, State::On]);
        let ids: Vec<&str> = rounds[1].iter().map(|s| s.machine_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn trigger_frame_schema_omits_hit_fields() {
        let engine = Engine::new(vec![hit_machine("m", 1, State::On, 2)]);
        let rounds = feed(&engine, 99, &[State::Off, State::On]);
        let frame = serde_json::to_value(&rounds[1][0]).expect("json");
        assert_eq!(
            frame,
            json!({
                "type": "TRIGGER",
                "machineId": "m",
                "state": "ON",
                "height": "100",
                "hash": "hash100",
                "time": 1_700_000_100i64
            })
        );
    }

    #[test]
    fn hit_frame_schema_carries_the_base() {
        let engine = Engine::new(vec![hit_machine("m", 1, State::On, 1)]);
        let rounds = feed(&engine, 99, &[State::Off, State::On, State::On]);
        let frame = serde_json::to_value(&rounds[2][0]).expect("json");
        assert_eq!(frame["type"], "HIT");
        assert_eq!(frame["baseHeight"], "100");
        assert_eq!(frame["baseHash"], "hash100");
        assert_eq!(frame["offset"], 1);
    }
}
