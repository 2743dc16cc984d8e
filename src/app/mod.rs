//! Core orchestrator.
//!
//! The single place where an incoming block becomes signals: validate, dedup,
//! gap-check, classify, advance the machines, broadcast. The runner is the
//! only block-driven caller, and rule switches take the same gate, so the
//! whole pipeline is effectively single-writer.

use crate::block::{Block, DedupRing, DEFAULT_RING_CAPACITY};
use crate::config::{ConfigError, ConfigStore};
use crate::hub::Hub;
use crate::judge::{Judge, Rule, State};
use crate::machine::Engine;
use chrono::{FixedOffset, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Snapshot handed to status observers. Never mutated by the engines.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub listening: bool,
    #[serde(rename = "lastHeight")]
    pub last_height: String,
    #[serde(rename = "lastHash")]
    pub last_hash: String,
    #[serde(rename = "lastTimeISO")]
    pub last_time_iso: String,
    pub reconnects: u64,
    #[serde(rename = "majorIncidents")]
    pub major_incidents: u64,
    #[serde(rename = "judgeRule")]
    pub judge_rule: Rule,
}

/// A classified block as the UI sees it.
#[derive(Debug, Clone, Serialize)]
pub struct BlockView {
    /// `YYYY/MM/DD HH:mm:ss` in UTC+8.
    pub time: String,
    pub height: u64,
    pub hash: String,
    pub state: State,
}

struct CoreState {
    listening: bool,
    last_height: u64,
    last_hash: String,
    last_time_unix: i64,
    reconnects: u64,
    major_incidents: u64,
    /// Latest classified blocks, newest first.
    blocks: Vec<BlockView>,
}

pub struct Core {
    /// Serialises `on_block` against `switch_rule`.
    gate: tokio::sync::Mutex<()>,
    state: Mutex<CoreState>,
    judge: Judge,
    ring: DedupRing,
    engine: Arc<Engine>,
    hub: Arc<Hub>,
    store: Arc<ConfigStore>,
}

impl Core {
    pub fn new(
        judge: Judge,
        engine: Arc<Engine>,
        ring: DedupRing,
        hub: Arc<Hub>,
        store: Arc<ConfigStore>,
    ) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(CoreState {
                listening: false,
                last_height: 0,
                last_hash: String::new(),
                last_time_unix: 0,
                reconnects: 0,
                major_incidents: 0,
                blocks: Vec::with_capacity(DEFAULT_RING_CAPACITY),
            }),
            judge,
            ring,
            engine,
            hub,
            store,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Feed one candidate block through the pipeline.
    pub async fn on_block(&self, block: Block) {
        let _gate = self.gate.lock().await;

        if block.hash.trim().is_empty() || block.height == 0 {
            debug!(source = %block.source_id, "rejecting invalid block");
            return;
        }
        if !self.ring.admit(&block) {
            return;
        }

        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.last_height > 0 && block.height > st.last_height + 1 {
                st.major_incidents += 1;
                warn!(
                    incident = "MAJOR_BLOCK_GAP",
                    from = st.last_height,
                    to = block.height,
                    "block height jumped"
                );
            }
            st.last_height = block.height;
            st.last_hash = block.hash.clone();
            st.last_time_unix = block.time_unix;
        }

        let state = self.judge.decide(&block.hash);

        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.blocks.insert(
                0,
                BlockView {
                    time: format_block_time(block.time_unix),
                    height: block.height,
                    hash: block.hash.clone(),
                    state,
                },
            );
            st.blocks.truncate(DEFAULT_RING_CAPACITY);
        }

        let signals = self
            .engine
            .on_block(state, block.height, &block.hash, block.time_unix);
        for signal in &signals {
            self.hub.broadcast(signal).await;
        }
    }

    /// Install a new classification rule. Everything block-derived is zeroed
    /// first so the next block is classified from a cold start.
    pub async fn switch_rule(&self, rule: Rule) -> Result<(), ConfigError> {
        let _gate = self.gate.lock().await;

        self.engine.stop_all();
        self.engine.reset_all();
        self.ring.reset();
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.last_height = 0;
            st.last_hash.clear();
            st.last_time_unix = 0;
            st.blocks.clear();
        }
        self.judge.set_rule(rule);

        warn!(incident = "JUDGE_SWITCH", rule = %rule, "classification rule switched");
        self.store.update(|c| c.judge_rule = rule)
    }

    pub fn status(&self) -> Status {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Status {
            listening: st.listening,
            last_height: st.last_height.to_string(),
            last_hash: st.last_hash.clone(),
            last_time_iso: format_iso_beijing(st.last_time_unix),
            reconnects: st.reconnects,
            major_incidents: st.major_incidents,
            judge_rule: self.judge.rule(),
        }
    }

    /// Latest classified blocks, newest first.
    pub fn blocks(&self) -> Vec<BlockView> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.blocks.clone()
    }

    pub fn set_listening(&self, listening: bool) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.listening = listening;
    }

    /// Count a poll reconnect cycle.
    pub fn record_reconnect(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.reconnects += 1;
    }

    /// Count and log a major incident (gap detection counts its own).
    pub fn record_major(&self, tag: &str) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.major_incidents += 1;
        warn!(incident = tag, "major incident recorded");
    }
}

fn beijing() -> FixedOffset {
    // UTC+8 has no DST; the offset is always valid
    FixedOffset::east_opt(8 * 3600).expect("fixed +08:00 offset")
}

/// RFC 3339 with the fixed +08:00 offset; empty until a block has been seen.
fn format_iso_beijing(unix: i64) -> String {
    if unix <= 0 {
        return String::new();
    }
    match Utc.timestamp_opt(unix, 0) {
        chrono::LocalResult::Single(dt) => dt
            .with_timezone(&beijing())
            .to_rfc3339_opts(SecondsFormat::Secs, false),
        _ => String::new(),
    }
}

fn format_block_time(unix: i64) -> String {
    match Utc.timestamp_opt(unix, 0) {
        chrono::LocalResult::Single(dt) => dt
            .with_timezone(&beijing())
            .format("%Y/%m/%d %H:%M:%S")
            .to_string(),
        _ => String::new(),
    }
}
