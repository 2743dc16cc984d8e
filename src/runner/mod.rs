//! The tick loop.
//!
//! One long-lived task: ask the dispatcher for a block, feed it to the core,
//! sleep, repeat. Poll failures follow the configured retry policy — wait and
//! retry, or stop for good in manual mode. The stop signal is observed at
//! every sleep, so worst-case shutdown latency is the current sleep interval.

use crate::app::Core;
use crate::source::dispatcher::Dispatcher;
use crate::source::BlockSource;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub const MIN_BASE_TICK: Duration = Duration::from_millis(200);
pub const MIN_FAIL_WAIT: Duration = Duration::from_secs(60);

/// Retry policy plus pacing. Re-read every iteration, so updates take effect
/// on the next tick without restarting the loop.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub base_tick: Duration,
    pub fail_wait: Duration,
    /// false = manual mode: the loop exits on the first poll failure.
    pub auto_restart: bool,
}

impl Policy {
    pub fn new(base_tick: Duration, fail_wait: Duration, auto_restart: bool) -> Self {
        Self {
            base_tick: base_tick.max(MIN_BASE_TICK),
            fail_wait: fail_wait.max(MIN_FAIL_WAIT),
            auto_restart,
        }
    }
}

pub struct Runner<S> {
    core: Arc<Core>,
    dispatcher: Arc<Dispatcher<S>>,
    policy: RwLock<Policy>,
    stop_tx: watch::Sender<bool>,
}

impl<S: BlockSource> Runner<S> {
    pub fn new(core: Arc<Core>, dispatcher: Arc<Dispatcher<S>>, policy: Policy) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            core,
            dispatcher,
            policy: RwLock::new(policy),
            stop_tx,
        }
    }

    pub fn update_policy(&self, policy: Policy) {
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    /// Request a clean stop. Idempotent; the loop exits from whatever sleep
    /// it is currently in.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Blocking loop; run as a spawned task.
    pub async fn run(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        info!("poll runner started");
        self.core.set_listening(true);

        loop {
            if *stop_rx.borrow() {
                break;
            }
            let policy = *self.policy.read().unwrap_or_else(|e| e.into_inner());

            match self.dispatcher.fetch_any().await {
                Ok(block) => {
                    self.core.on_block(block).await;
                    if !sleep_or_stop(policy.base_tick, &mut stop_rx).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "POLL_ERROR");
                    self.core.record_reconnect();
                    if !policy.auto_restart {
                        warn!("manual retry policy, poll loop stopping");
                        break;
                    }
                    if !sleep_or_stop(policy.fail_wait, &mut stop_rx).await {
                        break;
                    }
                }
            }
        }

        self.core.set_listening(false);
        info!("poll runner stopped");
    }
}

/// Returns false when the stop signal arrived during the sleep.
async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stop.changed() => false,
    }
}
