//! Signal broadcast hub.
//!
//! Subscribers are push-only: no queues worth speaking of, no retry, no
//! replay. Each subscriber is a small bounded channel whose other end lives in
//! a WebSocket connection task; a write that cannot complete within the
//! deadline (or whose reader is gone) drops the subscriber on the spot.

use crate::machine::Signal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-subscriber write deadline.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(2);

/// Channel depth per subscriber — enough to absorb a burst of signals from
/// one block without turning into a real queue.
const SUBSCRIBER_BUFFER: usize = 32;

pub struct Hub {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber. The caller owns the receiving end and must call
    /// `unsubscribe` when its connection dies (the hub will also drop it on
    /// the first failed write).
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        debug!(subscriber = id, "signal subscriber joined");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        if self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
        {
            debug!(subscriber = id, "signal subscriber left");
        }
    }

    pub fn count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Serialise once and push to every subscriber. Writes happen outside the
    /// lock; dead subscribers are removed afterwards under the write lock.
    pub async fn broadcast(&self, signal: &Signal) {
        let payload = match serde_json::to_string(signal) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise signal");
                return;
            }
        };

        let targets: Vec<(u64, mpsc::Sender<String>)> = {
            let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            subs.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx
                .send_timeout(payload.clone(), WRITE_DEADLINE)
                .await
                .is_err()
            {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            for id in dead {
                subs.remove(&id);
                warn!(subscriber = id, "dropping unresponsive signal subscriber");
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::State;
    use crate::machine::SignalType;

    fn signal() -> Signal {
        Signal {
            signal_type: SignalType::Trigger,
            machine_id: "m".to_string(),
            state: State::On,
            height: "100".to_string(),
            hash: "00ab".to_string(),
            time: 1_700_000_000,
            base_height: None,
            base_hash: None,
            offset: None,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let hub = Hub::new();
        let (_a, mut rx_a) = hub.subscribe();
        let (_b, mut rx_b) = hub.subscribe();
        assert_eq!(hub.count(), 2);

        hub.broadcast(&signal()).await;

        let frame = rx_a.recv().await.expect("frame");
        assert!(frame.contains("\"type\":\"TRIGGER\""));
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropped_receiver_is_removed_on_next_broadcast() {
        let hub = Hub::new();
        let (_kept, mut rx) = hub.subscribe();
        let (_gone, rx_dead) = hub.subscribe();
        drop(rx_dead);

        hub.broadcast(&signal()).await;
        assert_eq!(hub.count(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_subscriber_is_dropped_after_the_write_deadline() {
        let hub = Hub::new();
        let (_id, mut rx) = hub.subscribe();

        // fill the channel without ever draining it
        for _ in 0..SUBSCRIBER_BUFFER {
            hub.broadcast(&signal()).await;
        }
        assert_eq!(hub.count(), 1);
        // the next write cannot complete within the deadline
        hub.broadcast(&signal()).await;
        assert_eq!(hub.count(), 0);

        // frames written before the stall are still readable
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_shrinks_the_count() {
        let hub = Hub::new();
        let (id, _rx) = hub.subscribe();
        assert_eq!(hub.count(), 1);
        hub.unsubscribe(id);
        assert_eq!(hub.count(), 0);
    }
}
