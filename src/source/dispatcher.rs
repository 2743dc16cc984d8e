//! Parallel first-wins dispatcher.
//!
//! Every tick, all enabled sources race for the latest block under one shared
//! deadline. The first successful result whose `height:hash` key differs from
//! that source's previous yield is taken; everything else is discarded. The
//! per-source memo only suppresses a source repeating itself — cross-source
//! dedup is the ring's job.

use crate::block::Block;
use crate::config::SourceConfig;
use crate::source::fetcher::HttpFetcher;
use crate::source::{BlockSource, FetchError};
use dashmap::DashMap;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Shared deadline for one fetch round.
pub const FETCH_ROUND_DEADLINE: Duration = Duration::from_secs(6);

pub struct Dispatcher<S> {
    timeout: Duration,
    sources: RwLock<Vec<Arc<S>>>,
    /// source id -> last yielded `height:hash`
    last_seen: DashMap<String, String>,
}

impl<S: BlockSource> Dispatcher<S> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sources: RwLock::new(Vec::new()),
            last_seen: DashMap::new(),
        }
    }

    pub fn set_sources(&self, sources: Vec<Arc<S>>) {
        *self.sources.write().unwrap_or_else(|e| e.into_inner()) = sources;
    }

    pub fn source_count(&self) -> usize {
        self.sources.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Race all enabled sources; return the first fresh block to arrive.
    /// "First" is response-completion order, not configuration order.
    pub async fn fetch_any(&self) -> Result<Block, FetchError> {
        let sources: Vec<Arc<S>> = self
            .sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.enabled())
            .cloned()
            .collect();

        let mut in_flight = FuturesUnordered::new();
        for source in sources {
            in_flight.push(async move {
                let result = source.fetch_latest().await;
                (source.id().to_string(), result)
            });
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(FetchError::Deadline),
                next = in_flight.next() => match next {
                    None => return Err(FetchError::Deadline),
                    Some((source_id, Ok(block))) => {
                        let key = block.key();
                        if self.is_new(&source_id, &key) {
                            self.last_seen.insert(source_id, key);
                            return Ok(block);
                        }
                        debug!(source = %source_id, key = %key, "source re-yielded its last block");
                    }
                    Some((source_id, Err(err))) => {
                        debug!(source = %source_id, error = %err, "fetch failed");
                    }
                },
            }
        }
    }

    fn is_new(&self, source_id: &str, key: &str) -> bool {
        self.last_seen
            .get(source_id)
            .map(|last| last.value() != key)
            .unwrap_or(true)
    }
}

impl Dispatcher<HttpFetcher> {
    /// Reconcile the live fetcher set with the config document: update
    /// existing fetchers in place (limiter state survives), add new ones,
    /// drop removed ones. Takes effect on the next tick.
    pub fn apply_configs(&self, configs: &[SourceConfig]) {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());

        let mut next: Vec<Arc<HttpFetcher>> = Vec::with_capacity(configs.len());
        for cfg in configs {
            if let Some(existing) = sources.iter().find(|f| f.id() == cfg.id) {
                existing.update_config(cfg.clone());
                next.push(Arc::clone(existing));
            } else {
                next.push(Arc::new(HttpFetcher::new(cfg.clone())));
            }
        }

        for old in sources.iter() {
            if !configs.iter().any(|c| c.id == old.id()) {
                self.last_seen.remove(old.id());
            }
        }

        *sources = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    enum Behavior {
        Yield(u64, &'static str),
        Fail,
    }

    struct StubSource {
        id: String,
        enabled: bool,
        delay: Duration,
        behavior: Behavior,
    }

    impl StubSource {
        fn yielding(id: &str, delay_ms: u64, height: u64, hash: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                enabled: true,
                delay: Duration::from_millis(delay_ms),
                behavior: Behavior::Yield(height, hash),
            })
        }

        fn failing(id: &str, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                enabled: true,
                delay: Duration::from_millis(delay_ms),
                behavior: Behavior::Fail,
            })
        }
    }

    impl BlockSource for StubSource {
        fn id(&self) -> &str {
            &self.id
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        async fn fetch_latest(&self) -> Result<Block, FetchError> {
            tokio::time::sleep(self.delay).await;
            match &self.behavior {
                Behavior::Yield(height, hash) => Ok(Block {
                    height: *height,
                    hash: (*hash).to_string(),
                    time_unix: 1_700_000_000,
                    source_id: self.id.clone(),
                }),
                Behavior::Fail => Err(FetchError::Status(503)),
            }
        }
    }

    fn dispatcher() -> Dispatcher<StubSource> {
        Dispatcher::new(FETCH_ROUND_DEADLINE)
    }

    #[tokio::test(start_paused = true)]
    async fn first_successful_response_wins() {
        let d = dispatcher();
        d.set_sources(vec![
            StubSource::failing("flaky", 1),
            StubSource::yielding("slow", 50, 100, "00aa"),
            StubSource::yielding("fast", 10, 100, "00aa"),
        ]);
        let b = d.fetch_any().await.expect("block");
        assert_eq!(b.source_id, "fast");
        assert_eq!(b.height, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn memo_suppresses_a_source_repeating_itself() {
        let d = dispatcher();
        d.set_sources(vec![StubSource::yielding("only", 1, 100, "00aa")]);
        assert!(d.fetch_any().await.is_ok());
        // same source, same block: nothing new within the deadline
        assert!(matches!(d.fetch_any().await, Err(FetchError::Deadline)));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_block_from_another_source_still_yields() {
        let d = dispatcher();
        d.set_sources(vec![
            StubSource::yielding("fast", 10, 100, "00aa"),
            StubSource::yielding("slow", 50, 100, "00aa"),
        ]);
        let first = d.fetch_any().await.expect("block");
        assert_eq!(first.source_id, "fast");
        // "fast" is memoised; the same block is still fresh for "slow"
        let second = d.fetch_any().await.expect("block");
        assert_eq!(second.source_id, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_sources_never_race() {
        let d = dispatcher();
        d.set_sources(vec![Arc::new(StubSource {
            id: "off".to_string(),
            enabled: false,
            delay: Duration::from_millis(1),
            behavior: Behavior::Yield(100, "00aa"),
        })]);
        assert!(matches!(d.fetch_any().await, Err(FetchError::Deadline)));
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_end_in_deadline() {
        let d = dispatcher();
        d.set_sources(vec![StubSource::failing("a", 1), StubSource::failing("b", 2)]);
        assert!(matches!(d.fetch_any().await, Err(FetchError::Deadline)));
    }
}
