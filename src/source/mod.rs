//! Block sources: rate limiting, HTTP fetching, and the first-wins dispatcher.

pub mod dispatcher;
pub mod fetcher;
pub mod limiter;

use crate::block::Block;
use std::future::Future;
use thiserror::Error;

/// Why a single fetch produced no block. Everything here is transient or a
/// validation drop — none of it is fatal to the pipeline.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source disabled")]
    Disabled,
    #[error("rate limited")]
    RateLimited,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("response decode failed: {0}")]
    Decode(String),
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("no source produced a new block within the deadline")]
    Deadline,
}

/// Anything the dispatcher can race for the latest block.
pub trait BlockSource: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn enabled(&self) -> bool;
    /// One attempt at the latest block. Must respect its own per-call timeout;
    /// the dispatcher adds a shared deadline on top.
    fn fetch_latest(&self) -> impl Future<Output = Result<Block, FetchError>> + Send;
}
