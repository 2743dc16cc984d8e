//! HTTP block fetcher.
//!
//! One fetcher per configured source. A fetch is a single HTTP call with the
//! configured method, headers, body, and per-request deadline, decoded into a
//! normalised `Block` either through the embedded TronGrid adapter or through
//! configured JSON field paths.

use crate::block::Block;
use crate::config::{Provider, SourceConfig, TimeUnit};
use crate::source::limiter::Limiter;
use crate::source::{BlockSource, FetchError};
use reqwest::Method;
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;

pub struct HttpFetcher {
    id: String,
    cfg: RwLock<SourceConfig>,
    limiter: Limiter,
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(cfg: SourceConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            limiter: Limiter::new(cfg.base_rate, cfg.max_rate),
            cfg: RwLock::new(cfg),
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> SourceConfig {
        self.cfg.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap the config in place. The limiter keeps its accumulated state,
    /// clamped to the new ceiling.
    pub fn update_config(&self, cfg: SourceConfig) {
        self.limiter.update(cfg.base_rate, cfg.max_rate);
        *self.cfg.write().unwrap_or_else(|e| e.into_inner()) = cfg;
    }

    async fn fetch(&self, cfg: SourceConfig) -> Result<Block, FetchError> {
        let method = if cfg.method.eq_ignore_ascii_case("POST") {
            Method::POST
        } else {
            Method::GET
        };

        let mut req = self
            .client
            .request(method.clone(), &cfg.endpoint)
            .timeout(Duration::from_millis(cfg.timeout_ms.max(1)));
        for (k, v) in &cfg.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if method == Method::POST {
            if let Some(body) = &cfg.body {
                if !cfg
                    .headers
                    .keys()
                    .any(|k| k.eq_ignore_ascii_case("content-type"))
                {
                    req = req.header("Content-Type", "application/json");
                }
                req = req.body(body.clone());
            }
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let root: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        extract_block(&cfg, &root)
    }
}

impl BlockSource for HttpFetcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn enabled(&self) -> bool {
        self.cfg.read().unwrap_or_else(|e| e.into_inner()).enabled
    }

    async fn fetch_latest(&self) -> Result<Block, FetchError> {
        let cfg = self.config();
        if !cfg.enabled {
            return Err(FetchError::Disabled);
        }
        if !self.limiter.allow() {
            return Err(FetchError::RateLimited);
        }
        self.fetch(cfg).await
    }
}

/// Map a decoded response body to a `Block` per the source's provider.
fn extract_block(cfg: &SourceConfig, root: &Value) -> Result<Block, FetchError> {
    let (height, hash, time_unix) = match &cfg.provider {
        Provider::Trongrid => {
            let hash = lookup(root, "blockID")
                .and_then(value_as_string)
                .ok_or_else(|| FetchError::Decode("missing blockID".to_string()))?;
            let height = lookup(root, "block_header.raw_data.number")
                .and_then(value_as_u64)
                .ok_or_else(|| FetchError::Decode("missing block number".to_string()))?;
            let millis = lookup(root, "block_header.raw_data.timestamp")
                .and_then(value_as_i64)
                .ok_or_else(|| FetchError::Decode("missing block timestamp".to_string()))?;
            (height, hash, millis / 1000)
        }
        Provider::Json {
            height_path,
            hash_path,
            time_path,
            time_unit,
        } => {
            let height = lookup(root, height_path)
                .and_then(value_as_u64)
                .ok_or_else(|| FetchError::Decode(format!("heightPath {height_path}")))?;
            let hash = lookup(root, hash_path)
                .and_then(value_as_string)
                .ok_or_else(|| FetchError::Decode(format!("hashPath {hash_path}")))?;
            let raw_time = lookup(root, time_path)
                .and_then(value_as_i64)
                .ok_or_else(|| FetchError::Decode(format!("timePath {time_path}")))?;
            let time_unix = match time_unit {
                TimeUnit::Ms => raw_time / 1000,
                TimeUnit::S => raw_time,
            };
            (height, hash, time_unix)
        }
    };

    if hash.trim().is_empty() {
        return Err(FetchError::InvalidBlock("empty hash".to_string()));
    }
    if height == 0 {
        return Err(FetchError::InvalidBlock("zero height".to_string()));
    }
    if time_unix <= 0 {
        return Err(FetchError::InvalidBlock(format!(
            "non-positive timestamp {time_unix}"
        )));
    }

    Ok(Block {
        height,
        hash,
        time_unix,
        source_id: cfg.id.clone(),
    })
}

/// Walk a dot-separated field path.
fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |v, seg| v.get(seg))
}

fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trongrid_cfg() -> SourceConfig {
        serde_json::from_value(json!({
            "id": "grid",
            "enabled": true,
            "endpoint": "http://localhost/wallet/getnowblock"
        }))
        .expect("config")
    }

    fn path_cfg(unit: &str) -> SourceConfig {
        serde_json::from_value(json!({
            "id": "raw",
            "enabled": true,
            "endpoint": "http://localhost/block",
            "provider": {
                "kind": "json",
                "height_path": "result.number",
                "hash_path": "result.hash",
                "time_path": "result.ts",
                "time_unit": unit
            }
        }))
        .expect("config")
    }

    #[test]
    fn trongrid_shape_decodes() {
        let body = json!({
            "blockID": "0000000004b2313fdeadbeef",
            "block_header": {
                "raw_data": { "number": 78_901_567u64, "timestamp": 1_700_000_000_123i64 }
            }
        });
        let b = extract_block(&trongrid_cfg(), &body).expect("block");
        assert_eq!(b.height, 78_901_567);
        assert_eq!(b.hash, "0000000004b2313fdeadbeef");
        assert_eq!(b.time_unix, 1_700_000_000); // ms truncated to seconds
        assert_eq!(b.source_id, "grid");
    }

    #[test]
    fn json_paths_decode_with_seconds_unit() {
        let body = json!({
            "result": { "number": "123456", "hash": "00ab", "ts": 1_700_000_000i64 }
        });
        let b = extract_block(&path_cfg("s"), &body).expect("block");
        assert_eq!(b.height, 123_456);
        assert_eq!(b.time_unix, 1_700_000_000);
    }

    #[test]
    fn json_paths_convert_millis_and_digit_strings() {
        let body = json!({
            "result": { "number": 7, "hash": "00ab", "ts": "1700000000123" }
        });
        let b = extract_block(&path_cfg("ms"), &body).expect("block");
        assert_eq!(b.time_unix, 1_700_000_000);
    }

    #[test]
    fn missing_path_is_a_decode_error() {
        let body = json!({ "result": { "hash": "00ab", "ts": 1 } });
        match extract_block(&path_cfg("s"), &body) {
            Err(FetchError::Decode(msg)) => assert!(msg.contains("heightPath")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn zero_height_and_empty_hash_are_invalid() {
        let body = json!({
            "blockID": "",
            "block_header": { "raw_data": { "number": 5, "timestamp": 1000 } }
        });
        assert!(matches!(
            extract_block(&trongrid_cfg(), &body),
            Err(FetchError::InvalidBlock(_))
        ));

        let body = json!({
            "blockID": "00ab",
            "block_header": { "raw_data": { "number": 0, "timestamp": 1000 } }
        });
        assert!(matches!(
            extract_block(&trongrid_cfg(), &body),
            Err(FetchError::InvalidBlock(_))
        ));
    }

    #[tokio::test]
    async fn disabled_source_short_circuits() {
        let mut cfg = trongrid_cfg();
        cfg.enabled = false;
        let fetcher = HttpFetcher::new(cfg);
        assert!(matches!(
            fetcher.fetch_latest().await,
            Err(FetchError::Disabled)
        ));
    }

    #[tokio::test]
    async fn exhausted_limiter_short_circuits() {
        let mut cfg = trongrid_cfg();
        cfg.base_rate = 1;
        cfg.max_rate = 1;
        // unroutable endpoint: the first call burns the only token on a
        // connection error, the second never reaches the network
        cfg.endpoint = "http://127.0.0.1:9/".to_string();
        cfg.timeout_ms = 50;
        let fetcher = HttpFetcher::new(cfg);
        let _ = fetcher.fetch_latest().await;
        assert!(matches!(
            fetcher.fetch_latest().await,
            Err(FetchError::RateLimited)
        ));
    }
}
