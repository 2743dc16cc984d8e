//! Persisted configuration document.
//!
//! One JSON file holds everything an operator can change: the active judge
//! rule, the block sources, the machine definitions, and the runner/server/
//! logging sections. Runtime state is never persisted — every boot starts the
//! machines cold.

use crate::judge::{Rule, State};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Active classification rule. Exactly one per process.
    #[serde(default = "default_rule")]
    pub judge_rule: Rule,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub machines: Vec<MachineConfig>,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            judge_rule: default_rule(),
            sources: Vec::new(),
            machines: Vec::new(),
            runner: RunnerConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// One HTTP block source. Changes apply at the next tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    pub endpoint: String,
    /// GET or POST.
    #[serde(default = "default_method")]
    pub method: String,
    /// Request body for POST sources.
    #[serde(default)]
    pub body: Option<String>,
    /// Extra request headers (API keys and the like).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Token refill rate, requests/second.
    #[serde(default = "default_rate")]
    pub base_rate: u32,
    /// Burst ceiling, requests/second.
    #[serde(default = "default_rate")]
    pub max_rate: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub provider: Provider,
}

/// How to pull a block out of the response JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Provider {
    /// TronGrid / fullnode `getnowblock` response shape.
    Trongrid,
    /// Arbitrary JSON with configured field paths (dot-separated).
    Json {
        height_path: String,
        hash_path: String,
        time_path: String,
        #[serde(default)]
        time_unit: TimeUnit,
    },
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Trongrid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    S,
    Ms,
}

impl Default for TimeUnit {
    fn default() -> Self {
        TimeUnit::Ms
    }
}

/// One state machine definition. Runtime counters live in the engine, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trigger_state")]
    pub trigger_state: State,
    /// Consecutive matching blocks required to trigger.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default)]
    pub hit_enabled: bool,
    #[serde(default = "default_trigger_state")]
    pub hit_expect: State,
    /// Admitted-block distance after a trigger at which the hit is evaluated.
    #[serde(default = "default_hit_offset")]
    pub hit_offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_base_tick_ms")]
    pub base_tick_ms: u64,
    #[serde(default = "default_fail_wait_secs")]
    pub fail_wait_secs: u64,
    /// false = manual mode: a poll failure stops the loop for good.
    #[serde(default = "default_true")]
    pub auto_restart: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_tick_ms: default_base_tick_ms(),
            fail_wait_secs: default_fail_wait_secs(),
            auto_restart: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_rule() -> Rule {
    Rule::Lucky
}
fn default_method() -> String {
    "GET".to_string()
}
fn default_rate() -> u32 {
    1
}
fn default_timeout_ms() -> u64 {
    2500
}
fn default_trigger_state() -> State {
    State::On
}
fn default_threshold() -> u32 {
    1
}
fn default_hit_offset() -> u32 {
    1
}
fn default_base_tick_ms() -> u64 {
    800
}
fn default_fail_wait_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// File-backed config store. Reads hand out snapshots; every mutation is
/// written back to disk before it is visible to readers.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<AppConfig>,
}

impl ConfigStore {
    /// Load the document, creating it with defaults when the file is missing.
    /// An unreadable or unparsable existing file is an error — on first boot
    /// that is fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                write_document(path, &config)?;
                config
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(config),
        })
    }

    /// Snapshot of the whole document.
    pub fn get(&self) -> AppConfig {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the document and persist it.
    pub fn set(&self, config: AppConfig) -> Result<(), ConfigError> {
        write_document(&self.path, &config)?;
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = config;
        Ok(())
    }

    /// Mutate-in-place helper for single-field updates.
    pub fn update<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = self.get();
        f(&mut config);
        self.set(config)
    }
}

fn write_document(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let contents = serde_json::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}
