//! chainpulse — Tron block stream watcher.
//!
//! Polls configured block sources, classifies each new block ON/OFF, drives
//! the configured trigger/hit machines, and serves the signal WebSocket and
//! status SSE channels.

use anyhow::Result;
use chainpulse::app::Core;
use chainpulse::block::{DedupRing, DEFAULT_RING_CAPACITY};
use chainpulse::config::{ConfigStore, LoggingConfig};
use chainpulse::hub::Hub;
use chainpulse::judge::Judge;
use chainpulse::machine::Engine;
use chainpulse::runner::{Policy, Runner};
use chainpulse::server::{self, AppState};
use chainpulse::source::dispatcher::{Dispatcher, FETCH_ROUND_DEADLINE};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config_path =
        std::env::var("CHAINPULSE_CONFIG").unwrap_or_else(|_| "chainpulse.json".to_string());
    // an unreadable config on first boot is fatal
    let store = Arc::new(ConfigStore::load(Path::new(&config_path))?);
    let config = store.get();

    init_tracing(&config.logging);
    info!(config = %config_path, "chainpulse starting");

    // a lock file left behind by the previous run means we died uncleanly
    let lock_path =
        std::env::var("CHAINPULSE_LOCK").unwrap_or_else(|_| "chainpulse.lock".to_string());
    let abnormal_restart = Path::new(&lock_path).exists();
    if let Err(e) = std::fs::write(&lock_path, std::process::id().to_string()) {
        warn!(error = %e, path = %lock_path, "could not write lock file");
    }

    // wiring order: config → classifier → engine → ring → hub → core →
    // dispatcher → runner
    let judge = Judge::new(config.judge_rule);
    let engine = Arc::new(Engine::new(config.machines.clone()));
    let ring = DedupRing::new(DEFAULT_RING_CAPACITY);
    let hub = Arc::new(Hub::new());
    let core = Arc::new(Core::new(judge, engine, ring, hub, store.clone()));

    if abnormal_restart {
        core.record_major("ABNORMAL_RESTART");
    }

    let dispatcher = Arc::new(Dispatcher::new(FETCH_ROUND_DEADLINE));
    dispatcher.apply_configs(&config.sources);

    let policy = Policy::new(
        Duration::from_millis(config.runner.base_tick_ms),
        Duration::from_secs(config.runner.fail_wait_secs),
        config.runner.auto_restart,
    );
    let runner = Arc::new(Runner::new(core.clone(), dispatcher, policy));

    let runner_task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run().await }
    });

    // ctrl-c stops the runner first (and waits for it), then the server
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn({
        let runner = runner.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            runner.stop();
            let _ = runner_task.await;
            let _ = shutdown_tx.send(());
        }
    });

    // a bind failure is the other fatal error
    let state = AppState { core };
    server::serve(state, &config.server.bind, async move {
        let _ = shutdown_rx.await;
    })
    .await?;

    if let Err(e) = std::fs::remove_file(&lock_path) {
        warn!(error = %e, path = %lock_path, "could not remove lock file");
    }
    info!("chainpulse stopped");
    Ok(())
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
