//! courier - runs the engine as a daemon driving sync, backup schedules and
//! follow-up dispatch

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use courier::{Engine, EngineConfig};

const FOLLOW_UP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("courier: {e:#}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    tracing::info!("Starting courier");

    if let Err(e) = run(config).await {
        tracing::error!("Engine error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config() -> anyhow::Result<EngineConfig> {
    match std::env::args().nth(1) {
        Some(path) => EngineConfig::load_from(&path).with_context(|| format!("loading {path}")),
        None => EngineConfig::load().context("loading config"),
    }
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::builder(config)
        .build()
        .await
        .context("building engine")?;
    engine.start().await.context("starting timers")?;

    let mut ticker = tokio::time::interval(FOLLOW_UP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.dispatch_follow_ups(Utc::now()).await {
                    Ok(report) if report.sent + report.failed + report.cancelled > 0 => {
                        tracing::info!(
                            sent = report.sent,
                            failed = report.failed,
                            cancelled = report.cancelled,
                            "Dispatched follow-ups"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Follow-up dispatch failed"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for shutdown signal")?;
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    engine.shutdown();
    Ok(())
}
