//! Tripwire host
//!
//! Reads newline-delimited JSON snapshots from stdin and dispatches each one
//! through the rule engine and alert pipeline.
//!
//! Run with: cargo run < snapshots.ndjson
//!
//! Environment variables:
//! - TRIPWIRE_CONFIG: JSON pipeline config file (optional)
//! - TRIPWIRE_RULES: JSON file with an array of rules to import (optional)
//! - TRIPWIRE_WEBHOOKS: Comma-separated webhook URLs, one channel each
//! - TRIPWIRE_DEDUP_*, TRIPWIRE_BATCH_*, TRIPWIRE_RETRY_*: pipeline overrides
//! - RUST_LOG: Log level (default: tripwire=info)
//!
//! Each input line is a snapshot: `{"subject": "...", "data": {...}}` with
//! optional `history` and `timestamp`.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tripwire::channels::{Channel, LogChannel, WebhookChannel};
use tripwire::config::PipelineConfig;
use tripwire::rules::Snapshot;
use tripwire::{AlertManager, Dispatcher, RuleEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tripwire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("TRIPWIRE_CONFIG") {
        Ok(path) => {
            let mut config = PipelineConfig::from_file(&path)?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            config
        }
        Err(_) => PipelineConfig::from_env()?,
    };

    tracing::info!("Tripwire configuration:");
    tracing::info!(
        "  Dedup: enabled={} window={}ms algorithm={:?}",
        config.dedup.enabled,
        config.dedup.window_ms,
        config.dedup.algorithm
    );
    tracing::info!(
        "  Batch: enabled={} window={}ms size={}..{}",
        config.batch.enabled,
        config.batch.window_ms,
        config.batch.min_size,
        config.batch.max_size
    );
    tracing::info!(
        "  Retry: enabled={} max={} initial={}ms",
        config.retry.enabled,
        config.retry.max_retries,
        config.retry.initial_delay_ms
    );

    let engine = Arc::new(RuleEngine::new());
    if let Ok(path) = std::env::var("TRIPWIRE_RULES") {
        let text = std::fs::read_to_string(&path)?;
        let report = engine.import_json(&text)?;
        tracing::info!("  Rules: {} imported from {}", report.imported, path);
        for (id, reason) in &report.skipped {
            tracing::warn!(rule_id = %id, reason = %reason, "Rule skipped");
        }
    }

    let manager = Arc::new(AlertManager::new(config.clone()));
    manager.register_channel(Arc::new(LogChannel::default()), None);

    let webhooks: Vec<String> = std::env::var("TRIPWIRE_WEBHOOKS")
        .ok()
        .map(|urls| {
            urls.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    for (i, url) in webhooks.iter().enumerate() {
        let channel = WebhookChannel::new(format!("webhook-{}", i + 1), url.clone());
        tracing::info!("  Webhook: {} -> {}", channel.id(), url);
        manager.register_channel(Arc::new(channel), None);
    }

    manager.start();
    let dispatcher = Dispatcher::new(engine.clone(), manager.clone(), config.dispatcher.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Snapshot>(&line) {
            Ok(snapshot) => {
                let report = dispatcher.process(&snapshot).await;
                if report.matched > 0 {
                    tracing::info!(
                        subject = %snapshot.subject,
                        matched = report.matched,
                        suppressed = report.suppressed,
                        sent = report.sent,
                        "Snapshot dispatched"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed snapshot"),
        }
    }

    manager.stop().await;

    tracing::info!("Final statistics:");
    tracing::info!("  Rules: {}", serde_json::to_string(&engine.stats())?);
    tracing::info!("  Dispatcher: {}", serde_json::to_string(&dispatcher.stats())?);
    tracing::info!("  Pipeline: {}", serde_json::to_string(&manager.get_stats())?);

    Ok(())
}
