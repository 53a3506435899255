//! cbugg notification daemon.
//!
//! Wires an in-memory store to the notification pipeline and the janitor,
//! logging every outbound message, and runs until interrupted.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cbugg_core::notification_channels;
use cbugg_db::{Database, MemoryStore, StaticActorResolver};
use cbugg_notify::{Dispatcher, Janitor, LogSink, NotifyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "cbugg_notify=debug,cbugg_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cbugg_notify=debug,cbugg_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("cbugg-notifyd.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = NotifyConfig::from_env();
    if !config.mail_configured() {
        warn!("CBUGG_MAIL_FROM is not set, messages will only be logged");
    }

    // CBUGG_INTERNAL_DOMAIN - addresses in this domain may see private bugs
    let mut resolver = StaticActorResolver::new();
    if let Ok(domain) = std::env::var("CBUGG_INTERNAL_DOMAIN") {
        resolver = resolver.with_internal_domain(domain);
    }
    let resolver = Arc::new(resolver);

    let (notifier, receivers) = notification_channels(config.channel_capacity);
    let db = Database::new(Arc::new(MemoryStore::new()), notifier, resolver.clone());

    let dispatch = Dispatcher::new(&db, resolver, Arc::new(LogSink::new(&config)), &config)
        .start(receivers);
    let janitor = Janitor::new(db.bugs.clone(), &config).start();

    info!(
        delay_ms = config.notification_delay_ms,
        base_url = %config.base_url,
        janitor_interval_secs = config.janitor_interval_secs,
        "cbugg-notifyd running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    janitor.shutdown().await?;
    dispatch.shutdown().await?;
    dispatch.stopped().await;

    info!("cbugg-notifyd stopped");
    Ok(())
}
