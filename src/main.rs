use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

use sms_relay::api::{self, AppState};
use sms_relay::channels::Dispatcher;
use sms_relay::config::RelayConfig;
use sms_relay::delivery::{DeliveryTracker, RetryWorker, spawn_retry_worker};
use sms_relay::pipeline::types::ChannelType;
use sms_relay::pipeline::{Pipeline, RoutingCache};
use sms_relay::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = RelayConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(&config)?;

    eprintln!("📨 SMS Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Pipeline ─────────────────────────────────────────────────────────
    let dispatcher = Dispatcher::from_config(&config);
    let senders: Vec<&str> = [
        ChannelType::Telegram,
        ChannelType::Webhook,
        ChannelType::Email,
        ChannelType::Sms,
    ]
    .into_iter()
    .filter(|ty| dispatcher.supports(*ty))
    .map(|ty| ty.as_str())
    .collect();
    eprintln!("   Senders: {}", senders.join(", "));

    let cache = Arc::new(RoutingCache::new(Arc::clone(&db)));
    let tracker = Arc::new(DeliveryTracker::new(Arc::clone(&db), config.delivery.clone()));
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&db),
        cache,
        Arc::new(dispatcher),
        tracker,
    ));

    match pipeline.recover_unprocessed().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {n} unprocessed messages"),
        Err(e) => tracing::error!("Failed to recover unprocessed messages: {e}"),
    }

    // ── Retry worker ─────────────────────────────────────────────────────
    let worker = Arc::new(RetryWorker::new(
        Arc::clone(&db),
        Arc::clone(&pipeline),
        config.delivery.clone(),
    ));
    let _retry_handle = spawn_retry_worker(worker, config.delivery.poll_interval);
    eprintln!(
        "   Retries: max {}, base {:?}, cap {:?}, poll {:?}\n",
        config.delivery.max_retries,
        config.delivery.retry_base,
        config.delivery.retry_cap,
        config.delivery.poll_interval
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::router(AppState::new(pipeline));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "REST API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shut down");
    Ok(())
}

/// stderr always; a daily-rolling file as well when `RELAY_LOG_DIR` is set.
fn init_tracing(config: &RelayConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match config.log_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Could not create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sms-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}
