// `server.rs` wires the process together: configuration and logging, the
// device catalog, storage, the dispatcher, the broker connection and the
// HTTP surface. It also owns the shutdown order.
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Extension, Router};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::IngestConfig;
use crate::connection::ConnectionManager;
use crate::db::{self, DuckDbGateway};
use crate::device::{self, InMemoryDeviceRegistry};
use crate::dispatcher::{IngestionDispatcher, ShutdownMode};
use crate::handlers;
use crate::metrics::IngestMetrics;
use crate::mqtt::MqttTransport;
use crate::router::{TopicFilters, TopicRouter};
use crate::telemetry;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run() -> anyhow::Result<()> {
    let config = IngestConfig::from_env()?;
    telemetry::init_tracing(&config.log_level, config.log_json)?;
    info!(
        mqtt_host = %config.mqtt_host,
        mqtt_port = config.mqtt_port,
        topic_root = %config.topic_root,
        "starting device telemetry ingest"
    );

    let registry = Arc::new(Registry::new());
    let metrics = IngestMetrics::register(&registry)?;

    let devices = Arc::new(InMemoryDeviceRegistry::from_registrations(
        device::load_devices(&config.devices_file).await?,
    ));

    let (db, db_worker) = db::start_db_worker(Some(config.db_path.as_str()))?;
    let gateway = Arc::new(DuckDbGateway::new(db.clone()));
    let dispatcher = Arc::new(IngestionDispatcher::start(
        gateway,
        config.dispatcher_config(),
        metrics.clone(),
    ));

    let filters = TopicFilters::new(&config.topic_root);
    let router = TopicRouter::new(filters.clone(), devices.clone(), Arc::clone(&dispatcher), metrics.clone());
    let (transport, events) = MqttTransport::new(filters.clone(), config.mqtt_channel_capacity);
    let mut manager = ConnectionManager::new(
        Arc::new(transport),
        events,
        config.connection_options(),
        filters,
        router,
        config.reconnect_policy(),
        metrics,
    );

    let shutdown = CancellationToken::new();
    let event_loop = manager.start(shutdown.child_token())?;

    let app = Router::new()
        .route("/devices", get(handlers::list_devices).put(handlers::put_device))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health))
        .layer(Extension(devices))
        .layer(Extension(registry))
        .layer(Extension(manager.state()));

    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    info!(bind = %config.http_bind, "listening");
    let http = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let stop_deadline = CancellationToken::new();
    let deadline_timer = tokio::spawn({
        let stop_deadline = stop_deadline.clone();
        async move {
            tokio::time::sleep(STOP_TIMEOUT).await;
            stop_deadline.cancel();
        }
    });
    // stop() logs its own outcome
    let _ = manager.stop(stop_deadline).await;
    deadline_timer.abort();

    shutdown.cancel();
    if let Err(e) = event_loop.await {
        error!(error = %e, "connection event loop failed");
    }

    let report = dispatcher.shutdown(ShutdownMode::Drain).await;
    info!(
        persisted = report.persisted,
        failed = report.failed,
        undecodable = report.undecodable,
        abandoned = report.abandoned,
        "persistence drained"
    );

    if let Err(e) = db.flush().await {
        error!(error = %e, "final checkpoint failed");
    }
    if let Err(e) = db.shutdown().await {
        error!(error = %e, "closing DuckDB failed");
    }
    let _ = db_worker.await;

    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    info!("stopped");
    Ok(())
}
