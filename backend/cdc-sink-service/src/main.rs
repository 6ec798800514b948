use std::sync::Arc;

use anyhow::{Context, Result};
use cdc_sink_service::config::Config;
use cdc_sink_service::services::cdc::{CdcConsumer, KafkaChangeStream};
use cdc_sink_service::store::ClickHouseStore;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cdc_sink_service=debug".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();

    tracing::info!("Starting cdc-sink-service");

    let config = Config::from_env().context("Failed to load configuration")?;
    let schema = config.sink.table_schema()?;

    let store = ClickHouseStore::new(&config.clickhouse);
    store
        .ping()
        .await
        .context("Failed to reach ClickHouse")?;

    let stream =
        KafkaChangeStream::subscribe(&config.kafka).context("Failed to subscribe to Kafka")?;

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let mut consumer = CdcConsumer::new(
        stream,
        Arc::new(store),
        schema,
        config.sink.audit_table(),
        shutdown_rx,
    )
    .with_tombstone_archiving(config.sink.archive_tombstones);

    tracing::info!("Starting HTTP server on 0.0.0.0:{}", config.sink.http_port);
    let server = cdc_sink_service::http::serve(consumer.health(), config.sink.http_port)
        .context("Failed to bind HTTP server")?;
    let server_handle = server.handle();
    let http_task = actix_web::rt::spawn(server);

    let outcome = consumer.run().await;

    server_handle.stop(true).await;
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("HTTP server error: {}", e),
        Err(e) => tracing::warn!("HTTP server task ended abnormally: {}", e),
    }

    outcome.context("CDC consumer terminated")
}
