//! Sensorium Binary Entry Point
//!
//! Runs ingestion, query streaming and the HTTP/WebSocket surface.
//! Core functionality is provided by the `sensorium` library crate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sensorium::{
    IngestionPipeline, LiveHub, MqttTransport, PipelineOptions, StorageBuilder, StorageHandles,
    StreamOptions, StreamingQueryManager,
    config::{AppConfig, parse_duration},
    ingest::DEFAULT_DELIVERY_CAPACITY,
    server::{AppState, create_router},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sensorium - sensor telemetry ingestion and live dashboards
#[derive(Parser, Debug)]
#[command(name = "sensorium", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "SENSORIUM_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "SENSORIUM_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "SENSORIUM_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, env = "SENSORIUM_DB_URL")]
    db_url: Option<String>,

    /// Broker endpoint, e.g. mqtt://host:1883 (overrides config file)
    #[arg(long, env = "SENSORIUM_BROKER")]
    broker: Option<String>,

    /// Query loop interval, e.g. 5s (overrides config file)
    #[arg(long, value_parser = parse_duration)]
    poll_interval: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sensorium=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Sensorium - sensor telemetry ingestion");

    let cli = Cli::parse();

    // Missing file falls back to defaults; a broken one is fatal.
    let mut config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!("Loading configuration from: {}", cli.config);
        AppConfig::load(&cli.config)?
    } else {
        tracing::warn!("Config file {} not found, using defaults", cli.config);
        AppConfig::default()
    };

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(url) = cli.db_url {
        config.database.url = url;
    }
    if let Some(broker) = cli.broker {
        config.transport.endpoint = broker;
    }
    if let Some(interval) = cli.poll_interval {
        config.streaming.interval = interval;
    }
    config.validate()?;

    tracing::info!(
        "Server: {}:{}, Database: {}, Broker: {}",
        config.server.bind,
        config.server.port,
        config.database.url,
        config.transport.endpoint,
    );

    let handles = StorageBuilder::new(&config.database.url)
        .pool_size(config.database.pool_size)
        .channel_capacity(config.database.channel_capacity)
        .batch_size(config.database.batch_size)
        .batch_flush_interval(config.database.batch_flush_interval)
        .read_timeout(config.database.read_timeout)
        .write_timeout(config.database.write_timeout)
        .build()
        .await?;
    tracing::info!("Storage initialized");

    let hub = LiveHub::new(config.live.capacity);

    let transport = MqttTransport::new(&config.transport.client_id)
        .with_keep_alive(config.transport.keep_alive)
        .with_handshake_timeout(config.transport.connect_timeout);
    let pipeline = IngestionPipeline::new(
        Arc::new(transport),
        handles.writer.clone(),
        hub.clone(),
        PipelineOptions {
            connect_timeout: config.transport.connect_timeout,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
        },
    );

    let streams = StreamingQueryManager::new(
        handles.facade.clone(),
        hub.clone(),
        StreamOptions::default()
            .with_interval(config.streaming.interval)
            .with_stop_timeout(config.streaming.stop_timeout),
    );

    let endpoint = config.transport.endpoint()?;
    if config.transport.auto_connect {
        auto_connect(&pipeline, &endpoint, &config.transport.topics).await;
    }

    let app_state = AppState {
        pipeline: pipeline.clone(),
        streams: streams.clone(),
        facade: handles.facade.clone(),
        writer: handles.writer.clone(),
        saved_queries: handles.saved_queries.clone(),
        hub,
        default_endpoint: endpoint,
    };
    let app = create_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    tracing::info!("Web server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown(streams, pipeline, handles).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Connect on startup and subscribe the configured topics.
///
/// A failure is logged; the operator can connect later via the API.
async fn auto_connect(pipeline: &IngestionPipeline, endpoint: &sensorium::Endpoint, topics: &[String]) {
    let handle = match pipeline.connect(endpoint).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(%endpoint, error = %e, "Broker not reachable at startup");
            return;
        }
    };

    for topic in topics {
        if let Err(e) = handle.subscribe(topic).await {
            tracing::warn!(topic, error = %e, "Failed to subscribe startup topic");
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}

/// Stop loops, drop the broker connection, then drain and close storage.
async fn shutdown(
    streams: StreamingQueryManager,
    pipeline: IngestionPipeline,
    handles: StorageHandles,
) {
    tracing::info!("Stopping query loops...");
    if let Err(e) = streams.shutdown().await {
        tracing::error!(error = %e, "Query loop shutdown incomplete");
    }

    tracing::info!("Disconnecting transport...");
    pipeline.shutdown().await;

    tracing::info!("Shutting down storage...");
    if let Err(e) = handles.shutdown().await {
        tracing::error!(error = %e, "Failed to shutdown storage");
    }
}
