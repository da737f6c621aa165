//! Visit analytics - multi-camera retail visitor analytics
//!
//! Consumes per-camera person detections, resolves them to store-wide
//! identities and emits visit, dwell, section, cashier and status records.
//!
//! Module structure:
//! - `domain/` - Core types (identifiers, detections, signatures, records)
//! - `io/` - External interfaces (MQTT ingest, inference, egress, Prometheus)
//! - `services/` - Business logic (Registry, Aggregation, Engine)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use visit_analytics::infra::{Config, Metrics};
use visit_analytics::io::{
    start_detection_ingest, CameraMonitor, Egress, HttpInference, MqttPublisher, RecordSender,
};
use visit_analytics::services::{attribute_worker_from_config, Engine};

/// Visit analytics - store-wide visitor identity and dwell analytics
#[derive(Parser, Debug)]
#[command(name = "visit-analytics", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

/// Detection frames buffered between ingest and the engine
const FRAME_CHANNEL_CAPACITY: usize = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-detection visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "visit-analytics starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config)?;

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        cameras = ?config.camera_ids(),
        primary_camera = %config.primary_camera(),
        sections = ?config.section_zones(),
        queue_zone = %config.queue_zone(),
        attributes_enabled = %config.attributes_enabled(),
        egress_file = %config.egress_file(),
        mqtt_egress_enabled = %config.mqtt_egress_enabled(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let metrics = Arc::new(Metrics::new());
    let cameras = Arc::new(CameraMonitor::from_config(&config));

    // Record fan-out: file always, MQTT when enabled
    let mut records = RecordSender::with_metrics(config.site_id(), metrics.clone());
    let file_rx = records.subscribe("file", config.egress_channel_capacity());
    let egress = Egress::new(config.egress_file());
    let egress_shutdown = shutdown_rx.clone();
    let egress_handle = tokio::spawn(async move {
        egress.run(file_rx, egress_shutdown).await;
    });

    let publisher_handle = if config.mqtt_egress_enabled() {
        let mqtt_rx = records.subscribe("mqtt", config.egress_channel_capacity());
        let publisher = MqttPublisher::new(&config, mqtt_rx);
        let publisher_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        }))
    } else {
        None
    };

    // Attribute inference worker (if enabled)
    let attributes = if config.attributes_enabled() {
        let inference = Arc::new(HttpInference::from_config(&config)?);
        let (client, worker) = attribute_worker_from_config(&config, inference, metrics.clone());
        tokio::spawn(worker.run());
        Some(client)
    } else {
        None
    };

    // Detection ingest (bounded for backpressure)
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let ingest_config = config.clone();
    let ingest_cameras = cameras.clone();
    let ingest_metrics = metrics.clone();
    let ingest_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            start_detection_ingest(&ingest_config, frame_tx, ingest_cameras, ingest_metrics, ingest_shutdown)
                .await
        {
            error!(error = %e, "mqtt_ingest_error");
        }
    });

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = visit_analytics::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Periodic metrics log
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = signal_tx.send(true);
    });

    let mut engine = Engine::new(&config, Arc::new(records), cameras, metrics, attributes);
    engine.run(frame_rx, shutdown_rx).await;

    // The engine also stops when ingest ends; make sure every task sees shutdown
    drop(engine);
    let _ = shutdown_tx.send(true);
    let _ = egress_handle.await;
    if let Some(handle) = publisher_handle {
        let _ = handle.await;
    }

    info!("visit-analytics shutdown complete");
    Ok(())
}
