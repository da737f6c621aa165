//! Prometheus metrics HTTP endpoint
//!
//! Exposes analytics metrics in Prometheus text format at /metrics and a
//! liveness check at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_frame_metrics(&mut output, site_id, &summary);
    write_identity_metrics(&mut output, site_id, &summary);
    write_attribute_metrics(&mut output, site_id, &summary);
    write_drop_metrics(&mut output, site_id, &summary);

    output
}

fn write_frame_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "analytics_frames_total",
        "Total detection frames processed",
        MetricType::Counter,
        site,
        summary.frames_total,
    );
    let _ = writeln!(output, "# HELP analytics_frames_per_sec Frames processed per second");
    let _ = writeln!(output, "# TYPE analytics_frames_per_sec gauge");
    let _ = writeln!(output, "analytics_frames_per_sec{{site=\"{site}\"}} {:.2}", summary.frames_per_sec);
    write_metric(
        output,
        "analytics_detections_total",
        "Total detections resolved",
        MetricType::Counter,
        site,
        summary.detections_total,
    );
    write_metric(
        output,
        "analytics_detections_skipped_total",
        "Detections skipped for unusable crop or box",
        MetricType::Counter,
        site,
        summary.detections_skipped,
    );

    write_histogram(
        output,
        "analytics_frame_latency_us",
        "Frame processing latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_process_latency_us,
    );
    write_metric(
        output,
        "analytics_frame_latency_p99_us",
        "99th percentile frame latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
}

fn write_identity_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let counters = [
        ("analytics_identities_created_total", "Global identities created", summary.identities_created),
        ("analytics_visual_matches_total", "Visual re-identification matches", summary.visual_matches),
        ("analytics_spatial_recoveries_total", "Cross-camera spatial recoveries", summary.spatial_recoveries),
        ("analytics_tracks_lost_total", "Active tracks evicted to lost", summary.tracks_lost),
        ("analytics_tracks_finalized_total", "Lost tracks finalized", summary.tracks_finalized),
        ("analytics_identities_expired_total", "Identities dropped after TTL", summary.identities_expired),
        ("analytics_visits_confirmed_total", "Confirmed visits", summary.visits_confirmed),
        ("analytics_dwell_records_total", "Dwell time records emitted", summary.dwell_records),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }

    write_metric(output, "analytics_active_tracks", "Active tracks", MetricType::Gauge, site, summary.active_tracks);
    write_metric(output, "analytics_lost_tracks", "Tracks in grace period", MetricType::Gauge, site, summary.lost_tracks);
    write_metric(
        output,
        "analytics_queue_length",
        "Identities in the cashier queue zone",
        MetricType::Gauge,
        site,
        summary.queue_length,
    );
}

fn write_attribute_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "analytics_attribute_requests_total",
        "Attribute inference requests queued",
        MetricType::Counter,
        site,
        summary.attribute_requests_submitted,
    );
    write_metric(
        output,
        "analytics_attribute_requests_throttled_total",
        "Attribute requests suppressed by the resubmit interval",
        MetricType::Counter,
        site,
        summary.attribute_requests_throttled,
    );
    write_metric(
        output,
        "analytics_inference_failures_total",
        "Attribute inference failures",
        MetricType::Counter,
        site,
        summary.inference_failures,
    );
}

fn write_drop_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "analytics_frames_dropped_total",
        "Frames dropped at ingest due to full channel",
        MetricType::Counter,
        site,
        summary.frames_dropped,
    );
    write_metric(
        output,
        "analytics_records_dropped_total",
        "Records dropped due to full egress channel",
        MetricType::Counter,
        site,
        summary.records_dropped,
    );
    write_metric(
        output,
        "analytics_attribute_requests_dropped_total",
        "Attribute requests dropped due to full queue",
        MetricType::Counter,
        site,
        summary.attribute_requests_dropped,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_frame_processed(3, 150);
        metrics.record_frame_processed(1, 250);
        metrics.record_identity_created();
        metrics.set_track_counts(5, 2);

        let output = format_prometheus_metrics(&metrics, "store-7");

        assert!(output.contains("analytics_frames_total{site=\"store-7\"} 2"));
        assert!(output.contains("analytics_detections_total{site=\"store-7\"} 4"));
        assert!(output.contains("analytics_frame_latency_us_bucket{site=\"store-7\",le=\"+Inf\"} 2"));
        assert!(output.contains("analytics_identities_created_total{site=\"store-7\"} 1"));
        assert!(output.contains("analytics_active_tracks{site=\"store-7\"} 5"));
        assert!(output.contains("analytics_lost_tracks{site=\"store-7\"} 2"));
    }

    #[test]
    fn test_scrape_leaves_histogram_intact() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(1, 150);
        metrics.record_frame_processed(1, 150);

        let first = format_prometheus_metrics(&metrics, "s");
        metrics.report();
        metrics.record_frame_processed(1, 150);
        let second = format_prometheus_metrics(&metrics, "s");

        assert!(first.contains("analytics_frame_latency_us_bucket{site=\"s\",le=\"+Inf\"} 2"));
        assert!(second.contains("analytics_frame_latency_us_bucket{site=\"s\",le=\"+Inf\"} 3"));
        assert!(second.contains("analytics_frame_latency_us_count{site=\"s\"} 3"));
        // Scrapes do not consume the periodic interval
        assert_eq!(metrics.report().lat_buckets.iter().sum::<u64>(), 1);
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let mut output = String::new();
        let mut buckets = [0u64; METRICS_NUM_BUCKETS];
        buckets[0] = 2;
        buckets[3] = 1;
        buckets[METRICS_NUM_BUCKETS - 1] = 1;
        write_histogram(&mut output, "h", "help", "s", &buckets, &METRICS_BUCKET_BOUNDS, 10);

        assert!(output.contains("h_bucket{site=\"s\",le=\"100\"} 2"));
        assert!(output.contains("h_bucket{site=\"s\",le=\"800\"} 3"));
        assert!(output.contains("h_bucket{site=\"s\",le=\"+Inf\"} 4"));
        assert!(output.contains("h_count{site=\"s\"} 4"));
        assert!(output.contains("h_sum{site=\"s\"} 40"));
    }
}
