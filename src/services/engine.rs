//! Analytics engine - single owner of the identity registry
//!
//! Consumes detection frames from the ingest channel and polls the
//! aggregation schedule on a short interval. Every registry mutation happens
//! on this task, so no locking is needed around identity state.

use crate::domain::types::DetectionFrame;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::camera_status::CameraMonitor;
use crate::io::egress_channel::AnalyticsSink;
use crate::services::aggregation::AggregationScheduler;
use crate::services::attributes::AttributeClient;
use crate::services::registry::IdentityRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

/// Schedule polling period; well below the shortest tick
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct Engine {
    registry: IdentityRegistry,
    scheduler: AggregationScheduler,
    /// Attribute inference client (optional)
    attributes: Option<AttributeClient>,
    sink: Arc<dyn AnalyticsSink>,
    cameras: Arc<CameraMonitor>,
    metrics: Arc<Metrics>,
}

impl Engine {
    pub fn new(
        config: &Config,
        sink: Arc<dyn AnalyticsSink>,
        cameras: Arc<CameraMonitor>,
        metrics: Arc<Metrics>,
        attributes: Option<AttributeClient>,
    ) -> Self {
        Self {
            registry: IdentityRegistry::with_metrics(config, metrics.clone()),
            scheduler: AggregationScheduler::new(config.thresholds()),
            attributes,
            sink,
            cameras,
            metrics,
        }
    }

    /// Start the engine, consuming frames until the channel closes or
    /// shutdown is signalled
    pub async fn run(
        &mut self,
        mut frame_rx: mpsc::Receiver<DetectionFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick_interval = interval(POLL_INTERVAL);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(attributes = %self.attributes.is_some(), "engine_started");

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => self.process_frame(frame),
                        None => break,
                    }
                }
                _ = tick_interval.tick() => {
                    self.tick(Utc::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            identities = %self.registry.identity_count(),
            active = %self.registry.active_count(),
            lost = %self.registry.lost_count(),
            "engine_stopped"
        );
    }

    /// Resolve every detection in a frame and forward the resulting records
    pub fn process_frame(&mut self, frame: DetectionFrame) {
        let process_start = Instant::now();
        let now = frame.received_at;

        for detection in &frame.detections {
            let resolved = self.registry.resolve(
                frame.camera_id,
                detection.local_track_id,
                &detection.crop,
                detection.bbox,
                now,
            );
            let gid = match resolved {
                Ok(gid) => gid,
                Err(e) => {
                    self.metrics.record_detection_skipped();
                    warn!(
                        camera = %frame.camera_id,
                        local_track_id = %detection.local_track_id,
                        error = %e,
                        "detection_skipped"
                    );
                    continue;
                }
            };

            if let Some(ref mut client) = self.attributes {
                if let Some(observation) = client.latest(gid) {
                    self.registry.apply_observation(gid, &observation);
                }
                client.request(gid, &detection.crop, now);
            }
        }

        self.flush();

        let latency_us = process_start.elapsed().as_micros() as u64;
        self.metrics.record_frame_processed(frame.detections.len() as u64, latency_us);
    }

    /// Run due aggregation/status schedules and refresh gauges
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let camera_status = self.cameras.status(now);
        for record in self.scheduler.poll(now, &mut self.registry, camera_status) {
            self.sink.submit(record);
        }
        self.flush();

        if let Some(ref mut client) = self.attributes {
            let registry = &self.registry;
            client.retain(|gid| registry.is_tracked(gid));
        }

        self.metrics.set_track_counts(self.registry.active_count(), self.registry.lost_count());
        self.metrics.set_queue_length(self.registry.queue_length());
    }

    fn flush(&mut self) {
        for record in self.registry.drain_records() {
            self.sink.submit(record);
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }
}
