//! Typed channel for analytics record egress
//!
//! The engine writes through the `AnalyticsSink` trait. `RecordSender` fans
//! each record out to every consumer (file, MQTT) over bounded mpsc channels.
//! Sending never blocks: a full consumer channel drops the record.

use crate::domain::records::{
    AnalyticsRecord, CashierStatus, DwellTime, SectionAnalytics, SystemStatus, VisitorEntry,
};
use crate::domain::types::CameraStatus;
use crate::infra::metrics::Metrics;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Persistence sink write operations.
///
/// Every operation is fire-and-forget: implementations log and swallow
/// failures and must not block the caller.
pub trait AnalyticsSink: Send + Sync {
    fn submit(&self, record: AnalyticsRecord);

    fn log_visitor_entry(&self, count: u32, date: NaiveDate, hour: u32) {
        self.submit(AnalyticsRecord::VisitorEntry(VisitorEntry { count, date, hour }));
    }

    fn log_dwell_time(&self, dwell: DwellTime) {
        self.submit(AnalyticsRecord::DwellTime(dwell));
    }

    fn log_section_analytics(
        &self,
        zone: &str,
        visitor_count: usize,
        male_count: usize,
        female_count: usize,
        recorded_at: DateTime<Utc>,
    ) {
        self.submit(AnalyticsRecord::SectionAnalytics(SectionAnalytics {
            zone: zone.to_string(),
            visitor_count,
            male_count,
            female_count,
            recorded_at,
        }));
    }

    fn log_cashier_status(&self, queue_length: usize, is_busy: bool, recorded_at: DateTime<Utc>) {
        self.submit(AnalyticsRecord::CashierStatus(CashierStatus { queue_length, is_busy, recorded_at }));
    }

    fn log_system_status(&self, active_count: usize, camera_status: CameraStatus, recorded_at: DateTime<Utc>) {
        self.submit(AnalyticsRecord::SystemStatus(SystemStatus { active_count, camera_status, recorded_at }));
    }
}

/// A record as persisted: unique id, site, then the record's own fields
#[derive(Debug, Clone, Serialize)]
pub struct SiteRecord {
    /// UUIDv7, time-ordered
    pub id: String,
    pub site: String,
    #[serde(flatten)]
    pub record: AnalyticsRecord,
}

impl SiteRecord {
    pub fn new(site: &str, record: AnalyticsRecord) -> Self {
        Self { id: uuid::Uuid::now_v7().to_string(), site: site.to_string(), record }
    }

    pub fn kind(&self) -> &'static str {
        self.record.kind()
    }
}

struct Consumer {
    name: &'static str,
    tx: mpsc::Sender<SiteRecord>,
}

/// Sender handle for analytics records
///
/// Clone this to share across producers. Consumers are fixed once the
/// sender is cloned into the engine.
#[derive(Clone)]
pub struct RecordSender {
    site_id: String,
    consumers: Vec<Arc<Consumer>>,
    metrics: Option<Arc<Metrics>>,
    /// Rate-limits drop warnings to 1 per second
    last_drop_warn: Arc<Mutex<Option<Instant>>>,
}

impl RecordSender {
    pub fn new(site_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            consumers: Vec::new(),
            metrics: None,
            last_drop_warn: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a sender that counts dropped records
    pub fn with_metrics(site_id: &str, metrics: Arc<Metrics>) -> Self {
        Self { metrics: Some(metrics), ..Self::new(site_id) }
    }

    /// Add a consumer with its own bounded queue
    pub fn subscribe(&mut self, name: &'static str, capacity: usize) -> mpsc::Receiver<SiteRecord> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.consumers.push(Arc::new(Consumer { name, tx }));
        rx
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    fn warn_dropped(&self, consumer: &str, kind: &str) {
        let mut last = self.last_drop_warn.lock();
        if last.map_or(true, |at| at.elapsed() > Duration::from_secs(1)) {
            warn!(consumer = %consumer, kind = %kind, "record_dropped: channel full");
            *last = Some(Instant::now());
        }
    }
}

impl AnalyticsSink for RecordSender {
    fn submit(&self, record: AnalyticsRecord) {
        let record = SiteRecord::new(&self.site_id, record);
        for consumer in &self.consumers {
            match consumer.tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    if let Some(ref metrics) = self.metrics {
                        metrics.record_record_dropped();
                    }
                    self.warn_dropped(consumer.name, dropped.kind());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(consumer = %consumer.name, "record_consumer_closed");
                }
            }
        }
    }
}

/// Create a record sender with one consumer
///
/// Further consumers are added with `RecordSender::subscribe`.
pub fn create_record_channel(
    site_id: &str,
    consumer: &'static str,
    capacity: usize,
    metrics: Arc<Metrics>,
) -> (RecordSender, mpsc::Receiver<SiteRecord>) {
    let mut sender = RecordSender::with_metrics(site_id, metrics);
    let rx = sender.subscribe(consumer, capacity);
    (sender, rx)
}
