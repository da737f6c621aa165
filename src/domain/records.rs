//! Analytics records handed to the persistence sinks
//!
//! One variant per sink write operation. Records serialize with a `kind` tag
//! so a single JSONL stream or MQTT topic tree can carry all of them.

use crate::domain::types::{CameraStatus, Gender, GlobalId};
use chrono::{DateTime, Local, NaiveDate, Timelike, Utc};
use serde::Serialize;

/// One confirmed visit, bucketed by local calendar date and hour
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitorEntry {
    pub count: u32,
    pub date: NaiveDate,
    pub hour: u32,
}

impl VisitorEntry {
    /// A single visit confirmed at `at`
    pub fn single(at: DateTime<Utc>) -> Self {
        let local = at.with_timezone(&Local);
        Self { count: 1, date: local.date_naive(), hour: local.hour() }
    }
}

/// Time one identity spent inside one named zone
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DwellTime {
    pub global_id: GlobalId,
    pub zone: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub gender: Gender,
    pub emotion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionAnalytics {
    pub zone: String,
    /// Distinct identities seen in the zone during the interval
    pub visitor_count: usize,
    pub male_count: usize,
    pub female_count: usize,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CashierStatus {
    pub queue_length: usize,
    pub is_busy: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub active_count: usize,
    pub camera_status: CameraStatus,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalyticsRecord {
    VisitorEntry(VisitorEntry),
    DwellTime(DwellTime),
    SectionAnalytics(SectionAnalytics),
    CashierStatus(CashierStatus),
    SystemStatus(SystemStatus),
}

impl AnalyticsRecord {
    /// Stable record kind, used as the MQTT topic suffix
    pub fn kind(&self) -> &'static str {
        match self {
            AnalyticsRecord::VisitorEntry(_) => "visitor_entry",
            AnalyticsRecord::DwellTime(_) => "dwell_time",
            AnalyticsRecord::SectionAnalytics(_) => "section_analytics",
            AnalyticsRecord::CashierStatus(_) => "cashier_status",
            AnalyticsRecord::SystemStatus(_) => "system_status",
        }
    }
}
