//! Periodic rollups sampled from the registry
//!
//! Two independent wall-clock schedules:
//! - aggregation tick: cleanup, per-section visitor counts, cashier queue status
//! - status tick: active identity count and camera health

use crate::domain::records::{AnalyticsRecord, CashierStatus, SystemStatus};
use crate::domain::types::CameraStatus;
use crate::infra::config::Thresholds;
use crate::services::registry::IdentityRegistry;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

pub struct AggregationScheduler {
    aggregation_tick: Duration,
    status_tick: Duration,
    busy_threshold: usize,
    last_aggregation: Option<DateTime<Utc>>,
    last_status: Option<DateTime<Utc>>,
}

impl AggregationScheduler {
    pub fn new(thresholds: &Thresholds) -> Self {
        Self {
            aggregation_tick: thresholds.aggregation_tick,
            status_tick: thresholds.status_tick,
            busy_threshold: thresholds.cashier_busy_threshold,
            last_aggregation: None,
            last_status: None,
        }
    }

    /// Run whichever schedules are due. The first poll only arms the timers.
    pub fn poll(
        &mut self,
        now: DateTime<Utc>,
        registry: &mut IdentityRegistry,
        camera_status: CameraStatus,
    ) -> Vec<AnalyticsRecord> {
        let mut records = Vec::new();

        if Self::due(&mut self.last_aggregation, self.aggregation_tick, now) {
            records.extend(self.aggregate(now, registry));
        }
        if Self::due(&mut self.last_status, self.status_tick, now) {
            records.push(self.status(now, registry, camera_status));
        }

        records
    }

    fn due(last: &mut Option<DateTime<Utc>>, tick: Duration, now: DateTime<Utc>) -> bool {
        match *last {
            None => {
                *last = Some(now);
                false
            }
            Some(at) if now - at >= tick => {
                *last = Some(now);
                true
            }
            Some(_) => false,
        }
    }

    /// Aggregation tick body: cleanup, then section and cashier records.
    ///
    /// Records produced by cleanup (trailing dwells) come first.
    pub fn aggregate(&self, now: DateTime<Utc>, registry: &mut IdentityRegistry) -> Vec<AnalyticsRecord> {
        registry.cleanup(now);
        let mut records = registry.drain_records();

        for section in registry.take_section_counts(now) {
            if section.visitor_count > 0 {
                debug!(zone = %section.zone, visitors = %section.visitor_count, "section_counted");
                records.push(AnalyticsRecord::SectionAnalytics(section));
            }
        }

        let queue_length = registry.queue_length();
        records.push(AnalyticsRecord::CashierStatus(CashierStatus {
            queue_length,
            is_busy: queue_length > self.busy_threshold,
            recorded_at: now,
        }));

        records
    }

    /// Status tick body
    pub fn status(
        &self,
        now: DateTime<Utc>,
        registry: &IdentityRegistry,
        camera_status: CameraStatus,
    ) -> AnalyticsRecord {
        // No feed at all means nothing is observable
        let active_count = match camera_status {
            CameraStatus::NoCameras => 0,
            _ => registry.active_count(),
        };
        AnalyticsRecord::SystemStatus(SystemStatus { active_count, camera_status, recorded_at: now })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signature::{AppearanceSignature, SIGNATURE_LEN};
    use crate::domain::types::{BoundingBox, CameraId, LocalTrackId};
    use crate::infra::Config;
    use chrono::TimeZone;

    fn t(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds((secs * 1000.0) as i64)
    }

    fn pattern(k: usize) -> AppearanceSignature {
        let mut values = vec![0.0f32; SIGNATURE_LEN];
        values[2 * k] = 1.0;
        values[2 * k + 1] = -1.0;
        AppearanceSignature::from_values(values)
    }

    fn detect(reg: &mut IdentityRegistry, camera: u32, local: i64, x: i32, y: i32, secs: f64) {
        reg.resolve_signature(
            CameraId(camera),
            LocalTrackId(local),
            pattern(local as usize),
            BoundingBox::new(x - 10, y - 20, x + 10, y + 20),
            t(secs),
        )
        .unwrap();
    }

    fn cashier(records: &[AnalyticsRecord]) -> &CashierStatus {
        records
            .iter()
            .find_map(|r| match r {
                AnalyticsRecord::CashierStatus(c) => Some(c),
                _ => None,
            })
            .unwrap()
    }

    fn setup() -> (IdentityRegistry, AggregationScheduler) {
        let config = Config::default();
        (IdentityRegistry::new(&config), AggregationScheduler::new(config.thresholds()))
    }

    #[test]
    fn test_section_records_distinct_and_non_zero() {
        let (mut reg, scheduler) = setup();
        detect(&mut reg, 0, 1, 100, 100, 0.0);
        detect(&mut reg, 0, 2, 120, 100, 0.5);
        detect(&mut reg, 0, 3, 140, 100, 1.0);
        detect(&mut reg, 0, 1, 110, 100, 1.5);

        let records = scheduler.aggregate(t(2.0), &mut reg);
        let sections: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                AnalyticsRecord::SectionAnalytics(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].zone, "Clothing");
        assert_eq!(sections[0].visitor_count, 3);

        // Reset right after
        let records = scheduler.aggregate(t(3.0), &mut reg);
        assert!(!records.iter().any(|r| matches!(r, AnalyticsRecord::SectionAnalytics(_))));
    }

    #[test]
    fn test_cashier_busy_threshold() {
        let (mut reg, scheduler) = setup();
        detect(&mut reg, 1, 0, 200, 200, 0.0);
        detect(&mut reg, 1, 1, 250, 200, 0.0);
        let status = cashier(&scheduler.aggregate(t(1.0), &mut reg)).clone();
        assert_eq!(status.queue_length, 2);
        assert!(!status.is_busy);

        detect(&mut reg, 1, 2, 300, 200, 1.0);
        let status = cashier(&scheduler.aggregate(t(2.0), &mut reg)).clone();
        assert_eq!(status.queue_length, 3);
        assert!(status.is_busy);
    }

    #[test]
    fn test_aggregate_runs_cleanup() {
        let (mut reg, scheduler) = setup();
        detect(&mut reg, 0, 1, 100, 100, 0.0);
        let records = scheduler.aggregate(t(10.5), &mut reg);
        assert_eq!(reg.active_count(), 0);
        assert_eq!(reg.lost_count(), 0);
        // Trailing Clothing dwell, then the cashier record
        assert!(matches!(records.first(), Some(AnalyticsRecord::DwellTime(_))));
        assert!(matches!(records.last(), Some(AnalyticsRecord::CashierStatus(_))));
    }

    #[test]
    fn test_schedules_are_independent() {
        let (mut reg, mut scheduler) = setup();
        assert!(scheduler.poll(t(0.0), &mut reg, CameraStatus::Ok).is_empty());

        let records = scheduler.poll(t(3.0), &mut reg, CameraStatus::Ok);
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], AnalyticsRecord::SystemStatus(_)));

        let records = scheduler.poll(t(5.0), &mut reg, CameraStatus::Ok);
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], AnalyticsRecord::CashierStatus(_)));

        assert!(scheduler.poll(t(5.5), &mut reg, CameraStatus::Ok).is_empty());
        let records = scheduler.poll(t(6.0), &mut reg, CameraStatus::Ok);
        assert!(matches!(records[..], [AnalyticsRecord::SystemStatus(_)]));
    }

    #[test]
    fn test_status_reports_active_count() {
        let (mut reg, scheduler) = setup();
        detect(&mut reg, 0, 1, 100, 100, 0.0);
        detect(&mut reg, 0, 2, 400, 100, 0.0);

        let AnalyticsRecord::SystemStatus(status) =
            scheduler.status(t(1.0), &reg, CameraStatus::NoSignal(CameraId(0)))
        else {
            panic!("expected system status");
        };
        assert_eq!(status.active_count, 2);
        assert_eq!(status.camera_status, CameraStatus::NoSignal(CameraId(0)));

        let AnalyticsRecord::SystemStatus(status) = scheduler.status(t(1.0), &reg, CameraStatus::NoCameras)
        else {
            panic!("expected system status");
        };
        assert_eq!(status.active_count, 0);
    }
}
