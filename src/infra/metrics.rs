//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap). Scrapes read a
//! cumulative copy of the histogram through `snapshot()` and never reset.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// Monotonic counters are never reset; the interval latency histogram and
/// the per-interval frame count are swapped to zero by `report()`.
pub struct Metrics {
    /// Detection frames processed (monotonic)
    frames_total: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Detections resolved to a global identity (monotonic)
    detections_total: AtomicU64,
    /// Detections skipped as unusable input (monotonic)
    detections_skipped: AtomicU64,
    /// Frame processing latency (reset on report)
    latency_sum_us: AtomicU64,
    latency_max_us: AtomicU64,
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Frame processing latency since startup (monotonic)
    latency_sum_total_us: AtomicU64,
    latency_max_total_us: AtomicU64,
    latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    identities_created: AtomicU64,
    visual_matches: AtomicU64,
    spatial_recoveries: AtomicU64,
    tracks_lost: AtomicU64,
    tracks_finalized: AtomicU64,
    identities_expired: AtomicU64,
    visits_confirmed: AtomicU64,
    dwell_records: AtomicU64,
    /// Records dropped because a sink channel was full or closed
    records_dropped: AtomicU64,
    /// Frames dropped at ingest because the engine channel was full
    frames_dropped: AtomicU64,
    attribute_requests_submitted: AtomicU64,
    attribute_requests_dropped: AtomicU64,
    attribute_requests_throttled: AtomicU64,
    inference_failures: AtomicU64,
    /// Gauges (point-in-time, set by the engine)
    active_tracks: AtomicU64,
    lost_tracks: AtomicU64,
    queue_length: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            detections_total: AtomicU64::new(0),
            detections_skipped: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_sum_total_us: AtomicU64::new(0),
            latency_max_total_us: AtomicU64::new(0),
            latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            identities_created: AtomicU64::new(0),
            visual_matches: AtomicU64::new(0),
            spatial_recoveries: AtomicU64::new(0),
            tracks_lost: AtomicU64::new(0),
            tracks_finalized: AtomicU64::new(0),
            identities_expired: AtomicU64::new(0),
            visits_confirmed: AtomicU64::new(0),
            dwell_records: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            attribute_requests_submitted: AtomicU64::new(0),
            attribute_requests_dropped: AtomicU64::new(0),
            attribute_requests_throttled: AtomicU64::new(0),
            inference_failures: AtomicU64::new(0),
            active_tracks: AtomicU64::new(0),
            lost_tracks: AtomicU64::new(0),
            queue_length: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a frame was processed with given latency (lock-free)
    #[inline]
    pub fn record_frame_processed(&self, detections: u64, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.detections_total.fetch_add(detections, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
        self.latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_total_us, latency_us);
    }

    #[inline]
    pub fn record_detection_skipped(&self) {
        self.detections_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_identity_created(&self) {
        self.identities_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_visual_match(&self) {
        self.visual_matches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_spatial_recovery(&self) {
        self.spatial_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_track_lost(&self) {
        self.tracks_lost.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_track_finalized(&self) {
        self.tracks_finalized.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_identity_expired(&self) {
        self.identities_expired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_visit_confirmed(&self) {
        self.visits_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dwell(&self) {
        self.dwell_records.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_attribute_submitted(&self) {
        self.attribute_requests_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_attribute_dropped(&self) {
        self.attribute_requests_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_attribute_throttled(&self) {
        self.attribute_requests_throttled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inference_failure(&self) {
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Set track gauges (called by the engine after each tick)
    #[inline]
    pub fn set_track_counts(&self, active: usize, lost: usize) {
        self.active_tracks.store(active as u64, Ordering::Relaxed);
        self.lost_tracks.store(lost as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_queue_length(&self, len: usize) {
        self.queue_length.store(len as u64, Ordering::Relaxed);
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn detections_skipped(&self) -> u64 {
        self.detections_skipped.load(Ordering::Relaxed)
    }

    pub fn identities_created(&self) -> u64 {
        self.identities_created.load(Ordering::Relaxed)
    }

    pub fn spatial_recoveries(&self) -> u64 {
        self.spatial_recoveries.load(Ordering::Relaxed)
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    pub fn attribute_requests_dropped(&self) -> u64 {
        self.attribute_requests_dropped.load(Ordering::Relaxed)
    }

    pub fn attribute_requests_throttled(&self) -> u64 {
        self.attribute_requests_throttled.load(Ordering::Relaxed)
    }

    pub fn inference_failures(&self) -> u64 {
        self.inference_failures.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let frames_count = self.frames_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames_per_sec = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if frames_count > 0 { latency_sum / frames_count } else { 0 };

        self.summary(frames_per_sec, avg_latency, max_latency, lat_buckets)
    }

    /// Cumulative view for scrapers; reads only, nothing is reset
    ///
    /// The histogram and latency figures cover every frame since startup, so
    /// repeated scrapes see monotonic bucket counts and do not take samples
    /// away from the periodic `report()`.
    pub fn snapshot(&self) -> MetricsSummary {
        let frames_total = self.frames_total.load(Ordering::Relaxed);
        let latency_sum = self.latency_sum_total_us.load(Ordering::Relaxed);
        let avg_latency = if frames_total > 0 { latency_sum / frames_total } else { 0 };

        let elapsed = self.last_report_time.lock().elapsed().as_secs_f64();
        let frames_per_sec = if elapsed > 0.0 {
            self.frames_since_report.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        };

        self.summary(
            frames_per_sec,
            avg_latency,
            self.latency_max_total_us.load(Ordering::Relaxed),
            load_buckets(&self.latency_buckets_total),
        )
    }

    fn summary(
        &self,
        frames_per_sec: f64,
        avg_latency: u64,
        max_latency: u64,
        lat_buckets: [u64; NUM_BUCKETS],
    ) -> MetricsSummary {
        MetricsSummary {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_per_sec,
            detections_total: self.detections_total.load(Ordering::Relaxed),
            detections_skipped: self.detections_skipped.load(Ordering::Relaxed),
            avg_process_latency_us: avg_latency,
            max_process_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            identities_created: self.identities_created.load(Ordering::Relaxed),
            visual_matches: self.visual_matches.load(Ordering::Relaxed),
            spatial_recoveries: self.spatial_recoveries.load(Ordering::Relaxed),
            tracks_lost: self.tracks_lost.load(Ordering::Relaxed),
            tracks_finalized: self.tracks_finalized.load(Ordering::Relaxed),
            identities_expired: self.identities_expired.load(Ordering::Relaxed),
            visits_confirmed: self.visits_confirmed.load(Ordering::Relaxed),
            dwell_records: self.dwell_records.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            attribute_requests_submitted: self.attribute_requests_submitted.load(Ordering::Relaxed),
            attribute_requests_dropped: self.attribute_requests_dropped.load(Ordering::Relaxed),
            attribute_requests_throttled: self.attribute_requests_throttled.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            active_tracks: self.active_tracks.load(Ordering::Relaxed),
            lost_tracks: self.lost_tracks.load(Ordering::Relaxed),
            queue_length: self.queue_length.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub detections_total: u64,
    pub detections_skipped: u64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    /// Frame processing latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub identities_created: u64,
    pub visual_matches: u64,
    pub spatial_recoveries: u64,
    pub tracks_lost: u64,
    pub tracks_finalized: u64,
    pub identities_expired: u64,
    pub visits_confirmed: u64,
    pub dwell_records: u64,
    pub records_dropped: u64,
    pub frames_dropped: u64,
    pub attribute_requests_submitted: u64,
    pub attribute_requests_dropped: u64,
    pub attribute_requests_throttled: u64,
    pub inference_failures: u64,
    pub active_tracks: u64,
    pub lost_tracks: u64,
    pub queue_length: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            frames_per_sec = format!("{:.1}", self.frames_per_sec),
            detections_total = %self.detections_total,
            avg_latency_us = %self.avg_process_latency_us,
            max_latency_us = %self.max_process_latency_us,
            p99_us = %self.lat_p99_us,
            active_tracks = %self.active_tracks,
            lost_tracks = %self.lost_tracks,
            identities = %self.identities_created,
            visits = %self.visits_confirmed,
            records_dropped = %self.records_dropped,
            frames_dropped = %self.frames_dropped,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.frames_total(), 0);
        assert_eq!(metrics.identities_created(), 0);
    }

    #[test]
    fn test_record_frame() {
        let metrics = Metrics::new();

        metrics.record_frame_processed(3, 100);
        assert_eq!(metrics.frames_total(), 1);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_frame_processed(2, 200);
        assert_eq!(metrics.frames_total(), 2);
        assert_eq!(metrics.detections_total.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_frame_processed(1, 100);
        metrics.record_frame_processed(1, 200);
        metrics.record_frame_processed(1, 300);
        metrics.record_identity_created();
        metrics.set_track_counts(4, 1);

        let summary = metrics.report();

        assert_eq!(summary.frames_total, 3);
        assert_eq!(summary.avg_process_latency_us, 200);
        assert_eq!(summary.max_process_latency_us, 300);
        assert_eq!(summary.identities_created, 1);
        assert_eq!(summary.active_tracks, 4);
        assert_eq!(summary.lost_tracks, 1);

        // Periodic counters should be reset
        assert_eq!(metrics.frames_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 0);
        // Monotonic counters are not
        assert_eq!(metrics.frames_total(), 3);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(2, 150);
        metrics.record_frame_processed(1, 900);

        let first = metrics.snapshot();
        let second = metrics.snapshot();
        assert_eq!(first.lat_buckets, second.lat_buckets);
        assert_eq!(first.lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(second.avg_process_latency_us, 525);
        assert_eq!(second.max_process_latency_us, 900);

        // The periodic report still sees both frames
        let summary = metrics.report();
        assert_eq!(summary.lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(summary.max_process_latency_us, 900);
    }

    #[test]
    fn test_snapshot_histogram_survives_report() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(1, 150);
        metrics.report();
        metrics.record_frame_processed(1, 150);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.lat_buckets[1], 2);
        assert_eq!(snapshot.frames_total, 2);
        assert_eq!(metrics.report().lat_buckets[1], 1);
    }

    #[test]
    fn test_report_empty() {
        let summary = Metrics::new().report();
        assert_eq!(summary.frames_total, 0);
        assert_eq!(summary.avg_process_latency_us, 0);
        assert_eq!(summary.lat_p99_us, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_frame_processed(1, i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.frames_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_frame_processed(1, 150);
        }

        let summary = metrics.report();
        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }
}
