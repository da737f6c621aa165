//! Zone transition, dwell, and visit confirmation procedures

use super::ActiveTrack;
use crate::domain::records::{DwellTime, VisitorEntry};
use crate::domain::types::{GlobalId, ZoneLabel};
use crate::services::zone_map::ZoneMap;
use chrono::{DateTime, Duration, Utc};

/// Result of a zone change for one detection
#[derive(Debug)]
pub(super) struct ZoneChange {
    /// Dwell for the zone just left, if it was named and outlasted the noise filter
    pub dwell: Option<DwellTime>,
    pub entered: ZoneLabel,
}

fn dwell_record(
    gid: GlobalId,
    track: &ActiveTrack,
    entry_time: DateTime<Utc>,
    exit_time: DateTime<Utc>,
) -> DwellTime {
    let duration = (exit_time - entry_time).max(Duration::zero());
    DwellTime {
        global_id: gid,
        zone: track.zone.as_str().to_string(),
        entry_time,
        exit_time,
        duration_seconds: duration.num_milliseconds() as f64 / 1000.0,
        gender: track.gender,
        emotion: track.emotion.clone(),
    }
}

/// Classify the track's current position and handle a zone change
pub(super) fn track_zone(
    zones: &ZoneMap,
    gid: GlobalId,
    track: &mut ActiveTrack,
    now: DateTime<Utc>,
    noise_filter: Duration,
) -> Option<ZoneChange> {
    let zone = zones.classify(track.camera, track.position.x, track.position.y);
    if zone == track.zone {
        return None;
    }

    let dwell = (track.zone.is_named() && now - track.zone_entry_at > noise_filter)
        .then(|| dwell_record(gid, track, track.zone_entry_at, now));

    track.zone = zone.clone();
    track.zone_entry_at = now;
    Some(ZoneChange { dwell, entered: zone })
}

/// Confirm the visit once the identity has been present long enough
pub(super) fn confirm(
    track: &mut ActiveTrack,
    now: DateTime<Utc>,
    delay: Duration,
) -> Option<VisitorEntry> {
    if track.confirmed || now - track.first_seen_at <= delay {
        return None;
    }
    track.confirmed = true;
    Some(VisitorEntry::single(now))
}

/// Dwell for the zone a finalized identity was last in, ending at its last
/// observation. Only the observed stay counts toward the noise filter.
pub(super) fn trailing_dwell(
    gid: GlobalId,
    track: &ActiveTrack,
    noise_filter: Duration,
) -> Option<DwellTime> {
    (track.zone.is_named() && track.last_seen_at - track.zone_entry_at > noise_filter)
        .then(|| dwell_record(gid, track, track.zone_entry_at, track.last_seen_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CameraId, Point};
    use crate::infra::Config;
    use chrono::TimeZone;

    fn t(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds((secs * 1000.0) as i64)
    }

    fn track_at(x: f64, y: f64) -> ActiveTrack {
        ActiveTrack::new(CameraId(0), Point::new(x, y), t(0.0), 7)
    }

    #[test]
    fn test_first_classification_has_no_dwell() {
        let zones = ZoneMap::new(Config::default().zone_rects());
        let mut track = track_at(100.0, 100.0);

        let change = track_zone(&zones, GlobalId(1), &mut track, t(0.0), Duration::seconds(2)).unwrap();
        assert!(change.dwell.is_none());
        assert_eq!(change.entered, ZoneLabel::Named("Clothing".into()));
        assert_eq!(track.zone_entry_at, t(0.0));
    }

    #[test]
    fn test_same_zone_is_no_change() {
        let zones = ZoneMap::new(Config::default().zone_rects());
        let mut track = track_at(100.0, 100.0);
        track_zone(&zones, GlobalId(1), &mut track, t(0.0), Duration::seconds(2));

        track.position = Point::new(120.0, 90.0);
        assert!(track_zone(&zones, GlobalId(1), &mut track, t(4.0), Duration::seconds(2)).is_none());
        assert_eq!(track.zone_entry_at, t(0.0));
    }

    #[test]
    fn test_walkway_exit_has_no_dwell() {
        let zones = ZoneMap::new(Config::default().zone_rects());
        let mut track = track_at(100.0, 500.0);
        track_zone(&zones, GlobalId(1), &mut track, t(0.0), Duration::seconds(2));
        assert_eq!(track.zone, ZoneLabel::Walkway);

        track.position = Point::new(100.0, 100.0);
        let change = track_zone(&zones, GlobalId(1), &mut track, t(10.0), Duration::seconds(2)).unwrap();
        assert!(change.dwell.is_none());
    }

    #[test]
    fn test_confirm_after_delay_once() {
        let mut track = track_at(0.0, 0.0);
        assert!(confirm(&mut track, t(5.0), Duration::seconds(5)).is_none());
        let entry = confirm(&mut track, t(5.5), Duration::seconds(5)).unwrap();
        assert_eq!(entry.count, 1);
        assert!(track.confirmed);
        assert!(confirm(&mut track, t(9.0), Duration::seconds(5)).is_none());
    }

    #[test]
    fn test_trailing_dwell_ends_at_last_seen() {
        let mut track = track_at(100.0, 100.0);
        track.zone = ZoneLabel::Named("Clothing".into());
        track.zone_entry_at = t(1.0);
        track.last_seen_at = t(4.0);

        let record = trailing_dwell(GlobalId(3), &track, Duration::seconds(2)).unwrap();
        assert_eq!(record.entry_time, t(1.0));
        assert_eq!(record.exit_time, t(4.0));
        assert_eq!(record.duration_seconds, 3.0);

        track.zone = ZoneLabel::Walkway;
        assert!(trailing_dwell(GlobalId(3), &track, Duration::seconds(2)).is_none());
    }

    #[test]
    fn test_short_trailing_stay_is_noise() {
        let mut track = track_at(100.0, 100.0);
        track.zone = ZoneLabel::Named("Clothing".into());
        track.zone_entry_at = t(0.0);
        track.last_seen_at = t(1.0);
        assert!(trailing_dwell(GlobalId(3), &track, Duration::seconds(2)).is_none());

        // Exactly at the filter is still noise
        track.last_seen_at = t(2.0);
        assert!(trailing_dwell(GlobalId(3), &track, Duration::seconds(2)).is_none());
    }
}
