//! Global identity registry
//!
//! Owns every piece of mutable identity state: the appearance table, the
//! Active and Lost track maps, the per-camera local id mapping, and the
//! per-section visitor sets. Mutation goes through `&mut self`, so the
//! registry needs exactly one owner (the engine task).
//!
//! Records produced while resolving detections or running cleanup are queued
//! in an outbox and drained by the caller.

mod dwell;
mod reid;

use crate::domain::records::{AnalyticsRecord, SectionAnalytics};
use crate::domain::signature::AppearanceSignature;
use crate::domain::types::{
    AttributeObservation, Attributes, BoundingBox, CameraId, DetectionError, Gender, GlobalId,
    LocalTrackId, Point, ZoneLabel,
};
use crate::infra::config::{Config, Thresholds};
use crate::infra::metrics::Metrics;
use crate::services::attribute_smoother::EmotionSmoother;
use crate::services::zone_map::ZoneMap;
use chrono::{DateTime, Utc};
use image::RgbImage;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Appearance memory for one identity, kept independently of track state
#[derive(Debug, Clone)]
struct GlobalIdentity {
    signature: AppearanceSignature,
    last_seen_at: DateTime<Utc>,
}

/// Live state of an identity currently being detected
#[derive(Debug, Clone)]
pub struct ActiveTrack {
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub camera: CameraId,
    /// Last bounding-box center
    pub position: Point,
    pub zone: ZoneLabel,
    pub zone_entry_at: DateTime<Utc>,
    pub confirmed: bool,
    pub gender: Gender,
    pub age: Option<u32>,
    /// Smoothed emotion label
    pub emotion: Option<String>,
    emotion_history: EmotionSmoother,
    /// Timestamp of the last applied attribute observation
    attributes_observed_at: Option<DateTime<Utc>>,
}

impl ActiveTrack {
    fn new(camera: CameraId, position: Point, now: DateTime<Utc>, emotion_capacity: usize) -> Self {
        Self {
            first_seen_at: now,
            last_seen_at: now,
            camera,
            position,
            zone: ZoneLabel::Unassigned,
            zone_entry_at: now,
            confirmed: false,
            gender: Gender::Unknown,
            age: None,
            emotion: None,
            emotion_history: EmotionSmoother::new(emotion_capacity),
            attributes_observed_at: None,
        }
    }

    pub fn emotion_history_len(&self) -> usize {
        self.emotion_history.len()
    }
}

/// An identity in its grace period after detection stopped
#[derive(Debug, Clone)]
pub struct LostTrack {
    /// Track state frozen at eviction
    pub track: ActiveTrack,
    /// Last observation time
    pub lost_at: DateTime<Utc>,
}

/// How a detection was bound to its identity
#[derive(Debug, Clone, Copy, PartialEq)]
enum MatchKind {
    Known,
    Spatial { distance: f64, similarity: f64 },
    Visual { similarity: f64 },
    New,
}

pub struct IdentityRegistry {
    thresholds: Thresholds,
    zones: ZoneMap,
    /// Exit camera -> cameras the person is expected to reappear on
    adjacency: FxHashMap<CameraId, SmallVec<[CameraId; 2]>>,
    queue_zone: String,
    identities: BTreeMap<GlobalId, GlobalIdentity>,
    active: BTreeMap<GlobalId, ActiveTrack>,
    lost: BTreeMap<GlobalId, LostTrack>,
    local_to_global: FxHashMap<(CameraId, LocalTrackId), GlobalId>,
    /// Distinct identities entering each section since the last aggregation
    section_visitors: Vec<(String, BTreeSet<GlobalId>)>,
    next_id: u64,
    outbox: Vec<AnalyticsRecord>,
    metrics: Option<Arc<Metrics>>,
}

impl IdentityRegistry {
    pub fn new(config: &Config) -> Self {
        let mut adjacency: FxHashMap<CameraId, SmallVec<[CameraId; 2]>> = FxHashMap::default();
        for &(from, to) in config.adjacency() {
            adjacency.entry(from).or_default().push(to);
        }

        Self {
            thresholds: *config.thresholds(),
            zones: ZoneMap::new(config.zone_rects()),
            adjacency,
            queue_zone: config.queue_zone().to_string(),
            identities: BTreeMap::new(),
            active: BTreeMap::new(),
            lost: BTreeMap::new(),
            local_to_global: FxHashMap::default(),
            section_visitors: config
                .section_zones()
                .iter()
                .map(|name| (name.clone(), BTreeSet::new()))
                .collect(),
            next_id: 1,
            outbox: Vec::new(),
            metrics: None,
        }
    }

    /// Create a registry with metrics recording
    pub fn with_metrics(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self { metrics: Some(metrics), ..Self::new(config) }
    }

    fn metric(&self, record: impl FnOnce(&Metrics)) {
        if let Some(ref metrics) = self.metrics {
            record(metrics);
        }
    }

    /// Bind a detection to a global identity.
    ///
    /// Unusable input (empty crop, box without area) is rejected before any
    /// state is touched.
    pub fn resolve(
        &mut self,
        camera: CameraId,
        local: LocalTrackId,
        crop: &RgbImage,
        bbox: BoundingBox,
        now: DateTime<Utc>,
    ) -> Result<GlobalId, DetectionError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(DetectionError::EmptyCrop);
        }
        if bbox.is_degenerate() {
            return Err(DetectionError::DegenerateBox(bbox));
        }

        if let Some(&gid) = self.local_to_global.get(&(camera, local)) {
            self.observe(gid, camera, bbox.center(), now, MatchKind::Known);
            return Ok(gid);
        }

        let signature = AppearanceSignature::from_crop(crop);
        Ok(self.bind_new_local(camera, local, signature, bbox.center(), now))
    }

    /// `resolve` with a precomputed appearance signature
    pub fn resolve_signature(
        &mut self,
        camera: CameraId,
        local: LocalTrackId,
        signature: AppearanceSignature,
        bbox: BoundingBox,
        now: DateTime<Utc>,
    ) -> Result<GlobalId, DetectionError> {
        if bbox.is_degenerate() {
            return Err(DetectionError::DegenerateBox(bbox));
        }

        if let Some(&gid) = self.local_to_global.get(&(camera, local)) {
            self.observe(gid, camera, bbox.center(), now, MatchKind::Known);
            return Ok(gid);
        }

        Ok(self.bind_new_local(camera, local, signature, bbox.center(), now))
    }

    /// Re-identification path for an unmapped local id
    fn bind_new_local(
        &mut self,
        camera: CameraId,
        local: LocalTrackId,
        signature: AppearanceSignature,
        position: Point,
        now: DateTime<Utc>,
    ) -> GlobalId {
        let matched = self
            .spatial_recovery(camera, position, &signature, now)
            .map(|(gid, distance, similarity)| (gid, MatchKind::Spatial { distance, similarity }))
            .or_else(|| {
                self.visual_match(&signature, now)
                    .filter(|&(_, similarity)| similarity > self.thresholds.rematch_similarity)
                    .map(|(gid, similarity)| (gid, MatchKind::Visual { similarity }))
            });

        let (gid, kind) = match matched {
            Some((gid, kind)) => {
                if let Some(identity) = self.identities.get_mut(&gid) {
                    identity.signature.blend(&signature, self.thresholds.signature_smoothing);
                }
                (gid, kind)
            }
            None => {
                let gid = GlobalId(self.next_id);
                self.next_id += 1;
                self.identities
                    .insert(gid, GlobalIdentity { signature, last_seen_at: now });
                (gid, MatchKind::New)
            }
        };

        self.local_to_global.insert((camera, local), gid);
        self.log_match(gid, camera, local, kind);
        self.observe(gid, camera, position, now, kind);
        gid
    }

    fn log_match(&self, gid: GlobalId, camera: CameraId, local: LocalTrackId, kind: MatchKind) {
        match kind {
            MatchKind::Spatial { distance, similarity } => {
                self.metric(|m| m.record_spatial_recovery());
                info!(
                    global_id = %gid,
                    camera = %camera,
                    local_track_id = %local,
                    distance_px = format!("{:.1}", distance),
                    similarity = format!("{:.3}", similarity),
                    "spatial_recovery_match"
                );
            }
            MatchKind::Visual { similarity } => {
                self.metric(|m| m.record_visual_match());
                debug!(
                    global_id = %gid,
                    camera = %camera,
                    local_track_id = %local,
                    similarity = format!("{:.3}", similarity),
                    "visual_reid_match"
                );
            }
            MatchKind::New => {
                self.metric(|m| m.record_identity_created());
                info!(global_id = %gid, camera = %camera, local_track_id = %local, "identity_created");
            }
            MatchKind::Known => {}
        }
    }

    /// Refresh an identity for a detection: activate it if needed, then run
    /// zone tracking and the confirmation check.
    fn observe(
        &mut self,
        gid: GlobalId,
        camera: CameraId,
        position: Point,
        now: DateTime<Utc>,
        kind: MatchKind,
    ) {
        if let Some(identity) = self.identities.get_mut(&gid) {
            identity.last_seen_at = identity.last_seen_at.max(now);
        }

        if !self.active.contains_key(&gid) {
            let track = match self.lost.remove(&gid) {
                Some(lost) => {
                    debug!(global_id = %gid, kind = ?kind, "track_reactivated");
                    lost.track
                }
                None => ActiveTrack::new(camera, position, now, self.thresholds.emotion_buffer_size),
            };
            self.active.insert(gid, track);
        }

        let Some(track) = self.active.get_mut(&gid) else { return };
        track.last_seen_at = track.last_seen_at.max(now);
        track.camera = camera;
        track.position = position;
        let now = track.last_seen_at;

        let change = dwell::track_zone(&self.zones, gid, track, now, self.thresholds.dwell_noise_filter);
        let visit = dwell::confirm(track, now, self.thresholds.confirmation_delay);

        if let Some(change) = change {
            if let Some(record) = change.dwell {
                self.metric(|m| m.record_dwell());
                info!(
                    global_id = %gid,
                    zone = %record.zone,
                    duration_s = format!("{:.1}", record.duration_seconds),
                    "dwell_recorded"
                );
                self.outbox.push(AnalyticsRecord::DwellTime(record));
            }
            if let ZoneLabel::Named(ref name) = change.entered {
                if let Some((_, visitors)) =
                    self.section_visitors.iter_mut().find(|(section, _)| section == name)
                {
                    visitors.insert(gid);
                }
            }
        }

        if let Some(entry) = visit {
            self.metric(|m| m.record_visit_confirmed());
            info!(global_id = %gid, hour = %entry.hour, "visit_confirmed");
            self.outbox.push(AnalyticsRecord::VisitorEntry(entry));
        }
    }

    /// Apply raw attributes to an active identity. No-op otherwise.
    pub fn update_attributes(&mut self, gid: GlobalId, attributes: &Attributes) -> bool {
        let Some(track) = self.active.get_mut(&gid) else {
            return false;
        };
        track.gender = attributes.gender;
        track.age = attributes.age;
        if let Some(ref emotion) = attributes.emotion {
            track.emotion = Some(track.emotion_history.observe(emotion).to_string());
        }
        true
    }

    /// Apply a timestamped observation once. Observations not newer than the
    /// last applied one are ignored so a cached result is voted only once.
    pub fn apply_observation(&mut self, gid: GlobalId, observation: &AttributeObservation) -> bool {
        let Some(track) = self.active.get_mut(&gid) else {
            return false;
        };
        if track.attributes_observed_at.is_some_and(|seen| observation.observed_at <= seen) {
            return false;
        }
        track.attributes_observed_at = Some(observation.observed_at);
        self.update_attributes(gid, &observation.attributes)
    }

    /// Evict stale Active tracks to Lost, finalize expired Lost tracks, and
    /// forget identities unseen past the TTL.
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let stale: Vec<GlobalId> = self
            .active
            .iter()
            .filter(|(_, t)| now - t.last_seen_at > self.thresholds.active_timeout)
            .map(|(&gid, _)| gid)
            .collect();
        for gid in stale {
            if let Some(track) = self.active.remove(&gid) {
                debug!(global_id = %gid, zone = %track.zone, camera = %track.camera, "track_lost");
                self.metric(|m| m.record_track_lost());
                let lost_at = track.last_seen_at;
                self.lost.insert(gid, LostTrack { track, lost_at });
            }
        }

        let expired: Vec<GlobalId> = self
            .lost
            .iter()
            .filter(|(_, l)| now - l.lost_at > self.thresholds.lost_finalize_timeout)
            .map(|(&gid, _)| gid)
            .collect();
        for gid in expired {
            if let Some(lost) = self.lost.remove(&gid) {
                let trailing = dwell::trailing_dwell(gid, &lost.track, self.thresholds.dwell_noise_filter);
                info!(
                    global_id = %gid,
                    zone = %lost.track.zone,
                    confirmed = %lost.track.confirmed,
                    visit_s = (lost.track.last_seen_at - lost.track.first_seen_at).num_seconds(),
                    "track_finalized"
                );
                self.metric(|m| m.record_track_finalized());
                if let Some(record) = trailing {
                    self.metric(|m| m.record_dwell());
                    self.outbox.push(AnalyticsRecord::DwellTime(record));
                }
            }
        }

        self.expire_identities(now);
    }

    fn expire_identities(&mut self, now: DateTime<Utc>) {
        let ttl = self.thresholds.identity_ttl;
        let before = self.identities.len();
        let active = &self.active;
        let lost = &self.lost;
        self.identities.retain(|gid, identity| {
            active.contains_key(gid) || lost.contains_key(gid) || now - identity.last_seen_at <= ttl
        });

        if self.identities.len() != before {
            let identities = &self.identities;
            self.local_to_global.retain(|_, gid| identities.contains_key(gid));
            let removed = before - self.identities.len();
            for _ in 0..removed {
                self.metric(|m| m.record_identity_expired());
            }
            debug!(removed = %removed, remaining = %self.identities.len(), "identities_expired");
        }
    }

    /// Distinct visitors per section since the previous call, then reset.
    /// Sections with no visitors are included with a zero count.
    pub fn take_section_counts(&mut self, now: DateTime<Utc>) -> Vec<SectionAnalytics> {
        let mut counts = Vec::with_capacity(self.section_visitors.len());
        for (zone, visitors) in &mut self.section_visitors {
            let visitors = std::mem::take(visitors);
            let mut male_count = 0;
            let mut female_count = 0;
            for gid in &visitors {
                let gender = self
                    .active
                    .get(gid)
                    .or_else(|| self.lost.get(gid).map(|l| &l.track))
                    .map_or(Gender::Unknown, |t| t.gender);
                match gender {
                    Gender::Man => male_count += 1,
                    Gender::Woman => female_count += 1,
                    Gender::Unknown => {}
                }
            }
            counts.push(SectionAnalytics {
                zone: zone.clone(),
                visitor_count: visitors.len(),
                male_count,
                female_count,
                recorded_at: now,
            });
        }
        counts
    }

    /// Active identities currently standing in the queue zone
    pub fn queue_length(&self) -> usize {
        self.active
            .values()
            .filter(|t| matches!(&t.zone, ZoneLabel::Named(name) if *name == self.queue_zone))
            .count()
    }

    /// Take all records produced since the last drain
    pub fn drain_records(&mut self) -> Vec<AnalyticsRecord> {
        std::mem::take(&mut self.outbox)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn lost_count(&self) -> usize {
        self.lost.len()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn active(&self, gid: GlobalId) -> Option<&ActiveTrack> {
        self.active.get(&gid)
    }

    pub fn lost(&self, gid: GlobalId) -> Option<&LostTrack> {
        self.lost.get(&gid)
    }

    pub fn mapping(&self, camera: CameraId, local: LocalTrackId) -> Option<GlobalId> {
        self.local_to_global.get(&(camera, local)).copied()
    }

    /// Whether the identity has Active or Lost state
    pub fn is_tracked(&self, gid: GlobalId) -> bool {
        self.active.contains_key(&gid) || self.lost.contains_key(&gid)
    }
}
