//! Re-identification passes for unmapped local tracks

use super::IdentityRegistry;
use crate::domain::signature::AppearanceSignature;
use crate::domain::types::{CameraId, GlobalId, Point};
use chrono::{DateTime, Utc};

impl IdentityRegistry {
    /// Spatial recovery: a Lost identity that left an adjacent camera
    /// recently, close to where this detection appeared, and looks similar
    /// enough. The first acceptable candidate in id order wins.
    ///
    /// Returns `(global_id, distance_px, similarity)`.
    pub(super) fn spatial_recovery(
        &self,
        camera: CameraId,
        position: Point,
        signature: &AppearanceSignature,
        now: DateTime<Utc>,
    ) -> Option<(GlobalId, f64, f64)> {
        let t = &self.thresholds;
        self.lost.iter().find_map(|(&gid, lost)| {
            let feeds_camera = self
                .adjacency
                .get(&lost.track.camera)
                .is_some_and(|targets| targets.contains(&camera));
            if !feeds_camera || now - lost.lost_at >= t.spatial_recovery_window {
                return None;
            }

            let distance = lost.track.position.distance(&position);
            if distance >= t.spatial_radius_px {
                return None;
            }

            let similarity = self.identities.get(&gid)?.signature.correlation(signature);
            (similarity > t.spatial_similarity).then_some((gid, distance, similarity))
        })
    }

    /// Visual pass: the most similar identity seen within the re-id window.
    /// Only positive similarities are candidates; ties keep the lower id.
    pub(super) fn visual_match(
        &self,
        signature: &AppearanceSignature,
        now: DateTime<Utc>,
    ) -> Option<(GlobalId, f64)> {
        let window = self.thresholds.visual_reid_window;
        let mut best: Option<(GlobalId, f64)> = None;
        for (&gid, identity) in &self.identities {
            if now - identity.last_seen_at >= window {
                continue;
            }
            let similarity = identity.signature.correlation(signature);
            if similarity > best.map_or(0.0, |(_, s)| s) {
                best = Some((gid, similarity));
            }
        }
        best
    }
}
