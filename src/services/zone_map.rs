//! Static per-camera zone layout

use crate::domain::types::{BoundingBox, CameraId, ZoneLabel};
use crate::infra::config::ZoneRect;
use rustc_hash::FxHashMap;

/// Named rectangles per camera, in configuration order
#[derive(Debug, Clone, Default)]
pub struct ZoneMap {
    zones: FxHashMap<CameraId, Vec<(String, BoundingBox)>>,
}

impl ZoneMap {
    pub fn new(rects: &[ZoneRect]) -> Self {
        let mut zones: FxHashMap<CameraId, Vec<(String, BoundingBox)>> = FxHashMap::default();
        for zone in rects {
            zones.entry(zone.camera).or_default().push((zone.name.clone(), zone.rect));
        }
        Self { zones }
    }

    /// Classify a point. Bounds are inclusive and the first configured match
    /// wins, so a point on a shared edge belongs to the earlier zone.
    pub fn classify(&self, camera: CameraId, x: f64, y: f64) -> ZoneLabel {
        let Some(rects) = self.zones.get(&camera).filter(|r| !r.is_empty()) else {
            return ZoneLabel::General;
        };

        rects
            .iter()
            .find(|(_, r)| {
                x >= f64::from(r.x1) && x <= f64::from(r.x2) && y >= f64::from(r.y1) && y <= f64::from(r.y2)
            })
            .map_or(ZoneLabel::Walkway, |(name, _)| ZoneLabel::Named(name.clone()))
    }
}
