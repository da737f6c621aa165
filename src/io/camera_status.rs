//! Camera feed liveness
//!
//! The ingest task stamps every frame; the engine reads the derived status
//! on each status tick.

use crate::domain::types::{CameraId, CameraStatus};
use crate::infra::config::Config;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub struct CameraMonitor {
    primary: CameraId,
    timeout: Duration,
    last_frame: Mutex<FxHashMap<CameraId, DateTime<Utc>>>,
}

impl CameraMonitor {
    pub fn new(primary: CameraId, timeout: Duration) -> Self {
        Self { primary, timeout, last_frame: Mutex::new(FxHashMap::default()) }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.primary_camera(), Duration::milliseconds(config.camera_timeout_ms() as i64))
    }

    pub fn record_frame(&self, camera: CameraId, at: DateTime<Utc>) {
        let mut last_frame = self.last_frame.lock();
        let entry = last_frame.entry(camera).or_insert(at);
        *entry = (*entry).max(at);
    }

    /// Health of the feeds as of `now`
    pub fn status(&self, now: DateTime<Utc>) -> CameraStatus {
        let last_frame = self.last_frame.lock();
        let live = |camera: &CameraId| {
            last_frame.get(camera).is_some_and(|&at| now - at <= self.timeout)
        };

        if !last_frame.keys().any(live) {
            CameraStatus::NoCameras
        } else if !live(&self.primary) {
            CameraStatus::NoSignal(self.primary)
        } else {
            CameraStatus::Ok
        }
    }
}
