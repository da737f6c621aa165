//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/dev.toml).
//! A missing file falls back to defaults; a file that fails to parse or
//! validate is fatal at startup.

use crate::domain::types::{BoundingBox, CameraId};
use anyhow::Context;
use chrono::Duration;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Zone names with built-in meaning that configured zones must not reuse
pub const RESERVED_ZONE_NAMES: [&str; 3] = ["None", "General", "Walkway"];

/// Static configuration that would make the registry non-deterministic or
/// meaningless
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("zone '{name}' on camera {camera} has an empty or inverted rectangle")]
    InvalidRect { camera: CameraId, name: String },
    #[error("zones '{first}' and '{second}' overlap on camera {camera}")]
    OverlappingZones { camera: CameraId, first: String, second: String },
    #[error("zone name '{0}' is reserved")]
    ReservedZoneName(String),
    #[error("zone '{0}' is referenced but not configured on any camera")]
    UnknownZone(String),
    #[error("camera {0} is referenced but not listed in [cameras].ids")]
    UnknownCamera(CameraId),
    #[error("threshold {name} is invalid: {reason}")]
    InvalidThreshold { name: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "store-12")
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "store".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Detection frames topic filter
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Frames carry base64 crops, so this is well above the rumqttc default
    pub max_packet_bytes: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            topic: "cameras/+/detections".to_string(),
            username: None,
            password: None,
            max_packet_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CamerasConfig {
    pub ids: Vec<u32>,
    /// Camera whose signal loss is reported as NO SIGNAL
    pub primary: u32,
    /// A camera with no frame for this long counts as offline
    pub timeout_ms: u64,
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self { ids: vec![0, 1], primary: 0, timeout_ms: 5000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneRectConfig {
    pub camera: u32,
    pub name: String,
    /// [x1, y1, x2, y2], bounds inclusive
    pub rect: [i32; 4],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZonesConfig {
    /// Zones reported in section analytics
    pub sections: Vec<String>,
    /// Zone whose occupancy is the cashier queue length
    pub queue_zone: String,
    pub rects: Vec<ZoneRectConfig>,
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self {
            sections: vec![
                "Clothing".to_string(),
                "Electronics".to_string(),
                "Cashier Queue".to_string(),
            ],
            queue_zone: "Cashier Queue".to_string(),
            rects: vec![
                ZoneRectConfig { camera: 0, name: "Clothing".to_string(), rect: [0, 0, 320, 360] },
                ZoneRectConfig {
                    camera: 0,
                    name: "Electronics".to_string(),
                    rect: [320, 0, 640, 360],
                },
                ZoneRectConfig {
                    camera: 1,
                    name: "Cashier Queue".to_string(),
                    rect: [100, 100, 540, 360],
                },
            ],
        }
    }
}

/// People leaving camera `from` are expected to reappear on camera `to`
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AdjacencyConfig {
    pub from: u32,
    pub to: u32,
}

fn default_adjacency() -> Vec<AdjacencyConfig> {
    vec![AdjacencyConfig { from: 0, to: 1 }]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub rematch_similarity: f64,
    pub spatial_similarity: f64,
    pub spatial_radius_px: f64,
    pub spatial_recovery_window_ms: u64,
    pub visual_reid_window_ms: u64,
    pub signature_smoothing: f64,
    pub confirmation_delay_ms: u64,
    pub dwell_noise_filter_ms: u64,
    pub active_timeout_ms: u64,
    pub lost_finalize_timeout_ms: u64,
    pub emotion_buffer_size: usize,
    pub aggregation_tick_ms: u64,
    pub status_tick_ms: u64,
    pub cashier_busy_threshold: usize,
    pub identity_ttl_ms: u64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            rematch_similarity: 0.50,
            spatial_similarity: 0.35,
            spatial_radius_px: 250.0,
            spatial_recovery_window_ms: 10_000,
            visual_reid_window_ms: 120_000,
            signature_smoothing: 0.3,
            confirmation_delay_ms: 5_000,
            dwell_noise_filter_ms: 2_000,
            active_timeout_ms: 3_000,
            lost_finalize_timeout_ms: 10_000,
            emotion_buffer_size: 7,
            aggregation_tick_ms: 5_000,
            status_tick_ms: 3_000,
            cashier_busy_threshold: 2,
            identity_ttl_ms: 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttributesConfig {
    pub enabled: bool,
    /// Inference endpoint accepting `{"image": <base64 jpeg>}`
    pub url: String,
    pub queue_capacity: usize,
    pub resubmit_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for AttributesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8500/analyze".to_string(),
            queue_capacity: 5,
            resubmit_interval_ms: 1000,
            timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// File path for analytics records (JSONL format)
    pub file: String,
    pub channel_capacity: usize,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: "analytics.jsonl".to_string(), channel_capacity: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttEgressConfig {
    pub enabled: bool,
    /// Records publish to `<topic_prefix>/<kind>`
    pub topic_prefix: String,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self { enabled: false, topic_prefix: "analytics".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10, prometheus_port: 9090 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub cameras: CamerasConfig,
    #[serde(default)]
    pub zones: ZonesConfig,
    #[serde(default = "default_adjacency")]
    pub adjacency: Vec<AdjacencyConfig>,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub attributes: AttributesConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// One configured zone rectangle
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRect {
    pub camera: CameraId,
    pub name: String,
    pub rect: BoundingBox,
}

/// Numeric tuning for identity resolution, dwell accounting, and aggregation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Visual re-id acceptance (strictly greater than)
    pub rematch_similarity: f64,
    /// Spatial recovery appearance check (strictly greater than)
    pub spatial_similarity: f64,
    pub spatial_radius_px: f64,
    pub spatial_recovery_window: Duration,
    pub visual_reid_window: Duration,
    /// Weight of the new observation when blending signatures
    pub signature_smoothing: f64,
    pub confirmation_delay: Duration,
    pub dwell_noise_filter: Duration,
    pub active_timeout: Duration,
    pub lost_finalize_timeout: Duration,
    pub emotion_buffer_size: usize,
    pub aggregation_tick: Duration,
    pub status_tick: Duration,
    /// Queue is busy when its length exceeds this
    pub cashier_busy_threshold: usize,
    /// Identities with no track state are forgotten after this long unseen
    pub identity_ttl: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_toml(&ThresholdsConfig::default())
    }
}

impl Thresholds {
    fn from_toml(t: &ThresholdsConfig) -> Self {
        let ms = |v: u64| Duration::milliseconds(v.min(i64::MAX as u64) as i64);
        Self {
            rematch_similarity: t.rematch_similarity,
            spatial_similarity: t.spatial_similarity,
            spatial_radius_px: t.spatial_radius_px,
            spatial_recovery_window: ms(t.spatial_recovery_window_ms),
            visual_reid_window: ms(t.visual_reid_window_ms),
            signature_smoothing: t.signature_smoothing,
            confirmation_delay: ms(t.confirmation_delay_ms),
            dwell_noise_filter: ms(t.dwell_noise_filter_ms),
            active_timeout: ms(t.active_timeout_ms),
            lost_finalize_timeout: ms(t.lost_finalize_timeout_ms),
            emotion_buffer_size: t.emotion_buffer_size,
            aggregation_tick: ms(t.aggregation_tick_ms),
            status_tick: ms(t.status_tick_ms),
            cashier_busy_threshold: t.cashier_busy_threshold,
            identity_ttl: ms(t.identity_ttl_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let similarity = |name, v: f64| {
            if (-1.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::InvalidThreshold { name, reason: "must be within [-1, 1]" })
            }
        };
        similarity("rematch_similarity", self.rematch_similarity)?;
        similarity("spatial_similarity", self.spatial_similarity)?;

        if !(0.0..=1.0).contains(&self.signature_smoothing) {
            return Err(ConfigError::InvalidThreshold {
                name: "signature_smoothing",
                reason: "must be within [0, 1]",
            });
        }
        if self.spatial_radius_px.is_nan() || self.spatial_radius_px <= 0.0 {
            return Err(ConfigError::InvalidThreshold {
                name: "spatial_radius_px",
                reason: "must be positive",
            });
        }
        if self.emotion_buffer_size == 0 {
            return Err(ConfigError::InvalidThreshold {
                name: "emotion_buffer_size",
                reason: "must be at least 1",
            });
        }

        let positive = [
            ("spatial_recovery_window_ms", self.spatial_recovery_window),
            ("visual_reid_window_ms", self.visual_reid_window),
            ("active_timeout_ms", self.active_timeout),
            ("lost_finalize_timeout_ms", self.lost_finalize_timeout),
            ("aggregation_tick_ms", self.aggregation_tick),
            ("status_tick_ms", self.status_tick),
            ("identity_ttl_ms", self.identity_ttl),
        ];
        for (name, value) in positive {
            if value <= Duration::zero() {
                return Err(ConfigError::InvalidThreshold { name, reason: "must be positive" });
            }
        }
        Ok(())
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_max_packet_bytes: usize,
    camera_ids: Vec<CameraId>,
    primary_camera: CameraId,
    camera_timeout_ms: u64,
    zone_rects: Vec<ZoneRect>,
    section_zones: Vec<String>,
    queue_zone: String,
    adjacency: Vec<(CameraId, CameraId)>,
    thresholds: Thresholds,
    attributes_enabled: bool,
    attributes_url: String,
    attributes_queue_capacity: usize,
    attributes_resubmit_interval_ms: u64,
    attributes_timeout_ms: u64,
    egress_file: String,
    egress_channel_capacity: usize,
    mqtt_egress_enabled: bool,
    mqtt_egress_topic_prefix: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig { adjacency: default_adjacency(), ..TomlConfig::default() }, "default")
    }
}

impl Config {
    fn from_toml(t: TomlConfig, config_file: &str) -> Self {
        Self {
            site_id: t.site.id,
            mqtt_host: t.mqtt.host,
            mqtt_port: t.mqtt.port,
            mqtt_topic: t.mqtt.topic,
            mqtt_username: t.mqtt.username,
            mqtt_password: t.mqtt.password,
            mqtt_max_packet_bytes: t.mqtt.max_packet_bytes,
            camera_ids: t.cameras.ids.into_iter().map(CameraId).collect(),
            primary_camera: CameraId(t.cameras.primary),
            camera_timeout_ms: t.cameras.timeout_ms,
            zone_rects: t
                .zones
                .rects
                .into_iter()
                .map(|z| ZoneRect {
                    camera: CameraId(z.camera),
                    name: z.name,
                    rect: BoundingBox::from(z.rect.map(f64::from)),
                })
                .collect(),
            section_zones: t.zones.sections,
            queue_zone: t.zones.queue_zone,
            adjacency: t.adjacency.iter().map(|a| (CameraId(a.from), CameraId(a.to))).collect(),
            thresholds: Thresholds::from_toml(&t.thresholds),
            attributes_enabled: t.attributes.enabled,
            attributes_url: t.attributes.url,
            attributes_queue_capacity: t.attributes.queue_capacity,
            attributes_resubmit_interval_ms: t.attributes.resubmit_interval_ms,
            attributes_timeout_ms: t.attributes.timeout_ms,
            egress_file: t.egress.file,
            egress_channel_capacity: t.egress.channel_capacity,
            mqtt_egress_enabled: t.mqtt_egress.enabled,
            mqtt_egress_topic_prefix: t.mqtt_egress.topic_prefix,
            metrics_interval_secs: t.metrics.interval_secs,
            prometheus_port: t.metrics.prometheus_port,
            config_file: config_file.to_string(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config file {}", source))?;
        let config = Self::from_toml(toml_config, source);
        config.validate().with_context(|| format!("Invalid config file {}", source))?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults only when the file is absent
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(config_file = %path.display(), "config_file_missing_using_defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Reject zone and threshold misconfiguration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, zone) in self.zone_rects.iter().enumerate() {
            if RESERVED_ZONE_NAMES.contains(&zone.name.as_str()) {
                return Err(ConfigError::ReservedZoneName(zone.name.clone()));
            }
            if zone.rect.is_degenerate() {
                return Err(ConfigError::InvalidRect {
                    camera: zone.camera,
                    name: zone.name.clone(),
                });
            }
            // Shared edges are fine: classification is first-match and inclusive
            for other in self.zone_rects[..i].iter().filter(|o| o.camera == zone.camera) {
                let a = zone.rect;
                let b = other.rect;
                if a.x1.max(b.x1) < a.x2.min(b.x2) && a.y1.max(b.y1) < a.y2.min(b.y2) {
                    return Err(ConfigError::OverlappingZones {
                        camera: zone.camera,
                        first: other.name.clone(),
                        second: zone.name.clone(),
                    });
                }
            }
        }

        let is_configured = |name: &str| self.zone_rects.iter().any(|z| z.name == name);
        for section in self.section_zones.iter().chain(std::iter::once(&self.queue_zone)) {
            if !is_configured(section) {
                return Err(ConfigError::UnknownZone(section.clone()));
            }
        }

        let referenced = std::iter::once(self.primary_camera)
            .chain(self.adjacency.iter().flat_map(|&(from, to)| [from, to]))
            .chain(self.zone_rects.iter().map(|z| z.camera));
        for camera in referenced {
            if !self.camera_ids.contains(&camera) {
                return Err(ConfigError::UnknownCamera(camera));
            }
        }

        self.thresholds.validate()
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_max_packet_bytes(&self) -> usize {
        self.mqtt_max_packet_bytes
    }

    pub fn camera_ids(&self) -> &[CameraId] {
        &self.camera_ids
    }

    pub fn primary_camera(&self) -> CameraId {
        self.primary_camera
    }

    pub fn camera_timeout_ms(&self) -> u64 {
        self.camera_timeout_ms
    }

    pub fn zone_rects(&self) -> &[ZoneRect] {
        &self.zone_rects
    }

    pub fn section_zones(&self) -> &[String] {
        &self.section_zones
    }

    pub fn queue_zone(&self) -> &str {
        &self.queue_zone
    }

    pub fn adjacency(&self) -> &[(CameraId, CameraId)] {
        &self.adjacency
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn attributes_enabled(&self) -> bool {
        self.attributes_enabled
    }

    pub fn attributes_url(&self) -> &str {
        &self.attributes_url
    }

    pub fn attributes_queue_capacity(&self) -> usize {
        self.attributes_queue_capacity
    }

    pub fn attributes_resubmit_interval_ms(&self) -> u64 {
        self.attributes_resubmit_interval_ms
    }

    pub fn attributes_timeout_ms(&self) -> u64 {
        self.attributes_timeout_ms
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn egress_channel_capacity(&self) -> usize {
        self.egress_channel_capacity
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_topic_prefix(&self) -> &str {
        &self.mqtt_egress_topic_prefix
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to override thresholds
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Builder method for tests to replace the zone layout
    pub fn with_zones(mut self, rects: Vec<ZoneRect>, sections: Vec<String>, queue_zone: &str) -> Self {
        self.zone_rects = rects;
        self.section_zones = sections;
        self.queue_zone = queue_zone.to_string();
        self
    }
}
