//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving camera detection frames
//! - `camera_status` - Per-camera liveness derived from frame arrivals
//! - `inference` - HTTP client for the attribute inference service
//! - `egress_channel` - Fan-out channel for analytics records
//! - `egress` - Analytics record output to file (JSONL format)
//! - `mqtt_egress` - MQTT publisher for analytics records
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod camera_status;
pub mod egress;
pub mod egress_channel;
pub mod inference;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;

// Re-export commonly used types
pub use camera_status::CameraMonitor;
pub use egress::Egress;
pub use egress_channel::{create_record_channel, AnalyticsSink, RecordSender, SiteRecord};
pub use inference::HttpInference;
pub use mqtt::start_detection_ingest;
pub use mqtt_egress::MqttPublisher;
