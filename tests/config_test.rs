//! Integration tests for configuration loading

use chrono::Duration;
use std::io::Write;
use tempfile::NamedTempFile;
use visit_analytics::domain::types::CameraId;
use visit_analytics::infra::Config;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let config_content = r#"
[site]
id = "store-12"

[mqtt]
host = "broker.local"
port = 1884
topic = "store12/cameras/+/detections"

[cameras]
ids = [1, 2, 3]
primary = 2
timeout_ms = 8000

[zones]
sections = ["Shoes", "Cashier Queue"]
queue_zone = "Cashier Queue"

[[zones.rects]]
camera = 1
name = "Shoes"
rect = [0, 0, 300, 400]

[[zones.rects]]
camera = 3
name = "Cashier Queue"
rect = [50, 50, 600, 400]

[[adjacency]]
from = 1
to = 2

[[adjacency]]
from = 2
to = 3

[thresholds]
rematch_similarity = 0.6
confirmation_delay_ms = 4000
cashier_busy_threshold = 4

[attributes]
enabled = true
url = "http://inference:8500/analyze"
resubmit_interval_ms = 2000

[egress]
file = "/var/lib/analytics/records.jsonl"

[mqtt_egress]
enabled = true
topic_prefix = "store12/analytics"

[metrics]
interval_secs = 15
prometheus_port = 9091
"#;
    let temp_file = write_config(config_content);

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "store-12");
    assert_eq!(config.mqtt_host(), "broker.local");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.camera_ids(), &[CameraId(1), CameraId(2), CameraId(3)]);
    assert_eq!(config.primary_camera(), CameraId(2));
    assert_eq!(config.adjacency(), &[(CameraId(1), CameraId(2)), (CameraId(2), CameraId(3))]);
    assert_eq!(config.section_zones(), &["Shoes".to_string(), "Cashier Queue".to_string()]);
    assert_eq!(config.zone_rects().len(), 2);
    assert_eq!(config.thresholds().rematch_similarity, 0.6);
    assert_eq!(config.thresholds().confirmation_delay, Duration::seconds(4));
    assert_eq!(config.thresholds().cashier_busy_threshold, 4);
    // Unspecified thresholds keep their defaults
    assert_eq!(config.thresholds().spatial_similarity, 0.35);
    assert!(config.attributes_enabled());
    assert_eq!(config.attributes_resubmit_interval_ms(), 2000);
    assert_eq!(config.egress_file(), "/var/lib/analytics/records.jsonl");
    assert!(config.mqtt_egress_enabled());
    assert_eq!(config.mqtt_egress_topic_prefix(), "store12/analytics");
    assert_eq!(config.prometheus_port(), 9091);
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml").unwrap();
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_malformed_file_is_fatal() {
    let temp_file = write_config("[mqtt\nhost = ");
    assert!(Config::load_from_path(temp_file.path()).is_err());
}

#[test]
fn test_overlapping_zones_rejected() {
    let temp_file = write_config(
        r#"
[zones]
sections = ["A", "B"]
queue_zone = "B"

[[zones.rects]]
camera = 0
name = "A"
rect = [0, 0, 200, 200]

[[zones.rects]]
camera = 0
name = "B"
rect = [100, 100, 300, 300]
"#,
    );
    let err = Config::load_from_path(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("overlap"));
}

#[test]
fn test_reserved_zone_name_rejected() {
    let temp_file = write_config(
        r#"
[zones]
sections = ["Walkway"]
queue_zone = "Walkway"

[[zones.rects]]
camera = 0
name = "Walkway"
rect = [0, 0, 200, 200]
"#,
    );
    assert!(Config::load_from_path(temp_file.path()).is_err());
}

#[test]
fn test_unknown_adjacency_camera_rejected() {
    let temp_file = write_config(
        r#"
[[adjacency]]
from = 0
to = 7
"#,
    );
    let err = Config::load_from_path(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("camera 7"));
}
