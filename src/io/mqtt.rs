//! MQTT client for receiving per-camera detection frames
//!
//! Each detector publishes one JSON message per processed frame:
//!
//! ```json
//! {"camera_id": 0, "detections": [{"track_id": 7, "bbox": [x1, y1, x2, y2], "crop": "<base64 image>"}]}
//! ```
//!
//! Box coordinates are pixels and may be integers or floats; floats are
//! rounded to the nearest pixel.

use crate::domain::types::{
    BoundingBox, CameraId, Detection, DetectionError, DetectionFrame, LocalTrackId,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::camera_status::CameraMonitor;
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use image::RgbImage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct FrameMessage {
    camera_id: u32,
    #[serde(default)]
    detections: Vec<DetectionMessage>,
}

#[derive(Debug, Deserialize)]
struct DetectionMessage {
    track_id: i64,
    bbox: [f64; 4],
    crop: String,
}

/// A decoded frame plus the number of detections that had to be skipped
#[derive(Debug)]
pub struct ParsedFrame {
    pub frame: DetectionFrame,
    pub skipped: usize,
}

/// Decode a base64 JPEG/PNG crop into RGB pixels
pub fn decode_crop(encoded: &str) -> Result<RgbImage, DetectionError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| DetectionError::UndecodableCrop(e.to_string()))?;
    let image =
        image::load_from_memory(&bytes).map_err(|e| DetectionError::UndecodableCrop(e.to_string()))?;
    let rgb = image.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(DetectionError::EmptyCrop);
    }
    Ok(rgb)
}

/// Parse a detection frame message.
///
/// Returns `None` if the message itself is malformed. Detections whose crop
/// cannot be decoded are skipped individually.
pub fn parse_detection_frame(payload: &[u8], received_at: DateTime<Utc>) -> Option<ParsedFrame> {
    let message: FrameMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "detection_frame_parse_failed");
            return None;
        }
    };

    let camera_id = CameraId(message.camera_id);
    let mut detections = Vec::with_capacity(message.detections.len());
    let mut skipped = 0;

    for det in message.detections {
        match decode_crop(&det.crop) {
            Ok(crop) => detections.push(Detection {
                local_track_id: LocalTrackId(det.track_id),
                bbox: BoundingBox::from(det.bbox),
                crop,
            }),
            Err(e) => {
                skipped += 1;
                warn!(camera = %camera_id, local_track_id = %det.track_id, error = %e, "detection_skipped");
            }
        }
    }

    Some(ParsedFrame { frame: DetectionFrame { camera_id, received_at, detections }, skipped })
}

/// Start the MQTT client and send decoded frames to the engine
///
/// Frames are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped frames are counted in metrics and logged (rate-limited).
pub async fn start_detection_ingest(
    config: &Config,
    frame_tx: mpsc::Sender<DetectionFrame>,
    cameras: Arc<CameraMonitor>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client_id = format!("visit-analytics-ingest-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    // Crops make frames far larger than the client default
    let max_packet = config.mqtt_max_packet_bytes();
    mqttoptions.set_max_packet_size(max_packet, max_packet);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client
        .subscribe(config.mqtt_topic(), QoS::AtMostOnce)
        .await
        .context("subscribing to detection topic")?;

    info!(topic = %config.mqtt_topic(), host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_subscribed");

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_at = Utc::now();
                        let Some(parsed) = parse_detection_frame(&publish.payload, received_at) else {
                            warn!(topic = %publish.topic, bytes = %publish.payload.len(), "detection_frame_invalid");
                            continue;
                        };

                        for _ in 0..parsed.skipped {
                            metrics.record_detection_skipped();
                        }
                        cameras.record_frame(parsed.frame.camera_id, received_at);
                        debug!(
                            camera = %parsed.frame.camera_id,
                            detections = %parsed.frame.detections.len(),
                            "detection_frame_received"
                        );

                        if let Err(e) = frame_tx.try_send(parsed.frame) {
                            match e {
                                TrySendError::Full(_) => {
                                    metrics.record_frame_dropped();
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!("detection_frame_dropped: channel full");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                TrySendError::Closed(_) => {
                                    warn!("detection_channel_closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn encoded_crop(width: u32, height: u32) -> String {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 120, 200]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_parse_frame() {
        let json = format!(
            r#"{{"camera_id": 1, "detections": [
                {{"track_id": 7, "bbox": [10, 20, 50, 120], "crop": "{}"}},
                {{"track_id": 8, "bbox": [60, 20, 90, 120], "crop": "{}"}}
            ]}}"#,
            encoded_crop(4, 8),
            encoded_crop(3, 6)
        );

        let parsed = parse_detection_frame(json.as_bytes(), Utc::now()).unwrap();
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.frame.camera_id, CameraId(1));
        assert_eq!(parsed.frame.detections.len(), 2);

        let first = &parsed.frame.detections[0];
        assert_eq!(first.local_track_id, LocalTrackId(7));
        assert_eq!(first.bbox, BoundingBox::new(10, 20, 50, 120));
        assert_eq!(first.crop.dimensions(), (4, 8));
        assert_eq!(first.crop.get_pixel(0, 0), &Rgb([10, 120, 200]));
    }

    #[test]
    fn test_parse_float_bbox() {
        let json = format!(
            r#"{{"camera_id": 0, "detections": [
                {{"track_id": 3, "bbox": [10.4, 20.6, 50.5, 120.0], "crop": "{}"}}
            ]}}"#,
            encoded_crop(2, 2)
        );

        let parsed = parse_detection_frame(json.as_bytes(), Utc::now()).unwrap();
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.frame.detections[0].bbox, BoundingBox::new(10, 21, 51, 120));
    }

    #[test]
    fn test_undecodable_crop_skips_detection() {
        let json = format!(
            r#"{{"camera_id": 0, "detections": [
                {{"track_id": 1, "bbox": [0, 0, 10, 10], "crop": "not base64!"}},
                {{"track_id": 2, "bbox": [0, 0, 10, 10], "crop": "aGVsbG8="}},
                {{"track_id": 3, "bbox": [0, 0, 10, 10], "crop": "{}"}}
            ]}}"#,
            encoded_crop(2, 2)
        );

        let parsed = parse_detection_frame(json.as_bytes(), Utc::now()).unwrap();
        assert_eq!(parsed.skipped, 2);
        assert_eq!(parsed.frame.detections.len(), 1);
        assert_eq!(parsed.frame.detections[0].local_track_id, LocalTrackId(3));
    }

    #[test]
    fn test_empty_frame_is_valid() {
        let parsed = parse_detection_frame(br#"{"camera_id": 0}"#, Utc::now()).unwrap();
        assert!(parsed.frame.detections.is_empty());
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(parse_detection_frame(b"not json", Utc::now()).is_none());
        assert!(parse_detection_frame(br#"{"detections": []}"#, Utc::now()).is_none());
    }

    #[test]
    fn test_decode_crop_errors() {
        assert!(matches!(decode_crop("%%%"), Err(DetectionError::UndecodableCrop(_))));
        assert!(decode_crop(&encoded_crop(5, 5)).is_ok());
    }
}
