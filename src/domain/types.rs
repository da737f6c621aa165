//! Shared types for the visit analytics pipeline

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize, Serializer};
use std::str::FromStr;

/// Newtype wrapper for camera feed indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CameraId(pub u32);

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Track ID assigned by a camera's detector. Only unique per camera and not
/// stable across detection gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LocalTrackId(pub i64);

impl std::fmt::Display for LocalTrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Site-wide identity of one physical person
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct GlobalId(pub u64);

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pixel-space point
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis-aligned box in frame pixels, `(x1, y1)` top-left and `(x2, y2)` bottom-right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Point {
        Point::new(
            (f64::from(self.x1) + f64::from(self.x2)) / 2.0,
            (f64::from(self.y1) + f64::from(self.y2)) / 2.0,
        )
    }

    pub fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})-({},{})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// Detectors may publish sub-pixel coordinates; round to the nearest pixel
impl From<[f64; 4]> for BoundingBox {
    fn from(b: [f64; 4]) -> Self {
        let [x1, y1, x2, y2] = b.map(|v| v.round() as i32);
        Self::new(x1, y1, x2, y2)
    }
}

/// A detection that cannot be used for identity resolution
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DetectionError {
    #[error("appearance crop has zero area")]
    EmptyCrop,
    #[error("bounding box {0} has no area")]
    DegenerateBox(BoundingBox),
    #[error("appearance crop could not be decoded: {0}")]
    UndecodableCrop(String),
}

/// One tracked person in one camera frame
#[derive(Debug, Clone)]
pub struct Detection {
    pub local_track_id: LocalTrackId,
    pub bbox: BoundingBox,
    pub crop: RgbImage,
}

/// All detections reported by one camera for one frame
#[derive(Debug, Clone)]
pub struct DetectionFrame {
    pub camera_id: CameraId,
    pub received_at: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Gender {
    Man,
    Woman,
    #[default]
    Unknown,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Man => "Man",
            Gender::Woman => "Woman",
            Gender::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = std::convert::Infallible;

    /// Lenient: anything unrecognized maps to `Unknown`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "man" | "male" | "m" => Gender::Man,
            "woman" | "female" | "f" | "w" => Gender::Woman,
            _ => Gender::Unknown,
        })
    }
}

/// Raw estimate from the attribute inference service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attributes {
    pub gender: Gender,
    /// `None` when the service could not estimate an age ("?")
    pub age: Option<u32>,
    pub emotion: Option<String>,
}

impl Attributes {
    /// Placeholder stored when inference fails
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn age_label(&self) -> String {
        self.age.map_or_else(|| "?".to_string(), |a| a.to_string())
    }
}

/// Attributes plus the moment they were produced
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeObservation {
    pub attributes: Attributes,
    pub observed_at: DateTime<Utc>,
}

/// Zone classification of a point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ZoneLabel {
    /// No classification yet (fresh identity)
    #[default]
    Unassigned,
    /// Camera has no zones configured
    General,
    /// Camera has zones but the point is outside all of them
    Walkway,
    Named(String),
}

impl ZoneLabel {
    pub fn as_str(&self) -> &str {
        match self {
            ZoneLabel::Unassigned => "None",
            ZoneLabel::General => "General",
            ZoneLabel::Walkway => "Walkway",
            ZoneLabel::Named(name) => name,
        }
    }

    /// Only named zones accrue dwell time
    pub fn is_named(&self) -> bool {
        matches!(self, ZoneLabel::Named(_))
    }
}

impl std::fmt::Display for ZoneLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of the camera feeds as reported in system status records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStatus {
    Ok,
    NoSignal(CameraId),
    NoCameras,
}

impl std::fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraStatus::Ok => f.write_str("OK"),
            CameraStatus::NoSignal(cam) => write!(f, "NO SIGNAL: CAM {}", cam),
            CameraStatus::NoCameras => f.write_str("NO CAMERAS"),
        }
    }
}

impl Serialize for CameraStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_center() {
        let bbox = BoundingBox::new(90, 150, 110, 250);
        assert_eq!(bbox.center(), Point::new(100.0, 200.0));
    }

    #[test]
    fn test_bbox_degenerate() {
        assert!(BoundingBox::new(10, 10, 10, 50).is_degenerate());
        assert!(BoundingBox::new(10, 50, 40, 20).is_degenerate());
        assert!(!BoundingBox::new(0, 0, 1, 1).is_degenerate());
    }

    #[test]
    fn test_bbox_from_float_rounds() {
        assert_eq!(BoundingBox::from([10.4, 20.6, 50.5, 120.0]), BoundingBox::new(10, 21, 51, 120));
    }

    #[test]
    fn test_point_distance() {
        let a = Point::new(100.0, 200.0);
        let b = Point::new(120.0, 210.0);
        assert!((a.distance(&b) - 22.360679).abs() < 1e-5);
    }

    #[test]
    fn test_gender_parse_lenient() {
        assert_eq!("Man".parse::<Gender>().unwrap(), Gender::Man);
        assert_eq!("female".parse::<Gender>().unwrap(), Gender::Woman);
        assert_eq!("".parse::<Gender>().unwrap(), Gender::Unknown);
        assert_eq!("robot".parse::<Gender>().unwrap(), Gender::Unknown);
    }

    #[test]
    fn test_age_label() {
        assert_eq!(Attributes::unknown().age_label(), "?");
        let attrs = Attributes { age: Some(31), ..Attributes::default() };
        assert_eq!(attrs.age_label(), "31");
    }

    #[test]
    fn test_zone_label_strings() {
        assert_eq!(ZoneLabel::Unassigned.as_str(), "None");
        assert_eq!(ZoneLabel::Walkway.to_string(), "Walkway");
        assert_eq!(ZoneLabel::Named("Clothing".into()).as_str(), "Clothing");
        assert!(ZoneLabel::Named("Clothing".into()).is_named());
        assert!(!ZoneLabel::General.is_named());
    }

    #[test]
    fn test_camera_status_display() {
        assert_eq!(CameraStatus::Ok.to_string(), "OK");
        assert_eq!(CameraStatus::NoSignal(CameraId(0)).to_string(), "NO SIGNAL: CAM 0");
        assert_eq!(CameraStatus::NoCameras.to_string(), "NO CAMERAS");
        assert_eq!(serde_json::to_string(&CameraStatus::Ok).unwrap(), "\"OK\"");
    }
}
