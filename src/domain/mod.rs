//! Domain models - core types shared by every layer
//!
//! - `types` - identifiers, geometry, detections, attributes, zone labels
//! - `signature` - appearance signatures used for re-identification
//! - `records` - analytics records handed to the persistence sinks

pub mod records;
pub mod signature;
pub mod types;

pub use records::AnalyticsRecord;
pub use signature::AppearanceSignature;
pub use types::{CameraId, GlobalId, LocalTrackId};
