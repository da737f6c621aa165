//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `registry` - Global identity resolution, track lifecycle and dwell accounting
//! - `zone_map` - Point-in-zone classification per camera
//! - `attribute_smoother` - Emotion majority vote over recent observations
//! - `attributes` - Async attribute inference worker and cache
//! - `aggregation` - Section, cashier and system status schedules
//! - `engine` - Event loop that owns the registry

pub mod aggregation;
pub mod attribute_smoother;
pub mod attributes;
pub mod engine;
pub mod registry;
pub mod zone_map;

// Re-export commonly used types
pub use aggregation::AggregationScheduler;
pub use attributes::{
    attribute_worker_from_config, create_attribute_worker, AttributeClient, AttributeInference,
    AttributeWorker,
};
pub use engine::Engine;
pub use registry::IdentityRegistry;
