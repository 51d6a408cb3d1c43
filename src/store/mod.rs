//! Sensor store interface consumed by the router and the watcher.
//!
//! The persistence technology is not part of this crate's core; backends
//! implement [`SensorStore`]. An in-memory backend is provided for embedded
//! use, tests, and as a reference implementation.

mod memory;
mod traits;

pub use memory::{InMemorySensorStore, MeasurementRecord, MetadataHistoryEntry, SensorRecord};
pub use traits::{ActiveFlagChange, ActiveFlagStream, FieldUpdate, SensorStore, TopicUpdate};
