//! Abstract sensor store contract.

use std::collections::HashSet;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_stream::Stream;

use crate::error::StoreError;

/// A change of a sensor's activation flag.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveFlagChange {
    pub id: String,
    pub active: bool,
}

/// Long-lived stream of activation-flag changes.
pub type ActiveFlagStream = Pin<Box<dyn Stream<Item = Result<ActiveFlagChange, StoreError>> + Send>>;

/// Outcome of a per-field upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUpdate {
    /// The sensor did not exist and was created.
    Created,
    /// The field changed value.
    Updated,
    /// The field already had this value.
    Unchanged,
}

/// Outcome of recording a topic for a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicUpdate {
    /// The sensor did not exist and was created.
    Created,
    /// The topic was added to an existing sensor.
    Added,
    /// The sensor already listed this topic.
    AlreadyKnown,
}

/// Storage contract for sensor records, measurements and activation flags.
///
/// Implementations must be safe to call from many tasks at once. Concurrent
/// writes to the same sensor resolve as last-writer-wins.
#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Ids of every sensor whose activation flag is false.
    async fn find_inactive_ids(&self) -> Result<HashSet<String>, StoreError>;

    /// Open a change feed filtered to activation-flag changes only.
    async fn watch_active_flag_changes(&self) -> Result<ActiveFlagStream, StoreError>;

    /// Set one named metadata field on a sensor, creating the sensor if needed.
    async fn upsert_field(&self, id: &str, field: &str, value: &str) -> Result<FieldUpdate, StoreError>;

    /// Append a measurement and make it the sensor's latest.
    async fn append_measurement(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Add `topic` to the set of topics a sensor has been seen on.
    async fn record_topic_seen(&self, id: &str, topic: &str) -> Result<TopicUpdate, StoreError>;
}
