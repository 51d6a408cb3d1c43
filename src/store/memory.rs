//! In-memory sensor store.
//!
//! Records are schema-less: metadata and measurements are ordered string-keyed
//! maps, so any field named by a topic can be set without a fixed struct. The
//! change feed is a `tokio::sync::broadcast` channel; each watcher gets its own
//! receiver.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::error::StoreError;

use super::traits::{ActiveFlagChange, ActiveFlagStream, FieldUpdate, SensorStore, TopicUpdate};

const CHANGE_FEED_CAPACITY: usize = 1024;

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

/// A sensor document.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorRecord {
    pub id: String,
    pub topics: BTreeSet<String>,
    /// Whether messages from this sensor should be processed.
    pub is_active: bool,
    pub metadata: Map<String, Value>,
    pub latest_measurements: Option<Map<String, Value>>,
    pub latest_measurement_timestamp: Option<DateTime<Utc>>,
}

impl SensorRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            topics: BTreeSet::new(),
            is_active: true,
            metadata: Map::new(),
            latest_measurements: None,
            latest_measurement_timestamp: None,
        }
    }
}

/// One stored measurement.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub measurements: Map<String, Value>,
}

/// A recorded metadata change.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataHistoryEntry {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub field: String,
    pub value: String,
}

#[derive(Debug, Default)]
struct StoreState {
    sensors: BTreeMap<String, SensorRecord>,
    measurements: Vec<MeasurementRecord>,
    metadata_history: Vec<MetadataHistoryEntry>,
}

/// Thread-safe in-memory implementation of [`SensorStore`].
#[derive(Debug)]
pub struct InMemorySensorStore {
    state: RwLock<StoreState>,
    changes: broadcast::Sender<ActiveFlagChange>,
}

impl Default for InMemorySensorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySensorStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            changes,
        }
    }

    /// Set a sensor's activation flag, creating the sensor if needed.
    ///
    /// A change event is published only when the flag actually changes.
    pub fn set_active(&self, id: &str, active: bool) -> Result<(), StoreError> {
        let changed = {
            let mut state = self.state.write().map_err(|_| lock_err("sensors"))?;
            let record = state
                .sensors
                .entry(id.to_string())
                .or_insert_with(|| SensorRecord::new(id));
            let changed = record.is_active != active;
            record.is_active = active;
            changed
        };

        if changed {
            // No receivers is fine: nobody is watching yet.
            let _ = self.changes.send(ActiveFlagChange {
                id: id.to_string(),
                active,
            });
            debug!(sensor_id = id, active, "activation flag changed");
        }
        Ok(())
    }

    pub fn sensor(&self, id: &str) -> Result<Option<SensorRecord>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("sensors"))?;
        Ok(state.sensors.get(id).cloned())
    }

    pub fn sensor_count(&self) -> Result<usize, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("sensors"))?;
        Ok(state.sensors.len())
    }

    /// All measurements stored for a sensor, in insertion order.
    pub fn measurements(&self, id: &str) -> Result<Vec<MeasurementRecord>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("measurements"))?;
        Ok(state
            .measurements
            .iter()
            .filter(|m| m.sensor_id == id)
            .cloned()
            .collect())
    }

    pub fn metadata_history(&self, id: &str) -> Result<Vec<MetadataHistoryEntry>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("metadata_history"))?;
        Ok(state
            .metadata_history
            .iter()
            .filter(|m| m.sensor_id == id)
            .cloned()
            .collect())
    }

    /// Number of live change-feed subscribers.
    pub fn watcher_count(&self) -> usize {
        self.changes.receiver_count()
    }
}

#[async_trait]
impl SensorStore for InMemorySensorStore {
    async fn find_inactive_ids(&self) -> Result<HashSet<String>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("sensors"))?;
        Ok(state
            .sensors
            .values()
            .filter(|s| !s.is_active)
            .map(|s| s.id.clone())
            .collect())
    }

    async fn watch_active_flag_changes(&self) -> Result<ActiveFlagStream, StoreError> {
        let stream = BroadcastStream::new(self.changes.subscribe()).map(|item| {
            item.map_err(|e| StoreError::FeedInterrupted(e.to_string()))
        });
        Ok(Box::pin(stream))
    }

    async fn upsert_field(&self, id: &str, field: &str, value: &str) -> Result<FieldUpdate, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("sensors"))?;

        let outcome = match state.sensors.get_mut(id) {
            None => {
                let mut record = SensorRecord::new(id);
                record.metadata.insert(field.to_string(), Value::String(value.to_string()));
                state.sensors.insert(id.to_string(), record);
                FieldUpdate::Created
            }
            Some(record) => {
                let new_value = Value::String(value.to_string());
                if record.metadata.get(field) == Some(&new_value) {
                    FieldUpdate::Unchanged
                } else {
                    record.metadata.insert(field.to_string(), new_value);
                    FieldUpdate::Updated
                }
            }
        };

        if outcome != FieldUpdate::Unchanged {
            state.metadata_history.push(MetadataHistoryEntry {
                sensor_id: id.to_string(),
                timestamp: Utc::now(),
                field: field.to_string(),
                value: value.to_string(),
            });
        }

        match outcome {
            FieldUpdate::Created => info!(sensor_id = id, field, value, "created sensor with metadata field"),
            FieldUpdate::Updated => info!(sensor_id = id, field, value, "updated metadata field"),
            FieldUpdate::Unchanged => debug!(sensor_id = id, field, "metadata field unchanged"),
        }

        Ok(outcome)
    }

    async fn append_measurement(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("measurements"))?;

        state.measurements.push(MeasurementRecord {
            sensor_id: id.to_string(),
            timestamp,
            measurements: fields.clone(),
        });

        // Only existing sensors carry a latest-measurement snapshot.
        if let Some(record) = state.sensors.get_mut(id) {
            record.latest_measurements = Some(fields);
            record.latest_measurement_timestamp = Some(timestamp);
        }

        info!(sensor_id = id, %timestamp, "saved measurements");
        Ok(())
    }

    async fn record_topic_seen(&self, id: &str, topic: &str) -> Result<TopicUpdate, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_err("sensors"))?;

        let outcome = match state.sensors.get_mut(id) {
            None => {
                let mut record = SensorRecord::new(id);
                record.topics.insert(topic.to_string());
                state.sensors.insert(id.to_string(), record);
                TopicUpdate::Created
            }
            Some(record) => {
                if record.topics.insert(topic.to_string()) {
                    TopicUpdate::Added
                } else {
                    TopicUpdate::AlreadyKnown
                }
            }
        };

        debug!(sensor_id = id, topic, ?outcome, "recorded topic");
        Ok(outcome)
    }
}
