//! Per-message routing.
//!
//! For each delivery: match the topic against the schema registry, gate on the
//! inactive-sensor cache, then run the topic-seen record and the type-specific
//! store call as two spawned tasks. The delivery is acknowledged only if both
//! succeed. Store failures leave it unacknowledged; redelivery is up to the
//! broker session (see [`crate::config::MqttSettings::redelivery_expected`]).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cache::InactiveEntityCache;
use crate::error::{IngestError, IngestResult, ParseError};
use crate::schema::{TopicSchemaRegistry, TopicType};
use crate::store::SensorStore;
use crate::transport::{Delivery, InboundMessage};

/// Name of the mandatory timestamp field in measurement payloads.
pub const TIME_FIELD: &str = "time";

const SECONDS_DIGITS: usize = 10;
const MILLIS_DIGITS: usize = 13;

/// A measurement payload split into its timestamp and remaining fields.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMeasurement {
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// Interpret a Unix epoch value by its digit count.
///
/// Ten digits are seconds and thirteen are milliseconds. The digit count is
/// taken from the canonical decimal form of the parsed integer, so leading
/// zeros do not count. This is a heuristic: epochs before 2001-09-09 have
/// fewer than ten digits in seconds and are rejected.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let value: i64 = raw.trim().parse().map_err(|_| ParseError::NonNumericTime {
        value: raw.to_string(),
    })?;

    let digits = value.to_string().len();
    let parsed = match digits {
        SECONDS_DIGITS => DateTime::from_timestamp(value, 0),
        MILLIS_DIGITS => DateTime::from_timestamp_millis(value),
        _ => {
            return Err(ParseError::UnsupportedTimePrecision {
                value: raw.to_string(),
                digits,
            })
        }
    };

    parsed.ok_or_else(|| ParseError::TimeOutOfRange { value: raw.to_string() })
}

/// Parse a measurement payload: a JSON object with a `time` field.
///
/// `time` may be a JSON string or integer. It is removed from the returned
/// fields.
pub fn parse_measurement(payload: &[u8]) -> Result<ParsedMeasurement, ParseError> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| ParseError::InvalidJson { message: e.to_string() })?;
    let Value::Object(mut fields) = value else {
        return Err(ParseError::NotAnObject);
    };

    let raw = match fields.remove(TIME_FIELD) {
        None | Some(Value::Null) => return Err(ParseError::MissingTime),
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(ParseError::NonNumericTime {
                value: other.to_string(),
            })
        }
    };

    let timestamp = parse_timestamp(&raw)?;
    Ok(ParsedMeasurement { timestamp, fields })
}

/// Metadata payloads are stored verbatim as text.
pub fn parse_metadata(payload: &[u8]) -> Result<String, ParseError> {
    std::str::from_utf8(payload)
        .map(str::to_string)
        .map_err(|_| ParseError::InvalidUtf8)
}

/// What happened to a routed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No schema matched the topic.
    Unmatched,
    /// The sensor is flagged inactive.
    Inactive { sensor_id: String },
    /// Both store calls succeeded.
    Stored { sensor_id: String, topic_type: TopicType },
    /// The payload could not be parsed. The topic was still recorded.
    Rejected { sensor_id: String, reason: ParseError },
}

impl RouteOutcome {
    /// Every `Ok` outcome is acknowledged; this is for logs and stats.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Inactive { .. } => "inactive",
            Self::Stored { .. } => "stored",
            Self::Rejected { .. } => "rejected",
        }
    }
}

enum Work {
    Measurement(ParsedMeasurement),
    Metadata { field: String, value: String },
}

/// Routes inbound messages to the sensor store.
pub struct MessageRouter {
    registry: Arc<TopicSchemaRegistry>,
    cache: Arc<InactiveEntityCache>,
    store: Arc<dyn SensorStore>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(registry: Arc<TopicSchemaRegistry>, cache: Arc<InactiveEntityCache>, store: Arc<dyn SensorStore>) -> Self {
        Self { registry, cache, store }
    }

    /// Route one message. `Ok` means the message is handled and may be
    /// acknowledged; `Err` means a store call failed.
    pub async fn route(&self, message: &InboundMessage) -> IngestResult<RouteOutcome> {
        let Some((schema, fields)) = self.registry.route(&message.topic) else {
            info!("no matching schema for topic");
            return Ok(RouteOutcome::Unmatched);
        };
        let sensor_id = fields.sensor_id;

        if self.cache.is_inactive(&sensor_id) {
            info!(sensor_id = %sensor_id, "sensor is inactive; skipping message");
            return Ok(RouteOutcome::Inactive { sensor_id });
        }

        let work = match schema.topic_type {
            TopicType::Measurement => parse_measurement(&message.payload).map(Work::Measurement),
            TopicType::Metadata => match fields.metadata_field_name {
                Some(field) => parse_metadata(&message.payload).map(|value| Work::Metadata { field, value }),
                None => {
                    warn!(sensor_id = %sensor_id, "metadata schema without field name");
                    return Ok(RouteOutcome::Unmatched);
                }
            },
        };

        let seen = self.spawn_record_topic(&sensor_id, &message.topic);

        match work {
            Ok(work) => {
                let handler = self.spawn_handler(&sensor_id, work);
                let (seen, handled) = tokio::join!(join(seen), join(handler));
                seen?;
                handled?;
                debug!(sensor_id = %sensor_id, "message stored");
                Ok(RouteOutcome::Stored {
                    sensor_id,
                    topic_type: schema.topic_type,
                })
            }
            Err(reason) => {
                error!(sensor_id = %sensor_id, error = %reason, "failed to parse payload; dropping");
                join(seen).await?;
                Ok(RouteOutcome::Rejected { sensor_id, reason })
            }
        }
    }

    /// Route a delivery and acknowledge it if routing succeeded.
    ///
    /// Returns true if the delivery was acknowledged.
    pub async fn handle(&self, delivery: Delivery) -> bool {
        let Delivery { message, ack } = delivery;
        let span = info_span!("message", id = %message.id, topic = %message.topic);

        async move {
            match self.route(&message).await {
                Ok(outcome) => {
                    debug!(outcome = outcome.label(), "message handled");
                    match ack.ack().await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(error = %e, "failed to acknowledge message");
                            false
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "message processing failed; leaving unacknowledged");
                    false
                }
            }
        }
        .instrument(span)
        .await
    }

    fn spawn_record_topic(&self, sensor_id: &str, topic: &str) -> JoinHandle<IngestResult<()>> {
        let store = Arc::clone(&self.store);
        let sensor_id = sensor_id.to_string();
        let topic = topic.to_string();
        tokio::spawn(
            async move {
                store.record_topic_seen(&sensor_id, &topic).await?;
                Ok::<(), IngestError>(())
            }
            .in_current_span(),
        )
    }

    fn spawn_handler(&self, sensor_id: &str, work: Work) -> JoinHandle<IngestResult<()>> {
        let store = Arc::clone(&self.store);
        let sensor_id = sensor_id.to_string();
        tokio::spawn(
            async move {
                match work {
                    Work::Measurement(m) => store.append_measurement(&sensor_id, m.timestamp, m.fields).await?,
                    Work::Metadata { field, value } => {
                        store.upsert_field(&sensor_id, &field, &value).await?;
                    }
                }
                Ok::<(), IngestError>(())
            }
            .in_current_span(),
        )
    }
}

async fn join(handle: JoinHandle<IngestResult<()>>) -> IngestResult<()> {
    handle.await.map_err(|e| IngestError::task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::cache::GatingPolicy;
    use crate::store::InMemorySensorStore;

    #[test]
    fn test_seconds_and_millis_are_same_instant() {
        let seconds = parse_measurement(br#"{"time":"1729716854"}"#).unwrap();
        let millis = parse_measurement(br#"{"time":"1729716854000"}"#).unwrap();
        assert_eq!(seconds.timestamp, millis.timestamp);
        assert_eq!(seconds.timestamp.timestamp(), 1_729_716_854);
    }

    #[test]
    fn test_numeric_time_and_field_removal() {
        let parsed = parse_measurement(br#"{"time":1729716854123,"co2":412,"temperature":21.4}"#).unwrap();
        assert_eq!(parsed.timestamp.timestamp_millis(), 1_729_716_854_123);
        assert!(!parsed.fields.contains_key(TIME_FIELD));
        assert_eq!(parsed.fields.get("co2"), Some(&json!(412)));
        assert_eq!(parsed.fields.len(), 2);
    }

    #[test]
    fn test_time_errors() {
        assert_eq!(parse_measurement(br#"{"co2":1}"#), Err(ParseError::MissingTime));
        assert_eq!(parse_measurement(br#"{"time":null}"#), Err(ParseError::MissingTime));
        assert!(matches!(
            parse_measurement(br#"{"time":"soon"}"#),
            Err(ParseError::NonNumericTime { .. })
        ));
        assert!(matches!(
            parse_measurement(br#"{"time":1729716854.5}"#),
            Err(ParseError::NonNumericTime { .. })
        ));
        assert!(matches!(
            parse_measurement(br#"{"time":true}"#),
            Err(ParseError::NonNumericTime { .. })
        ));
        assert!(matches!(
            parse_measurement(br#"{"time":"172971685"}"#),
            Err(ParseError::UnsupportedTimePrecision { digits: 9, .. })
        ));
        assert!(matches!(
            parse_measurement(br#"{"time":"00001729716854"}"#),
            Ok(ParsedMeasurement { .. })
        ));
    }

    #[test]
    fn test_payload_shape_errors() {
        assert!(matches!(parse_measurement(b"not json"), Err(ParseError::InvalidJson { .. })));
        assert_eq!(parse_measurement(b"[1,2]"), Err(ParseError::NotAnObject));
        assert_eq!(parse_metadata(&[0xff, 0xfe]), Err(ParseError::InvalidUtf8));
        assert_eq!(parse_metadata(b" Kitchen ").unwrap(), " Kitchen ");
    }

    fn router(store: Arc<InMemorySensorStore>) -> (MessageRouter, Arc<InactiveEntityCache>) {
        let registry = TopicSchemaRegistry::from_template_list(
            "Aranetest/+/sensors/<sensorId>/json/measurements, Aranetest/+/sensors/<sensorId>/<metadataName>",
        )
        .unwrap();
        let cache = Arc::new(InactiveEntityCache::new(GatingPolicy::FailOpen));
        cache.load(Vec::new());
        (MessageRouter::new(Arc::new(registry), Arc::clone(&cache), store), cache)
    }

    #[tokio::test]
    async fn test_route_measurement() {
        let store = Arc::new(InMemorySensorStore::new());
        let (router, _) = router(Arc::clone(&store));

        let topic = "Aranetest/394260700033/sensors/3002FA/json/measurements";
        let message = InboundMessage::new(topic, br#"{"time":1729716854,"co2":420}"#.to_vec());
        let outcome = router.route(&message).await.unwrap();

        assert_eq!(
            outcome,
            RouteOutcome::Stored {
                sensor_id: "3002FA".to_string(),
                topic_type: TopicType::Measurement
            }
        );
        let sensor = store.sensor("3002FA").unwrap().unwrap();
        assert!(sensor.topics.contains(topic));
        assert_eq!(store.measurements("3002FA").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_route_metadata() {
        let store = Arc::new(InMemorySensorStore::new());
        let (router, _) = router(Arc::clone(&store));

        let message = InboundMessage::new("Aranetest/394260700033/sensors/3002FA/name", b"Kitchen".to_vec());
        let outcome = router.route(&message).await.unwrap();

        assert_eq!(outcome.label(), "stored");
        let sensor = store.sensor("3002FA").unwrap().unwrap();
        assert_eq!(sensor.metadata.get("name"), Some(&json!("Kitchen")));
    }

    #[tokio::test]
    async fn test_route_unmatched_and_inactive() {
        let store = Arc::new(InMemorySensorStore::new());
        let (router, cache) = router(Arc::clone(&store));

        let unmatched = InboundMessage::new("other/topic", b"{}".to_vec());
        assert_eq!(router.route(&unmatched).await.unwrap(), RouteOutcome::Unmatched);

        cache.add("3002FA");
        let inactive = InboundMessage::new("Aranetest/1/sensors/3002FA/name", b"Kitchen".to_vec());
        assert_eq!(
            router.route(&inactive).await.unwrap(),
            RouteOutcome::Inactive {
                sensor_id: "3002FA".to_string()
            }
        );
        assert_eq!(store.sensor_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_route_rejected_still_records_topic() {
        let store = Arc::new(InMemorySensorStore::new());
        let (router, _) = router(Arc::clone(&store));

        let message = InboundMessage::new("Aranetest/1/sensors/S1/json/measurements", br#"{"co2":1}"#.to_vec());
        let outcome = router.route(&message).await.unwrap();

        assert_eq!(
            outcome,
            RouteOutcome::Rejected {
                sensor_id: "S1".to_string(),
                reason: ParseError::MissingTime
            }
        );
        assert!(store.sensor("S1").unwrap().is_some());
        assert!(store.measurements("S1").unwrap().is_empty());
    }
}
