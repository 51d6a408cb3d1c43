//! # sensor-ingest - MQTT sensor telemetry ingestion
//!
//! Subscribes to MQTT topics described by human-authored templates, classifies
//! each message by its topic, and stores measurements and metadata for the
//! sensor named in the topic. Sensors flagged inactive in the store are
//! skipped, using a cache kept current from the store's change feed.
//!
//! ## Core Concepts
//!
//! - **Topic schema**: a template such as `test/<sensorId>/<metadataName>`
//!   compiled into an MQTT filter plus placeholder positions
//! - **Inactive cache**: lock-free set of sensors whose messages are dropped
//! - **Connection manager**: connect, subscribe, keepalive and reconnect with
//!   capped backoff
//! - **Router**: per-message match, gate, store, acknowledge
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sensor_ingest::{InboundMessage, TopicSchemaRegistry};
//!
//! let registry = TopicSchemaRegistry::from_template_list(
//!     "Aranetest/+/sensors/<sensorId>/json/measurements, test/<sensorId>/<metadataName>",
//! )?;
//! let (_, fields) = registry.route("test/77/name").unwrap();
//! assert_eq!(fields.sensor_id, "77");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Topic schemas and gating
pub mod cache;
pub mod error;
pub mod schema;

// Persistence and change feed
pub mod store;
pub mod watcher;

// Broker side
pub mod connection;
pub mod dispatcher;
pub mod router;
pub mod transport;

// Wiring
pub mod config;
pub mod logging;
pub mod service;

pub use cache::{GatingPolicy, InactiveEntityCache};
pub use config::{IngestSettings, LogFormat, LoggingSettings, MqttSettings, Settings};
pub use connection::{Backoff, ConnectionManager, ConnectionState};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use error::{ConfigError, IngestError, IngestResult, ParseError, StoreError, TransportError};
pub use router::{MessageRouter, RouteOutcome};
pub use schema::{RoutingResult, TopicSchema, TopicSchemaRegistry, TopicType};
pub use service::{IngestService, ShutdownHandle};
pub use store::{InMemorySensorStore, SensorStore};
pub use transport::{BrokerTransport, Delivery, InboundMessage, QualityOfService};
pub use watcher::ChangeFeedWatcher;
