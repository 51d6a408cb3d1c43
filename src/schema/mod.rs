//! Topic schemas: human-authored templates compiled into MQTT filters.
//!
//! A template such as `Aranetest/+/sensors/<sensorId>/<metadataName>` becomes
//! the subscription filter `Aranetest/+/sensors/+/+` plus the positions of the
//! placeholders, which are later used to pull identifiers out of a topic.

/// Template compilation and ordered schema matching.
pub mod registry;
/// MQTT topic/filter validation and wildcard comparison.
pub mod topic;

pub use registry::{RoutingResult, TopicSchema, TopicSchemaRegistry, TopicType};
pub use topic::filter_matches;
