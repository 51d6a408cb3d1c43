//! Template compilation and ordered schema matching.
//!
//! Templates combine literal levels with two placeholders:
//! - `<sensorId>` (required, exactly once)
//! - `<metadataName>` (optional; its presence makes the schema metadata-typed)
//!
//! Matching walks schemas in registration order and the first hit wins.
//! Overlapping schemas are allowed; ordering is the tie-break.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

use super::topic::{self, SEPARATOR, SINGLE_LEVEL};

/// Placeholder marking the sensor id level.
pub const SENSOR_ID_PLACEHOLDER: &str = "<sensorId>";
/// Placeholder marking the metadata field name level.
pub const METADATA_NAME_PLACEHOLDER: &str = "<metadataName>";

/// What kind of payload a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicType {
    /// JSON object with a mandatory `time` field.
    Measurement,
    /// A single metadata value; the field name comes from the topic.
    Metadata,
}

/// A compiled topic template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSchema {
    /// The template as written in configuration.
    pub template: String,
    /// Subscription filter with every placeholder replaced by `+`.
    pub filter_template: String,
    pub topic_type: TopicType,
    /// Level index of `<sensorId>`.
    pub sensor_id_position: usize,
    /// Level index of `<metadataName>`; set iff `topic_type` is `Metadata`.
    pub metadata_name_position: Option<usize>,
}

impl TopicSchema {
    /// Compile a template into a schema.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidTemplate` when the template has no (or more
    /// than one) `<sensorId>` level, more than one `<metadataName>` level, an
    /// empty level, a placeholder embedded in literal text, or an invalid
    /// wildcard.
    pub fn compile(template: &str) -> Result<Self, ConfigError> {
        let template = template.trim();
        let invalid = |reason: &str| ConfigError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        if template.is_empty() {
            return Err(invalid("template is empty"));
        }

        let mut sensor_id_position = None;
        let mut metadata_name_position = None;
        let mut levels = Vec::new();

        for (idx, level) in template.split(SEPARATOR).enumerate() {
            match level {
                "" => return Err(invalid("template contains an empty level")),
                SENSOR_ID_PLACEHOLDER => {
                    if sensor_id_position.replace(idx).is_some() {
                        return Err(invalid("<sensorId> may appear only once"));
                    }
                    levels.push(SINGLE_LEVEL);
                }
                METADATA_NAME_PLACEHOLDER => {
                    if metadata_name_position.replace(idx).is_some() {
                        return Err(invalid("<metadataName> may appear only once"));
                    }
                    levels.push(SINGLE_LEVEL);
                }
                other if other.contains(SENSOR_ID_PLACEHOLDER) || other.contains(METADATA_NAME_PLACEHOLDER) => {
                    return Err(invalid("placeholders must occupy a whole level"));
                }
                other => levels.push(other),
            }
        }

        let Some(sensor_id_position) = sensor_id_position else {
            return Err(invalid("template must contain a <sensorId> level"));
        };

        let filter_template = levels.join("/");
        topic::validate_filter(&filter_template).map_err(|e| match e {
            ConfigError::InvalidTemplate { reason, .. } => invalid(&reason),
            other => other,
        })?;

        let topic_type = if metadata_name_position.is_some() {
            TopicType::Metadata
        } else {
            TopicType::Measurement
        };

        Ok(Self {
            template: template.to_string(),
            filter_template,
            topic_type,
            sensor_id_position,
            metadata_name_position,
        })
    }

    /// Returns true if this schema's filter matches `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        topic::filter_matches(&self.filter_template, topic)
    }

    /// Pull the identifiers out of a topic matched by this schema.
    ///
    /// Returns `None` if a placeholder position lies beyond the topic's levels,
    /// which only happens when a `#` filter matched a shorter topic.
    pub fn extract_fields(&self, topic: &str) -> Option<RoutingResult> {
        let levels: Vec<&str> = topic.split(SEPARATOR).collect();
        let sensor_id = levels.get(self.sensor_id_position)?;

        let metadata_field_name = match self.metadata_name_position {
            Some(pos) => Some((*levels.get(pos)?).to_string()),
            None => None,
        };

        Some(RoutingResult {
            sensor_id: (*sensor_id).to_string(),
            topic_type: self.topic_type,
            metadata_field_name,
        })
    }
}

/// Identifiers derived from a topic and its matching schema.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingResult {
    pub sensor_id: String,
    pub topic_type: TopicType,
    /// Present for metadata topics.
    pub metadata_field_name: Option<String>,
}

/// Ordered, immutable list of compiled schemas.
#[derive(Debug, Clone, Default)]
pub struct TopicSchemaRegistry {
    schemas: Vec<TopicSchema>,
}

impl TopicSchemaRegistry {
    /// Build a registry from already compiled schemas (order is preserved).
    #[must_use]
    pub fn new(schemas: Vec<TopicSchema>) -> Self {
        Self { schemas }
    }

    /// Compile a comma-separated template list.
    ///
    /// Whitespace around each template is trimmed and empty entries are
    /// ignored.
    pub fn from_template_list(list: &str) -> Result<Self, ConfigError> {
        let schemas = list
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(TopicSchema::compile)
            .collect::<Result<Vec<_>, _>>()?;

        if schemas.is_empty() {
            return Err(ConfigError::NoTemplates);
        }

        Ok(Self::new(schemas))
    }

    /// Find the first registered schema whose filter matches `topic`.
    ///
    /// A string that is not a valid topic name (empty, wildcards, NUL)
    /// matches nothing.
    pub fn match_topic(&self, topic: &str) -> Option<&TopicSchema> {
        if topic::validate_topic(topic).is_err() {
            return None;
        }
        self.schemas.iter().find(|s| s.matches(topic))
    }

    /// Match and extract in one step.
    pub fn route(&self, topic: &str) -> Option<(&TopicSchema, RoutingResult)> {
        let schema = self.match_topic(topic)?;
        let fields = schema.extract_fields(topic)?;
        Some((schema, fields))
    }

    /// Subscription filters in registration order, without duplicates.
    pub fn filters(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.schemas.len());
        for schema in &self.schemas {
            if !out.contains(&schema.filter_template) {
                out.push(schema.filter_template.clone());
            }
        }
        out
    }

    pub fn schemas(&self) -> &[TopicSchema] {
        &self.schemas
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
