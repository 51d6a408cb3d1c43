//! Broker transport seam.
//!
//! [`BrokerTransport`] is what the connection manager drives: handshake,
//! subscribe, liveness probe, disconnect. Inbound publishes do not come back
//! through the trait; the transport pushes [`Delivery`] values into a channel
//! the dispatcher reads from.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

/// rumqttc-backed transport.
#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

/// MQTT delivery guarantee requested for subscriptions.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityOfService {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QualityOfService {
    /// Map the numeric MQTT level (0, 1, 2).
    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub const fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// A message delivered by the broker.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Correlation id for logs.
    pub id: Uuid,
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Acknowledges one delivery back to the broker.
///
/// `ack` consumes the handle, so a delivery is acknowledged at most once.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
}

/// Acknowledger for deliveries that need no acknowledgment (QoS 0, or
/// automatic acks configured on the client).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAck;

#[async_trait]
impl Acknowledge for NoAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

/// An inbound message together with the handle that acknowledges it.
#[allow(missing_docs)]
pub struct Delivery {
    pub message: InboundMessage,
    pub ack: Box<dyn Acknowledge>,
}

impl Delivery {
    #[must_use]
    pub fn new(message: InboundMessage, ack: Box<dyn Acknowledge>) -> Self {
        Self { message, ack }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Connection-level operations on a publish/subscribe broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Perform the handshake and authentication.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Issue one subscription request per filter.
    async fn subscribe(&self, filters: &[String], qos: QualityOfService) -> Result<(), TransportError>;

    /// Lightweight liveness check. `Ok(false)` means the link is down.
    async fn probe(&self) -> Result<bool, TransportError>;

    /// Disconnect cleanly.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
