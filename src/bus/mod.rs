//! Broker abstraction.
//!
//! This module contains:
//! - `Connector` trait: opens the physical connection and its channel
//! - `BrokerChannel` trait: declare/bind/publish/consume on one channel
//! - `Delivery` and `Acknowledger`: consumed messages and their ack handle
//! - Implementations: AMQP (RabbitMQ via lapin), in-memory broker
//!
//! The [`Engine`](crate::engine::Engine) is the only caller of `Connector`.
//! Publisher and consumers reach the channel through the engine and never
//! hold on to it beyond a single operation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, MemoryConnector};

/// Content type of every message this crate publishes.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// AMQP delivery mode for messages that survive a broker restart.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// Header carrying the publishing service name.
pub const HEADER_SERVICE: &str = "service";
/// Header carrying the stringified schema version.
pub const HEADER_VERSION: &str = "version";

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology declaration for '{target}' failed: {message}")]
    Topology { target: String, message: String },

    #[error("Exchange '{0}' not found")]
    ExchangeNotFound(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    pub(crate) fn topology(target: impl Into<String>, message: impl fmt::Display) -> Self {
        BusError::Topology {
            target: target.into(),
            message: message.to_string(),
        }
    }
}

/// Exchange routing semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Wildcard matching on dot-separated routing keys.
    Topic,
    /// Exact routing-key match.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Topic => f.write_str("topic"),
            ExchangeKind::Direct => f.write_str("direct"),
        }
    }
}

/// Where a queue sends rejected or expired messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// Queue declaration attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub dead_letter: Option<DeadLetterTarget>,
}

/// Broker-level message metadata, separate from the JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Persistent JSON message properties.
    pub fn persistent_json() -> Self {
        Self {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body,
            properties,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries from one queue. Ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// One open channel on a broker connection.
///
/// All declarations are idempotent on the broker side: redeclaring an
/// existing exchange or queue with the same attributes succeeds.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether the channel (and its connection) is still usable.
    fn is_open(&self) -> bool;

    /// Limit the number of unacknowledged deliveries held by consumers.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    /// Check an exchange exists without creating it.
    ///
    /// Returns `BusError::ExchangeNotFound` when it doesn't.
    async fn exchange_exists(&self, name: &str) -> Result<()>;

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message and wait for the broker to accept it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()>;

    /// Start consuming a queue. Deliveries must be settled explicitly.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Close the channel, then the connection behind it.
    async fn close(&self) -> Result<()>;
}

/// Opens a connection and its single channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Connection target for logging, without credentials.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_json_properties() {
        let props = MessageProperties::persistent_json()
            .with_correlation_id("abc")
            .with_header(HEADER_SERVICE, "hris");

        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(props.delivery_mode, Some(2));
        assert_eq!(props.correlation_id.as_deref(), Some("abc"));
        assert_eq!(props.headers.get("service").map(String::as_str), Some("hris"));
    }

    #[test]
    fn test_topology_error_message() {
        let err = BusError::topology("hris.sso.users", "PRECONDITION_FAILED");
        assert_eq!(
            err.to_string(),
            "Topology declaration for 'hris.sso.users' failed: PRECONDITION_FAILED"
        );
    }
}
