//! Event publisher.
//!
//! Turns a [`DomainEvent`] into a persistent JSON message on a named
//! exchange. Publishing is best-effort: [`Publisher::publish`] never fails
//! the business operation that triggered it, it only reports `false`.

use std::sync::Arc;

use tracing::{debug, error};

use crate::bus::{BusError, MessageProperties, Result, HEADER_SERVICE, HEADER_VERSION};
use crate::engine::Engine;
use crate::event::DomainEvent;

/// Publishes events under this process's service name.
#[derive(Clone)]
pub struct Publisher {
    engine: Arc<Engine>,
    service_name: String,
}

impl Publisher {
    pub fn new(engine: Arc<Engine>, service_name: impl Into<String>) -> Self {
        Self {
            engine,
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Publish an event, logging and swallowing any failure.
    ///
    /// Returns whether the broker accepted the message.
    pub async fn publish(&self, event: DomainEvent, exchange: &str) -> bool {
        let routing_key = event.routing_key();
        let correlation_id = event.correlation_id.clone();
        match self.try_publish(event, exchange).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to publish event"
                );
                false
            }
        }
    }

    /// Publish an event, returning the failure to the caller.
    ///
    /// The exchange must already exist; it is never declared here.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(exchange = %exchange, routing_key = %event.routing_key())
    )]
    pub async fn try_publish(&self, mut event: DomainEvent, exchange: &str) -> Result<()> {
        let channel = self.engine.channel().await?;
        channel.exchange_exists(exchange).await?;

        event.source_service = self.service_name.clone();
        let body = event.to_vec().map_err(BusError::Serialization)?;
        let properties = MessageProperties::persistent_json()
            .with_correlation_id(event.correlation_id.clone())
            .with_header(HEADER_SERVICE, self.service_name.clone())
            .with_header(HEADER_VERSION, event.version.to_string());

        let routing_key = event.routing_key();
        channel
            .publish(exchange, &routing_key, &body, &properties)
            .await?;

        debug!(
            correlation_id = %event.correlation_id,
            entity_id = %event.entity_id,
            "Published event"
        );
        Ok(())
    }
}
