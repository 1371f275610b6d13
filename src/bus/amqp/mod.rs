//! AMQP (RabbitMQ) broker implementation.
//!
//! One [`AmqpConnector::connect`] call opens one lapin connection and one
//! channel on it, with publisher confirms enabled so `publish` only returns
//! once the broker has taken the message.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, warn};

use super::{
    Acknowledger, BrokerChannel, BusError, Connector, Delivery, DeliveryStream, ExchangeKind,
    MessageProperties, QueueOptions, Result,
};
use crate::config::AmqpConfig;

/// Queue argument naming the dead-letter exchange.
const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering.
const ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

const REPLY_SUCCESS: u16 = 200;

/// Opens RabbitMQ connections.
#[derive(Clone, Debug)]
pub struct AmqpConnector {
    config: AmqpConfig,
}

impl AmqpConnector {
    pub fn new(config: AmqpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(
            &self.config.url(),
            ConnectionProperties::default()
                .with_connection_name(self.config.connection_name.clone().into()),
        )
        .await
        .map_err(|e| {
            BusError::Connection(format!(
                "Failed to connect to {}: {}",
                self.config.redacted_url(),
                e
            ))
        })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;

        info!(url = %self.config.redacted_url(), "Connected to AMQP");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
        }))
    }

    fn describe(&self) -> String {
        self.config.redacted_url()
    }
}

/// A lapin channel together with the connection that owns it.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(target) = &options.dead_letter {
        args.insert(
            ARG_DEAD_LETTER_EXCHANGE.into(),
            AMQPValue::LongString(target.exchange.clone().into()),
        );
        args.insert(
            ARG_DEAD_LETTER_ROUTING_KEY.into(),
            AMQPValue::LongString(target.routing_key.clone().into()),
        );
    }
    args
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.clone().into());
    }
    if let Some(mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.clone().into());
    }
    if !properties.headers.is_empty() {
        let headers: BTreeMap<ShortString, AMQPValue> = properties
            .headers
            .iter()
            .map(|(k, v)| (k.clone().into(), AMQPValue::LongString(v.clone().into())))
            .collect();
        basic = basic.with_headers(FieldTable::from(headers));
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let headers = basic
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                        AMQPValue::ShortString(s) => s.as_str().to_string(),
                        AMQPValue::LongInt(n) => n.to_string(),
                        AMQPValue::LongLongInt(n) => n.to_string(),
                        AMQPValue::Boolean(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((k.as_str().to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        delivery_mode: *basic.delivery_mode(),
        correlation_id: basic.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        headers,
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        exchange,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    Delivery::new(
        exchange.as_str(),
        routing_key.as_str(),
        data,
        from_basic_properties(&properties),
        redelivered,
        Box::new(AmqpAcker { acker }),
    )
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to set QoS: {}", e)))
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::topology(name, e))
    }

    async fn exchange_exists(&self, name: &str) -> Result<()> {
        // A failed passive declare closes the channel it ran on, so probe on a
        // throwaway channel and keep the shared one intact.
        let probe = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        let result = probe
            .exchange_declare(
                name,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        if probe.status().connected() {
            if let Err(e) = probe.close(REPLY_SUCCESS, "probe done").await {
                debug!(error = %e, "Failed to close probe channel");
            }
        }

        result.map_err(|e| {
            let message = e.to_string();
            if message.contains("NOT_FOUND") || message.contains("404") {
                BusError::ExchangeNotFound(name.to_string())
            } else {
                BusError::Publish(format!("Failed to look up exchange '{}': {}", name, message))
            }
        })
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                queue_arguments(options),
            )
            .await
            .map(|_| ())
            .map_err(|e| BusError::topology(name, e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::topology(queue, e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        if confirmation.is_nack() {
            return Err(BusError::Publish(format!(
                "Broker nacked message for '{}' on '{}'",
                routing_key, exchange
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))?;

        let stream = consumer.map(|item| {
            item.map(into_delivery)
                .map_err(|e| BusError::Consume(format!("Delivery error: {}", e)))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "Bye").await {
                warn!(error = %e, "Failed to close AMQP channel");
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "Bye")
                .await
                .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))?;
        }
        Ok(())
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeadLetterTarget, HEADER_SERVICE, HEADER_VERSION};

    #[test]
    fn test_properties_conversion() {
        let props = MessageProperties::persistent_json()
            .with_correlation_id("c-1")
            .with_header(HEADER_SERVICE, "hris")
            .with_header(HEADER_VERSION, "1");

        let basic = to_basic_properties(&props);
        assert_eq!(basic.delivery_mode(), &Some(2));
        assert_eq!(
            basic.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );

        assert_eq!(from_basic_properties(&basic), props);
    }

    #[test]
    fn test_empty_properties_have_no_headers() {
        let basic = to_basic_properties(&MessageProperties::default());
        assert!(basic.headers().is_none());
        assert_eq!(from_basic_properties(&basic), MessageProperties::default());
    }

    #[test]
    fn test_queue_arguments_dead_letter() {
        let args = queue_arguments(&QueueOptions {
            durable: true,
            dead_letter: Some(DeadLetterTarget {
                exchange: "hris.dlx".to_string(),
                routing_key: "hris.dead_letter".to_string(),
            }),
        });

        let inner = args.inner();
        assert_eq!(inner.len(), 2);
        assert!(inner.contains_key(&ShortString::from("x-dead-letter-exchange")));
        assert!(inner.contains_key(&ShortString::from("x-dead-letter-routing-key")));
    }

    #[test]
    fn test_queue_arguments_plain() {
        assert!(queue_arguments(&QueueOptions::default()).inner().is_empty());
    }

    #[test]
    fn test_connector_describe_is_redacted() {
        let connector = AmqpConnector::new(AmqpConfig::default());
        assert!(!connector.describe().contains("guest"));
    }
}
