//! Broker connection manager.
//!
//! The [`Engine`] is the only owner of the broker connection and its shared
//! channel. It is constructed once by the composition root and shared (via
//! `Arc`) with the [`Publisher`](crate::publisher::Publisher) and every
//! [`Consumer`](crate::consumer::Consumer).
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected --connect()--> Connected --disconnect()--> Disconnected
//!                                 |
//!                          (connection lost)
//!                                 v
//!                  channel() reconnects transparently
//! ```
//!
//! Callers must not cache the channel returned by [`Engine::channel`]: after
//! a reconnect a different channel is handed out.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::{
    BrokerChannel, BusError, Connector, DeadLetterTarget, ExchangeKind, QueueOptions, Result,
};
use crate::topology::{
    Binding, TopologyRegistry, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, DEAD_LETTER_ROUTING_KEY,
};

/// Owner of the single broker connection and channel.
pub struct Engine {
    connector: Box<dyn Connector>,
    prefetch_count: u16,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    connect_lock: Mutex<()>,
}

impl Engine {
    pub fn new(connector: impl Connector + 'static, prefetch_count: u16) -> Self {
        Self {
            connector: Box::new(connector),
            prefetch_count,
            channel: RwLock::new(None),
            connect_lock: Mutex::new(()),
        }
    }

    /// Whether a usable channel is currently held.
    pub async fn is_connected(&self) -> bool {
        self.channel
            .read()
            .await
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Open the connection and channel if not already open.
    ///
    /// Concurrent callers are serialized; only the first opens a connection.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_connected().await {
            return Ok(());
        }

        // A channel that dropped unexpectedly is discarded before reconnecting.
        if let Some(stale) = self.channel.write().await.take() {
            warn!(broker = %self.connector.describe(), "Broker channel lost, reconnecting");
            if let Err(e) = stale.close().await {
                debug!(error = %e, "Failed to close stale channel");
            }
        }

        let channel = self.connector.connect().await?;
        if let Err(e) = channel.set_prefetch(self.prefetch_count).await {
            if let Err(close_err) = channel.close().await {
                debug!(error = %close_err, "Failed to close channel after QoS error");
            }
            return Err(e);
        }
        *self.channel.write().await = Some(channel);

        info!(
            broker = %self.connector.describe(),
            prefetch_count = self.prefetch_count,
            "Broker connection established"
        );
        Ok(())
    }

    /// Close the channel and connection. Safe to call when disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        let Some(channel) = self.channel.write().await.take() else {
            return Ok(());
        };
        channel.close().await?;
        info!(broker = %self.connector.describe(), "Broker connection closed");
        Ok(())
    }

    /// The shared channel, connecting first if needed.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.connect().await?;
        self.channel
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(BusError::ChannelClosed)
    }

    /// Declare the dead-letter infrastructure and every registered binding.
    ///
    /// Bindings are applied in registration order. The first failing
    /// declaration aborts the whole operation. Declarations are idempotent,
    /// so applying an unchanged registry again succeeds. Callers must not run
    /// this concurrently with itself.
    pub async fn apply_topology(&self, topology: &TopologyRegistry) -> Result<()> {
        let channel = self.channel().await?;

        declare_dead_letter(channel.as_ref()).await?;
        for binding in topology.bindings() {
            declare_binding(channel.as_ref(), binding).await?;
        }

        info!(
            bindings = topology.len(),
            queues = ?topology.queues(),
            "Broker topology applied"
        );
        Ok(())
    }
}

async fn declare_dead_letter(channel: &dyn BrokerChannel) -> Result<()> {
    channel
        .declare_exchange(DEAD_LETTER_EXCHANGE, ExchangeKind::Direct, true)
        .await?;
    channel
        .declare_queue(
            DEAD_LETTER_QUEUE,
            &QueueOptions {
                durable: true,
                dead_letter: None,
            },
        )
        .await?;
    channel
        .bind_queue(DEAD_LETTER_QUEUE, DEAD_LETTER_EXCHANGE, DEAD_LETTER_ROUTING_KEY)
        .await?;
    debug!(
        exchange = DEAD_LETTER_EXCHANGE,
        queue = DEAD_LETTER_QUEUE,
        "Declared dead-letter infrastructure"
    );
    Ok(())
}

async fn declare_binding(channel: &dyn BrokerChannel, binding: &Binding) -> Result<()> {
    channel
        .declare_exchange(&binding.exchange, ExchangeKind::Topic, binding.durable)
        .await?;

    let options = QueueOptions {
        durable: binding.durable,
        dead_letter: binding.dead_letter.then(|| DeadLetterTarget {
            exchange: DEAD_LETTER_EXCHANGE.to_string(),
            routing_key: DEAD_LETTER_ROUTING_KEY.to_string(),
        }),
    };
    channel.declare_queue(&binding.queue, &options).await?;

    for routing_key in &binding.routing_keys {
        channel
            .bind_queue(&binding.queue, &binding.exchange, routing_key)
            .await?;
    }

    debug!(
        queue = %binding.queue,
        exchange = %binding.exchange,
        routing_keys = ?binding.routing_keys,
        dead_letter = binding.dead_letter,
        "Declared binding"
    );
    Ok(())
}
