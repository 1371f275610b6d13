//! In-memory broker for tests and local development.
//!
//! Models the parts of an AMQP broker the messaging core relies on:
//! - topic and direct exchanges
//! - queues buffering messages until a consumer takes them
//! - bindings with topic wildcards (`*`, `#`)
//! - explicit ack/reject, with dead-lettering of rejected messages
//! - redeclaration checks (same attributes succeed, different ones fail)
//! - per-consumer prefetch limits
//!
//! [`MemoryBroker::sever_connections`] simulates losing the connection: every
//! open channel is marked closed, consumer streams end, and unacknowledged
//! messages go back to their queues flagged as redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{
    Acknowledger, BrokerChannel, BusError, Connector, Delivery, DeliveryStream, ExchangeKind,
    MessageProperties, QueueOptions, Result,
};
use crate::topology::topic_matches;

type SharedState = Arc<Mutex<BrokerState>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    consumer_tag: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    next_consumer: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingState {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingState>,
    channels: Vec<(u64, Arc<AtomicBool>)>,
    next_delivery_tag: u64,
    connections_opened: usize,
    published: usize,
    acked: usize,
    rejected: usize,
    dead_lettered: usize,
}

/// Route a message through an exchange into every matching queue.
fn route(state: &mut BrokerState, handle: &SharedState, exchange: &str, message: StoredMessage) {
    let Some(kind) = state.exchanges.get(exchange).map(|e| e.kind) else {
        return;
    };

    let mut targets: Vec<String> = Vec::new();
    for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
        let matched = match kind {
            ExchangeKind::Topic => topic_matches(&binding.routing_key, &message.routing_key),
            ExchangeKind::Direct => binding.routing_key == message.routing_key,
        };
        if matched && !targets.contains(&binding.queue) {
            targets.push(binding.queue.clone());
        }
    }

    if targets.is_empty() {
        debug!(exchange = %exchange, routing_key = %message.routing_key, "Message unroutable, dropped");
    }

    for queue in &targets {
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back(message.clone());
        }
        dispatch(state, handle, queue);
    }
}

/// Hand ready messages to consumers with spare capacity, round-robin.
fn dispatch(state: &mut BrokerState, handle: &SharedState, queue: &str) {
    loop {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        if q.ready.is_empty() {
            return;
        }

        q.consumers.retain(|c| !c.sender.is_closed());
        let count = q.consumers.len();
        let start = q.next_consumer;
        let Some(index) = (0..count)
            .map(|i| (start + i) % count)
            .find(|&i| q.consumers[i].has_capacity())
        else {
            return;
        };
        q.next_consumer = (index + 1) % count;

        let Some(message) = q.ready.pop_front() else {
            return;
        };

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;

        let delivery = Delivery::new(
            message.exchange.clone(),
            message.routing_key.clone(),
            message.body.clone(),
            message.properties.clone(),
            message.redelivered,
            Box::new(MemoryAcker {
                state: Arc::clone(handle),
                queue: queue.to_string(),
                delivery_tag,
            }),
        );

        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let consumer = &mut q.consumers[index];
        if consumer.sender.send(Ok(delivery)).is_err() {
            q.ready.push_front(message);
            continue;
        }
        consumer.in_flight += 1;
        let unacked = Unacked {
            consumer_tag: consumer.tag.clone(),
            channel_id: consumer.channel_id,
            message,
        };
        q.unacked.insert(delivery_tag, unacked);
    }
}

/// Drop a channel's consumers and return its unacked messages to their
/// queues, ahead of anything still waiting.
fn release_channel(state: &mut BrokerState, handle: &SharedState, channel_id: u64) {
    let mut touched = Vec::new();
    for (name, q) in state.queues.iter_mut() {
        q.consumers.retain(|c| c.channel_id != channel_id);

        let mut tags: Vec<u64> = q
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        if tags.is_empty() {
            continue;
        }
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = q.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                q.ready.push_front(message);
            }
        }
        touched.push(name.clone());
    }
    for queue in touched {
        dispatch(state, handle, &queue);
    }
}

/// Remove a delivery from the unacked set and free its consumer's slot.
fn settle(state: &mut BrokerState, queue: &str, delivery_tag: u64) -> Result<StoredMessage> {
    let q = state
        .queues
        .get_mut(queue)
        .ok_or_else(|| BusError::Ack(format!("NOT_FOUND - no queue '{}'", queue)))?;
    let unacked = q.unacked.remove(&delivery_tag).ok_or_else(|| {
        BusError::Ack(format!(
            "PRECONDITION_FAILED - unknown delivery tag {}",
            delivery_tag
        ))
    })?;
    if let Some(consumer) = q.consumers.iter_mut().find(|c| c.tag == unacked.consumer_tag) {
        consumer.in_flight = consumer.in_flight.saturating_sub(1);
    }
    Ok(unacked.message)
}

/// An in-process broker. Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: SharedState,
    next_channel_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening channels on this broker.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Open a channel directly, outside of any engine.
    pub async fn open_channel(&self) -> MemoryChannel {
        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        let open = Arc::new(AtomicBool::new(true));

        let mut state = self.state.lock().await;
        state.connections_opened += 1;
        state.channels.push((id, Arc::clone(&open)));

        MemoryChannel {
            id,
            broker: self.clone(),
            open,
            prefetch: AtomicU16::new(0),
        }
    }

    /// Simulate a connection failure on every open channel.
    pub async fn sever_connections(&self) {
        let mut state = self.state.lock().await;
        let channels = std::mem::take(&mut state.channels);
        for (id, open) in channels {
            open.store(false, Ordering::SeqCst);
            release_channel(&mut state, &self.state, id);
        }
    }

    /// Number of channels opened so far (one per engine connection).
    pub async fn connections_opened(&self) -> usize {
        self.state.lock().await.connections_opened
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().await.exchanges.contains_key(name)
    }

    pub async fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state.lock().await.exchanges.get(name).map(|e| e.kind)
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }

    pub async fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.options.clone())
    }

    /// Routing keys binding `queue` to `exchange`, in declaration order.
    pub async fn bindings(&self, queue: &str, exchange: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .bindings
            .iter()
            .filter(|b| b.queue == queue && b.exchange == exchange)
            .map(|b| b.routing_key.clone())
            .collect()
    }

    /// Messages waiting in a queue, not yet handed to a consumer.
    pub async fn queue_depth(&self, name: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages handed to a consumer and not yet settled.
    pub async fn unacked_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Raw bodies waiting in a queue, oldest first.
    pub async fn peek(&self, name: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn published_count(&self) -> usize {
        self.state.lock().await.published
    }

    pub async fn acked_count(&self) -> usize {
        self.state.lock().await.acked
    }

    pub async fn rejected_count(&self) -> usize {
        self.state.lock().await.rejected
    }

    pub async fn dead_lettered_count(&self) -> usize {
        self.state.lock().await.dead_lettered
    }
}

/// [`Connector`] for a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        Ok(Arc::new(self.broker.open_channel().await))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// A channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::ChannelClosed)
        }
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.ensure_open()?;
        let declared = ExchangeState { kind, durable };
        let mut state = self.broker.state.lock().await;
        match state.exchanges.get(name) {
            Some(existing) if *existing != declared => Err(BusError::topology(
                name,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared {} durable={}, existing {} durable={}",
                    name, kind, durable, existing.kind, existing.durable
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), declared);
                Ok(())
            }
        }
    }

    async fn exchange_exists(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if self.broker.state.lock().await.exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(BusError::ExchangeNotFound(name.to_string()))
        }
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        match state.queues.get(name) {
            Some(existing) if existing.options != *options => Err(BusError::topology(
                name,
                format!("PRECONDITION_FAILED - inequivalent arg for queue '{}'", name),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options: options.clone(),
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::topology(
                queue,
                format!("NOT_FOUND - no exchange '{}'", exchange),
            ));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::topology(
                queue,
                format!("NOT_FOUND - no queue '{}'", queue),
            ));
        }
        let binding = BindingState {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::ExchangeNotFound(exchange.to_string()));
        }
        state.published += 1;
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
            redelivered: false,
        };
        route(&mut state, &self.broker.state, exchange, message);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut state = self.broker.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Consume(format!("NOT_FOUND - no queue '{}'", queue)))?;
        q.consumers.push(ConsumerSlot {
            tag: format!("{}-{}", consumer_tag, self.id),
            channel_id: self.id,
            prefetch: self.prefetch(),
            in_flight: 0,
            sender,
        });
        dispatch(&mut state, &self.broker.state, queue);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.broker.state.lock().await;
        state.channels.retain(|(id, _)| *id != self.id);
        release_channel(&mut state, &self.broker.state, self.id);
        Ok(())
    }
}

struct MemoryAcker {
    state: SharedState,
    queue: String,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        settle(&mut state, &self.queue, self.delivery_tag)?;
        state.acked += 1;
        dispatch(&mut state, &self.state, &self.queue);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut message = settle(&mut state, &self.queue, self.delivery_tag)?;
        state.rejected += 1;

        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_front(message);
            }
        } else {
            let target = state
                .queues
                .get(&self.queue)
                .and_then(|q| q.options.dead_letter.clone());
            if let Some(target) = target {
                state.dead_lettered += 1;
                message.routing_key = target.routing_key;
                message.exchange = target.exchange.clone();
                route(&mut state, &self.state, &target.exchange, message);
            }
        }
        dispatch(&mut state, &self.state, &self.queue);
        Ok(())
    }
}
