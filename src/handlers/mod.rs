//! Event handlers and the routing-key → handler registry.
//!
//! Handlers are registered explicitly at startup by the composition root.
//! The registry stores a factory per handler type; the consumer builds a
//! fresh instance for every message, so handlers carry no per-message state.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::event::DomainEvent;

/// Errors raised by a handler while processing an event.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Payload does not match the expected shape: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Reacts to one kind of domain event.
///
/// `handle` must be idempotent: delivery is at-most-once from the broker's
/// point of view, but producers may emit the same fact more than once.
/// `can_handle` must not have side effects. A handler that doesn't apply to
/// an event says so through `can_handle`, never by failing.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Name used in logs and [`HandlerRegistry::list_all`].
    fn name(&self) -> &'static str {
        short_type_name::<Self>()
    }

    async fn can_handle(&self, _event: &DomainEvent) -> Result<bool, HandlerError> {
        Ok(true)
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;

    async fn on_success(&self, event: &DomainEvent) {
        info!(
            handler = self.name(),
            routing_key = %event.routing_key(),
            entity_id = %event.entity_id,
            correlation_id = %event.correlation_id,
            "Event handled"
        );
    }

    async fn on_error(&self, event: &DomainEvent, err: &HandlerError) {
        error!(
            handler = self.name(),
            routing_key = %event.routing_key(),
            entity_id = %event.entity_id,
            source = %event.source_service,
            correlation_id = %event.correlation_id,
            version = event.version,
            data = %serde_json::Value::Object(event.data.clone()),
            error = %err,
            "Event handler failed"
        );
    }
}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn EventHandler> + Send + Sync>;

/// A registered handler type.
#[derive(Clone)]
pub struct HandlerEntry {
    type_id: TypeId,
    name: &'static str,
    factory: HandlerFactory,
}

impl HandlerEntry {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Build a fresh handler instance.
    pub fn instantiate(&self) -> Box<dyn EventHandler> {
        (self.factory)()
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("name", &self.name)
            .finish()
    }
}

/// Routing key → ordered handler types.
///
/// Lookup is by exact routing key; wildcards only exist at the broker level.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Vec<HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a default-constructible handler for a routing key.
    ///
    /// Returns `false` when the type was already registered for that key.
    pub fn register<H>(&mut self, event_type: impl Into<String>) -> bool
    where
        H: EventHandler + Default,
    {
        self.register_with::<H, _>(event_type, H::default)
    }

    /// Register a handler built by `factory`, for handlers that need
    /// injected dependencies.
    ///
    /// Returns `false` when the type was already registered for that key.
    pub fn register_with<H, F>(&mut self, event_type: impl Into<String>, factory: F) -> bool
    where
        H: EventHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let handlers = self.entries.entry(event_type.clone()).or_default();
        let type_id = TypeId::of::<H>();
        let name = short_type_name::<H>();

        if handlers.iter().any(|entry| entry.type_id == type_id) {
            debug!(event_type = %event_type, handler = name, "Handler already registered");
            return false;
        }

        handlers.push(HandlerEntry {
            type_id,
            name,
            factory: Arc::new(move || Box::new(factory()) as Box<dyn EventHandler>),
        });
        debug!(event_type = %event_type, handler = name, "Registered handler");
        true
    }

    /// Handlers for an exact routing key, in registration order.
    pub fn handlers(&self, event_type: &str) -> &[HandlerEntry] {
        self.entries
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Routing key → handler names, sorted by key.
    pub fn list_all(&self) -> BTreeMap<String, Vec<&'static str>> {
        self.entries
            .iter()
            .filter(|(_, handlers)| !handlers.is_empty())
            .map(|(key, handlers)| {
                (
                    key.clone(),
                    handlers.iter().map(HandlerEntry::name).collect(),
                )
            })
            .collect()
    }

    /// Number of (routing key, handler) registrations.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Type name without its module path.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    // Generic arguments may themselves contain paths; only strip the outer one.
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
