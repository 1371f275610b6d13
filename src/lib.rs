//! HRIS messaging core.
//!
//! Event-driven integration between the HRIS backend and its sibling
//! services over a topic-routed message broker:
//!
//! - [`event`]: the [`DomainEvent`] envelope and its JSON wire format
//! - [`topology`]: exchange/queue bindings declared at startup
//! - [`engine`]: the single broker connection
//! - [`publisher`]: best-effort event publishing
//! - [`handlers`]: handler trait and routing-key registry
//! - [`consumer`]: at-most-once dispatch from a queue to handlers
//! - [`features`]: the HRIS bindings and handlers themselves

pub mod bus;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod event;
pub mod features;
pub mod handlers;
pub mod publisher;
pub mod topology;
pub mod utils;

pub use consumer::{Consumer, Dispatch};
pub use engine::Engine;
pub use event::{DomainEvent, EntityId, EventError};
pub use handlers::{EventHandler, HandlerError, HandlerRegistry};
pub use publisher::Publisher;
pub use topology::{Binding, TopologyRegistry};
