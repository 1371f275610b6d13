//! HRIS messaging features.
//!
//! Each feature contributes its bindings and handlers to the registries.
//! [`register_all`] is called once by the composition root, before the
//! topology is applied and before any consumer starts.

pub mod accounts;
pub mod employees;

use std::sync::Arc;

use crate::handlers::HandlerRegistry;
use crate::topology::TopologyRegistry;

use accounts::AccountDirectory;

/// Queues this service consumes from.
pub const CONSUMED_QUEUES: &[&str] = &[accounts::SSO_USERS_QUEUE];

/// Register every feature, in a fixed order.
pub fn register_all(
    topology: &mut TopologyRegistry,
    handlers: &mut HandlerRegistry,
    directory: Arc<dyn AccountDirectory>,
    exchange: &str,
) {
    accounts::register(topology, handlers, directory);
    employees::register(topology, exchange);
}
