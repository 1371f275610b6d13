//! hris-events: HRIS messaging service
//!
//! Declares the broker topology and consumes the HRIS queues until Ctrl+C.
//!
//! ## Architecture
//! ```text
//! [sso.events] --user.*--> [hris.sso.users] -> [hris-events] -> [Account directory]
//! [hris.events] --employee.*, org_unit.*--> [hris.employees.replica] -> (sibling services)
//! ```
//!
//! ## Configuration
//! - HRIS_CONFIG: Path to a YAML config file
//! - HRIS__MESSAGING__AMQP__URL: RabbitMQ connection string
//! - HRIS__MESSAGING__QUEUES: Comma-separated queues to consume
//! - HRIS_LOG / HRIS_LOG_FORMAT: Log filter and output format

use std::sync::Arc;

use tracing::{error, info};

use hris_messaging::bus::AmqpConnector;
use hris_messaging::config::Config;
use hris_messaging::features::{self, accounts::InMemoryAccountDirectory};
use hris_messaging::utils::bootstrap::{connect_with_retry, init_tracing};
use hris_messaging::{Consumer, Engine, HandlerRegistry, TopologyRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;
    let messaging = config.messaging;

    info!(service = %messaging.service_name, "Starting hris-events");

    let mut topology = TopologyRegistry::new();
    let mut handlers = HandlerRegistry::new();
    features::register_all(
        &mut topology,
        &mut handlers,
        Arc::new(InMemoryAccountDirectory::new()),
        &messaging.exchange,
    );
    for (routing_key, names) in handlers.list_all() {
        info!(routing_key = %routing_key, handlers = ?names, "Registered handlers");
    }

    let broker = messaging.amqp.redacted_url();
    let engine = Arc::new(Engine::new(
        AmqpConnector::new(messaging.amqp.clone()),
        messaging.amqp.prefetch_count,
    ));
    connect_with_retry("broker", &broker, || engine.connect()).await?;
    engine.apply_topology(&topology).await?;

    let queues = if messaging.queues.is_empty() {
        features::CONSUMED_QUEUES
            .iter()
            .map(|queue| queue.to_string())
            .collect()
    } else {
        messaging.queues.clone()
    };

    let registry = Arc::new(handlers);
    let mut consumers = Vec::with_capacity(queues.len());
    for queue in queues {
        let consumer = Consumer::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            messaging.service_name.clone(),
        )
        .with_consumer_tag(format!("{}-{}", messaging.consumer_tag, queue));
        consumer.start_background(queue).await;
        consumers.push(consumer);
    }

    info!(consumers = consumers.len(), "hris-events running, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    for consumer in &consumers {
        consumer.stop().await;
    }
    engine.disconnect().await?;

    Ok(())
}
