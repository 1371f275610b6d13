//! Queue consumer.
//!
//! Pulls deliveries from one queue, decodes them into [`DomainEvent`]s and
//! dispatches them to the handlers registered for their routing key.
//!
//! Delivery is at-most-once: every message is acknowledged exactly once,
//! whatever happens while processing it, and nothing is ever requeued.
//! A failing or panicking handler is logged through its `on_error` hook and
//! the remaining handlers still run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{FutureExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::bus::{Delivery, DeliveryStream, Result};
use crate::engine::Engine;
use crate::event::DomainEvent;
use crate::handlers::{HandlerEntry, HandlerError, HandlerRegistry};

/// Default consumer tag prefix.
pub const DEFAULT_CONSUMER_TAG: &str = "hris-consumer";

const RECONNECT_MIN_DELAY: Duration = Duration::from_millis(100);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Body was not a valid event; dropped.
    Invalid,
    /// Event was published by this service; ignored.
    SelfEcho,
    /// No handler is registered for the routing key.
    Unrouted,
    /// Handlers ran.
    Handled {
        succeeded: usize,
        skipped: usize,
        failed: usize,
    },
}

enum HandlerOutcome {
    Succeeded,
    Skipped,
    Failed,
}

/// Consumes one queue at a time, in the foreground or as a background task.
pub struct Consumer {
    worker: Worker,
    running: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub fn new(
        engine: Arc<Engine>,
        registry: Arc<HandlerRegistry>,
        service_name: impl Into<String>,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            worker: Worker {
                engine,
                registry,
                service_name: service_name.into(),
                consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            },
            running,
            task: Mutex::new(None),
        }
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.worker.consumer_tag = consumer_tag.into();
        self
    }

    pub fn service_name(&self) -> &str {
        &self.worker.service_name
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Consume `queue` until [`Consumer::stop`] is called.
    ///
    /// Does nothing if this consumer is already running.
    pub async fn start(&self, queue: &str) {
        if !self.mark_running() {
            warn!(queue = %queue, "Consumer already running, ignoring start");
            return;
        }
        self.worker.run(queue, self.running.subscribe()).await;
    }

    /// Consume `queue` on a spawned task.
    ///
    /// Does nothing if this consumer is already running.
    pub async fn start_background(&self, queue: impl Into<String>) {
        let queue = queue.into();
        if !self.mark_running() {
            warn!(queue = %queue, "Consumer already running, ignoring start");
            return;
        }

        let worker = self.worker.clone();
        let running = self.running.subscribe();
        let handle = tokio::spawn(async move { worker.run(&queue, running).await });
        *self.task.lock().await = Some(handle);
    }

    /// Stop consuming. Messages being processed are not drained.
    pub async fn stop(&self) {
        self.running.send_replace(false);

        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        task.abort();
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                error!(error = %e, "Consumer task failed");
            }
        }
        info!(service = %self.worker.service_name, "Consumer stopped");
    }

    /// Process and acknowledge a single delivery.
    pub async fn process(&self, delivery: &Delivery) -> Dispatch {
        self.worker.process(delivery).await
    }

    fn mark_running(&self) -> bool {
        self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        })
    }
}

#[derive(Clone)]
struct Worker {
    engine: Arc<Engine>,
    registry: Arc<HandlerRegistry>,
    service_name: String,
    consumer_tag: String,
}

impl Worker {
    async fn run(&self, queue: &str, mut running: watch::Receiver<bool>) {
        // Exponential backoff with jitter between resubscribe attempts.
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(RECONNECT_MIN_DELAY)
            .with_max_delay(RECONNECT_MAX_DELAY)
            .with_jitter();
        let mut backoff = backoff_builder.build();

        while *running.borrow() {
            match self.subscribe(queue).await {
                Ok(mut deliveries) => {
                    info!(
                        queue = %queue,
                        service = %self.service_name,
                        "Consumer subscribed, processing messages"
                    );
                    backoff = backoff_builder.build();

                    loop {
                        tokio::select! {
                            _ = stopped(&mut running) => {
                                info!(queue = %queue, "Consumer loop exiting");
                                return;
                            }
                            next = deliveries.next() => match next {
                                Some(Ok(delivery)) => {
                                    self.process(&delivery).await;
                                }
                                Some(Err(e)) => {
                                    error!(queue = %queue, error = %e, "Delivery error, resubscribing");
                                    break;
                                }
                                None => {
                                    warn!(queue = %queue, "Delivery stream ended, resubscribing");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Failed to subscribe");
                }
            }

            let delay = backoff.next().unwrap_or(RECONNECT_MAX_DELAY);
            debug!(queue = %queue, backoff_ms = %delay.as_millis(), "Waiting before resubscribe");
            tokio::select! {
                _ = stopped(&mut running) => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream> {
        let channel = self.engine.channel().await?;
        channel.consume(queue, &self.consumer_tag).await
    }

    async fn process(&self, delivery: &Delivery) -> Dispatch {
        let span = tracing::info_span!(
            "bus.consume",
            routing_key = %delivery.routing_key,
            exchange = %delivery.exchange
        );
        let outcome = self.dispatch(&delivery.body).instrument(span).await;

        if let Err(e) = delivery.ack().await {
            warn!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Failed to acknowledge message"
            );
        }
        outcome
    }

    async fn dispatch(&self, body: &[u8]) -> Dispatch {
        let event = match DomainEvent::from_slice(body) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    error = %e,
                    body = %String::from_utf8_lossy(body),
                    "Failed to decode event, dropping message"
                );
                return Dispatch::Invalid;
            }
        };

        if event.source_service == self.service_name {
            debug!(
                correlation_id = %event.correlation_id,
                "Skipping event published by this service"
            );
            return Dispatch::SelfEcho;
        }

        let routing_key = event.routing_key();
        let handlers = self.registry.handlers(&routing_key);
        if handlers.is_empty() {
            warn!(
                source = %event.source_service,
                correlation_id = %event.correlation_id,
                "No handler registered for event"
            );
            return Dispatch::Unrouted;
        }

        let (mut succeeded, mut skipped, mut failed) = (0, 0, 0);
        for entry in handlers {
            match run_handler(entry, &event).await {
                HandlerOutcome::Succeeded => succeeded += 1,
                HandlerOutcome::Skipped => skipped += 1,
                HandlerOutcome::Failed => failed += 1,
            }
        }

        Dispatch::Handled {
            succeeded,
            skipped,
            failed,
        }
    }
}

async fn run_handler(entry: &HandlerEntry, event: &DomainEvent) -> HandlerOutcome {
    let handler = match std::panic::catch_unwind(AssertUnwindSafe(|| entry.instantiate())) {
        Ok(handler) => handler,
        Err(panic) => {
            error!(
                handler = entry.name(),
                error = %panic_message(panic.as_ref()),
                "Handler construction panicked"
            );
            return HandlerOutcome::Failed;
        }
    };

    let result = match guard(handler.can_handle(event)).await {
        Ok(false) => {
            debug!(handler = entry.name(), "Handler declined event");
            return HandlerOutcome::Skipped;
        }
        Ok(true) => guard(handler.handle(event)).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            let hook = AssertUnwindSafe(handler.on_success(event)).catch_unwind();
            if hook.await.is_err() {
                warn!(handler = entry.name(), "on_success hook panicked");
            }
            HandlerOutcome::Succeeded
        }
        Err(e) => {
            let hook = AssertUnwindSafe(handler.on_error(event, &e)).catch_unwind();
            if hook.await.is_err() {
                warn!(handler = entry.name(), "on_error hook panicked");
            }
            HandlerOutcome::Failed
        }
    }
}

/// Resolves once the consumer is told to stop or the consumer is dropped.
///
/// The `watch::Ref` from `wait_for` is released here so the caller's future
/// stays `Send`.
async fn stopped(running: &mut watch::Receiver<bool>) {
    let _ = running.wait_for(|running| !*running).await;
}

/// Run a handler future, turning a panic into a [`HandlerError`].
async fn guard<T>(
    future: impl std::future::Future<Output = std::result::Result<T, HandlerError>>,
) -> std::result::Result<T, HandlerError> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests;
