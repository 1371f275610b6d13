use super::*;
use crate::bus::{BrokerChannel, ExchangeKind, MemoryBroker, MessageProperties, QueueOptions};
use crate::handlers::EventHandler;
use crate::publisher::Publisher;
use async_trait::async_trait;
use tokio::sync::mpsc;

const EXCHANGE: &str = "hris.events";
const QUEUE: &str = "hris.test";

type Calls = mpsc::UnboundedSender<String>;

struct Recorder {
    calls: Calls,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: &DomainEvent) -> std::result::Result<(), HandlerError> {
        let _ = self
            .calls
            .send(format!("{}:{}", event.routing_key(), event.entity_id));
        Ok(())
    }

    async fn on_success(&self, _event: &DomainEvent) {
        let _ = self.calls.send("success".to_string());
    }
}

#[derive(Default)]
struct AlwaysFails;

#[async_trait]
impl EventHandler for AlwaysFails {
    async fn handle(&self, _event: &DomainEvent) -> std::result::Result<(), HandlerError> {
        Err(HandlerError::Failed("directory unavailable".to_string()))
    }
}

#[derive(Default)]
struct Panics;

#[async_trait]
impl EventHandler for Panics {
    async fn handle(&self, _event: &DomainEvent) -> std::result::Result<(), HandlerError> {
        panic!("handler exploded");
    }
}

#[derive(Default)]
struct EvenIdsOnly;

#[async_trait]
impl EventHandler for EvenIdsOnly {
    async fn can_handle(&self, event: &DomainEvent) -> std::result::Result<bool, HandlerError> {
        Ok(event.entity_id.as_i64().is_some_and(|id| id % 2 == 0))
    }

    async fn handle(&self, _event: &DomainEvent) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

struct BrokenCheck {
    errors: Calls,
}

#[async_trait]
impl EventHandler for BrokenCheck {
    async fn can_handle(&self, _event: &DomainEvent) -> std::result::Result<bool, HandlerError> {
        Err(HandlerError::Store("lookup failed".to_string()))
    }

    async fn handle(&self, _event: &DomainEvent) -> std::result::Result<(), HandlerError> {
        let _ = self.errors.send("handled".to_string());
        Ok(())
    }

    async fn on_error(&self, _event: &DomainEvent, err: &HandlerError) {
        let _ = self.errors.send(err.to_string());
    }
}

fn recorder(registry: &mut HandlerRegistry, key: &str) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    registry.register_with::<Recorder, _>(key, move || Recorder { calls: tx.clone() });
    rx
}

async fn setup() -> (MemoryBroker, Arc<Engine>) {
    let broker = MemoryBroker::new();
    let engine = Arc::new(Engine::new(broker.connector(), 10));
    let channel = engine.channel().await.unwrap();
    channel
        .declare_exchange(EXCHANGE, ExchangeKind::Topic, true)
        .await
        .unwrap();
    channel
        .declare_queue(QUEUE, &QueueOptions::default())
        .await
        .unwrap();
    channel.bind_queue(QUEUE, EXCHANGE, "#").await.unwrap();
    (broker, engine)
}

/// Publish a raw body and take it back off the queue as a delivery.
async fn deliver(engine: &Engine, body: &[u8]) -> Delivery {
    let channel = engine.channel().await.unwrap();
    let mut stream = channel.consume(QUEUE, "probe").await.unwrap();
    channel
        .publish(EXCHANGE, "probe", body, &MessageProperties::persistent_json())
        .await
        .unwrap();
    stream.next().await.unwrap().unwrap()
}

fn event_body(event: &DomainEvent) -> Vec<u8> {
    event.to_vec().unwrap()
}

async fn next_call(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("handler channel closed")
}

async fn wait_for_acks(broker: &MemoryBroker, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.acked_count().await < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for acks");
}

#[tokio::test]
async fn test_invalid_json_is_acked_and_dropped() {
    let (broker, engine) = setup().await;
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(HandlerRegistry::new()), "hris");

    let delivery = deliver(&engine, b"{not json").await;
    assert_eq!(consumer.process(&delivery).await, Dispatch::Invalid);

    assert_eq!(broker.acked_count().await, 1);
    assert_eq!(broker.unacked_count(QUEUE).await, 0);
    assert_eq!(broker.queue_depth(QUEUE).await, 0);
}

#[tokio::test]
async fn test_missing_entity_id_is_invalid() {
    let (broker, engine) = setup().await;
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(HandlerRegistry::new()), "hris");

    let delivery = deliver(&engine, br#"{"entity_type":"user","event_type":"created"}"#).await;
    assert_eq!(consumer.process(&delivery).await, Dispatch::Invalid);
    assert_eq!(broker.acked_count().await, 1);
}

#[tokio::test]
async fn test_self_echo_is_skipped() {
    let (broker, engine) = setup().await;
    let mut registry = HandlerRegistry::new();
    let mut calls = recorder(&mut registry, "employee.created");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "hris");

    let event = DomainEvent::new("employee", "created", 1).with_source("hris");
    let delivery = deliver(&engine, &event_body(&event)).await;

    assert_eq!(consumer.process(&delivery).await, Dispatch::SelfEcho);
    assert_eq!(broker.acked_count().await, 1);
    assert!(calls.try_recv().is_err());
}

#[tokio::test]
async fn test_unrouted_event_is_acked() {
    let (broker, engine) = setup().await;
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(HandlerRegistry::new()), "hris");

    let event = DomainEvent::new("badge", "printed", 9).with_source("facilities");
    let delivery = deliver(&engine, &event_body(&event)).await;

    assert_eq!(consumer.process(&delivery).await, Dispatch::Unrouted);
    assert_eq!(broker.acked_count().await, 1);
}

#[tokio::test]
async fn test_failing_handler_does_not_block_others() {
    let (broker, engine) = setup().await;
    let mut registry = HandlerRegistry::new();
    registry.register::<AlwaysFails>("user.created");
    let mut calls = recorder(&mut registry, "user.created");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "hris");

    let event = DomainEvent::new("user", "created", 5).with_source("sso");
    let delivery = deliver(&engine, &event_body(&event)).await;

    assert_eq!(
        consumer.process(&delivery).await,
        Dispatch::Handled {
            succeeded: 1,
            skipped: 0,
            failed: 1
        }
    );
    assert_eq!(calls.try_recv().unwrap(), "user.created:5");
    assert_eq!(calls.try_recv().unwrap(), "success");
    assert_eq!(broker.acked_count().await, 1);
    assert_eq!(broker.rejected_count().await, 0);
}

#[tokio::test]
async fn test_panicking_handler_is_isolated() {
    let (broker, engine) = setup().await;
    let mut registry = HandlerRegistry::new();
    registry.register::<Panics>("user.deleted");
    let mut calls = recorder(&mut registry, "user.deleted");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "hris");

    let event = DomainEvent::new("user", "deleted", 8).with_source("sso");
    let delivery = deliver(&engine, &event_body(&event)).await;

    assert_eq!(
        consumer.process(&delivery).await,
        Dispatch::Handled {
            succeeded: 1,
            skipped: 0,
            failed: 1
        }
    );
    assert_eq!(calls.try_recv().unwrap(), "user.deleted:8");
    assert_eq!(broker.acked_count().await, 1);
}

#[tokio::test]
async fn test_can_handle_false_skips_handler() {
    let (_broker, engine) = setup().await;
    let mut registry = HandlerRegistry::new();
    registry.register::<EvenIdsOnly>("employee.updated");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "hris");

    let odd = DomainEvent::new("employee", "updated", 3).with_source("payroll");
    let delivery = deliver(&engine, &event_body(&odd)).await;
    assert_eq!(
        consumer.process(&delivery).await,
        Dispatch::Handled {
            succeeded: 0,
            skipped: 1,
            failed: 0
        }
    );

    let even = DomainEvent::new("employee", "updated", 4).with_source("payroll");
    let delivery = deliver(&engine, &event_body(&even)).await;
    assert_eq!(
        consumer.process(&delivery).await,
        Dispatch::Handled {
            succeeded: 1,
            skipped: 0,
            failed: 0
        }
    );
}

#[tokio::test]
async fn test_can_handle_error_goes_to_on_error() {
    let (_broker, engine) = setup().await;
    let (tx, mut errors) = mpsc::unbounded_channel();
    let mut registry = HandlerRegistry::new();
    registry.register_with::<BrokenCheck, _>("user.updated", move || BrokenCheck {
        errors: tx.clone(),
    });
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "hris");

    let event = DomainEvent::new("user", "updated", 2).with_source("sso");
    let delivery = deliver(&engine, &event_body(&event)).await;

    assert_eq!(
        consumer.process(&delivery).await,
        Dispatch::Handled {
            succeeded: 0,
            skipped: 0,
            failed: 1
        }
    );
    assert_eq!(errors.try_recv().unwrap(), "Store error: lookup failed");
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_background_consumer_delivers_across_services() {
    let (_broker, engine) = setup().await;
    let mut registry = HandlerRegistry::new();
    let mut calls = recorder(&mut registry, "user.created");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "hris");
    let sso = Publisher::new(Arc::clone(&engine), "sso");

    consumer.start_background(QUEUE).await;
    assert!(consumer.is_running());
    assert!(sso.publish(DomainEvent::new("user", "created", 11), EXCHANGE).await);

    assert_eq!(next_call(&mut calls).await, "user.created:11");
    consumer.stop().await;
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn test_loop_survives_invalid_messages() {
    let (broker, engine) = setup().await;
    let mut registry = HandlerRegistry::new();
    let mut calls = recorder(&mut registry, "user.created");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "hris");

    let channel = engine.channel().await.unwrap();
    let props = MessageProperties::persistent_json();
    channel.publish(EXCHANGE, "junk", b"garbage", &props).await.unwrap();
    let event = DomainEvent::new("user", "created", 12).with_source("sso");
    channel
        .publish(EXCHANGE, "user.created", &event_body(&event), &props)
        .await
        .unwrap();

    consumer.start_background(QUEUE).await;
    assert_eq!(next_call(&mut calls).await, "user.created:12");
    wait_for_acks(&broker, 2).await;
    consumer.stop().await;
}

#[tokio::test]
async fn test_start_while_running_is_noop() {
    let (_broker, engine) = setup().await;
    let consumer = Consumer::new(engine, Arc::new(HandlerRegistry::new()), "hris");

    consumer.start_background(QUEUE).await;
    consumer.start_background(QUEUE).await;
    // Foreground start returns immediately while already running.
    consumer.start(QUEUE).await;
    assert!(consumer.is_running());

    consumer.stop().await;
    consumer.stop().await;
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn test_foreground_start_returns_after_stop() {
    let (_broker, engine) = setup().await;
    let consumer = Arc::new(Consumer::new(
        engine,
        Arc::new(HandlerRegistry::new()),
        "hris",
    ));

    let runner = Arc::clone(&consumer);
    let task = tokio::spawn(async move { runner.start(QUEUE).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(consumer.is_running());

    consumer.stop().await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_resubscribes_after_connection_loss() {
    let (broker, engine) = setup().await;
    let mut registry = HandlerRegistry::new();
    let mut calls = recorder(&mut registry, "employee.created");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "hris");
    let payroll = Publisher::new(Arc::clone(&engine), "payroll");

    consumer.start_background(QUEUE).await;
    assert!(payroll.publish(DomainEvent::new("employee", "created", 1), EXCHANGE).await);
    assert_eq!(next_call(&mut calls).await, "employee.created:1");
    assert_eq!(next_call(&mut calls).await, "success");
    wait_for_acks(&broker, 1).await;

    broker.sever_connections().await;

    assert!(payroll.publish(DomainEvent::new("employee", "created", 2), EXCHANGE).await);
    assert_eq!(next_call(&mut calls).await, "employee.created:2");
    consumer.stop().await;

    assert_eq!(broker.connections_opened().await, 2);
}

#[test]
fn test_panic_message() {
    let payload: Box<dyn Any + Send> = Box::new("static message");
    assert_eq!(panic_message(payload.as_ref()), "static message");
    let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
    assert_eq!(panic_message(payload.as_ref()), "owned message");
    let payload: Box<dyn Any + Send> = Box::new(42);
    assert_eq!(panic_message(payload.as_ref()), "unknown panic");
}

fn assert_send<T: Send>(_: &T) {}

#[tokio::test]
async fn test_worker_loop_is_send() {
    let (_broker, engine) = setup().await;
    let consumer = Consumer::new(engine, Arc::new(HandlerRegistry::new()), "hris");
    let running = consumer.running.subscribe();
    let worker = consumer.worker.clone();

    let run = async move { worker.run(QUEUE, running).await };
    assert_send(&run);
    drop(run);
}

#[tokio::test]
async fn test_dropped_consumer_ends_loop() {
    let (tx, mut rx) = watch::channel(true);
    let waiter = tokio::spawn(async move { stopped(&mut rx).await });
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("stop signal not observed")
        .unwrap();
}
