//! End-to-end publish/consume scenarios against the in-memory broker.
//!
//! Each test wires the same pieces the `hris-events` binary does: topology
//! and handler registries, one shared engine, publishers for the producing
//! services and a consumer for the receiving one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hris_messaging::bus::{BrokerChannel, MemoryBroker, MessageProperties};
use hris_messaging::features::accounts::{self, AccountDirectory};
use hris_messaging::features::{self, employees};
use hris_messaging::{
    Binding, Consumer, DomainEvent, Engine, EventHandler, HandlerError, HandlerRegistry,
    Publisher, TopologyRegistry,
};
use serde_json::json;
use tokio::sync::mpsc;

const HRIS_EVENTS: &str = "hris.events";
const WORKFORCE_QUEUE: &str = "workforce.employees";

struct Forward {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

#[async_trait]
impl EventHandler for Forward {
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

fn forward(registry: &mut HandlerRegistry, key: &str) -> mpsc::UnboundedReceiver<DomainEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    registry.register_with::<Forward, _>(key, move || Forward { tx: tx.clone() });
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<DomainEvent>) -> DomainEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
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

/// A workforce service consuming employee events published by HRIS.
async fn workforce(broker: &MemoryBroker) -> Arc<Engine> {
    let engine = Arc::new(Engine::new(broker.connector(), 10));
    let mut topology = TopologyRegistry::new();
    topology.register([Binding::new(WORKFORCE_QUEUE, HRIS_EVENTS).route("employee.*")]);
    engine.apply_topology(&topology).await.unwrap();
    engine
}

#[tokio::test]
async fn test_event_reaches_other_service() {
    let broker = MemoryBroker::new();
    let engine = workforce(&broker).await;
    let mut registry = HandlerRegistry::new();
    let mut received = forward(&mut registry, "employee.created");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "workforce");
    consumer.start_background(WORKFORCE_QUEUE).await;

    let hris = Publisher::new(Arc::clone(&engine), "hris");
    let event = DomainEvent::new("employee", "created", 42).with_payload(&json!({"name": "Ada"}));
    assert!(hris.publish(event, HRIS_EVENTS).await);

    let event = recv(&mut received).await;
    assert_eq!(event.entity_id.as_i64(), Some(42));
    assert_eq!(event.data["name"], "Ada");
    assert_eq!(event.source_service, "hris");
    wait_for_acks(&broker, 1).await;

    // Handled exactly once.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(received.try_recv().is_err());
    assert_eq!(broker.queue_depth(WORKFORCE_QUEUE).await, 0);
    assert_eq!(broker.unacked_count(WORKFORCE_QUEUE).await, 0);

    consumer.stop().await;
}

#[tokio::test]
async fn test_own_events_are_not_handled() {
    let broker = MemoryBroker::new();
    let engine = workforce(&broker).await;
    let mut registry = HandlerRegistry::new();
    let mut received = forward(&mut registry, "employee.created");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "hris");
    consumer.start_background(WORKFORCE_QUEUE).await;

    let hris = Publisher::new(Arc::clone(&engine), "hris");
    assert!(hris.publish(DomainEvent::new("employee", "created", 1), HRIS_EVENTS).await);
    wait_for_acks(&broker, 1).await;

    assert!(received.try_recv().is_err());
    consumer.stop().await;
}

#[tokio::test]
async fn test_invalid_message_does_not_stop_consumer() {
    let broker = MemoryBroker::new();
    let engine = workforce(&broker).await;
    let mut registry = HandlerRegistry::new();
    let mut received = forward(&mut registry, "employee.updated");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "workforce");
    consumer.start_background(WORKFORCE_QUEUE).await;

    let channel = engine.channel().await.unwrap();
    channel
        .publish(
            HRIS_EVENTS,
            "employee.updated",
            b"not json at all",
            &MessageProperties::persistent_json(),
        )
        .await
        .unwrap();
    wait_for_acks(&broker, 1).await;

    let hris = Publisher::new(Arc::clone(&engine), "hris");
    assert!(hris.publish(DomainEvent::new("employee", "updated", 7), HRIS_EVENTS).await);

    assert_eq!(recv(&mut received).await.entity_id.as_i64(), Some(7));
    wait_for_acks(&broker, 2).await;
    assert_eq!(broker.rejected_count().await, 0);
    assert_eq!(broker.dead_lettered_count().await, 0);
    consumer.stop().await;
}

#[tokio::test]
async fn test_routing_key_matches_registration() {
    let broker = MemoryBroker::new();
    let engine = workforce(&broker).await;
    let mut registry = HandlerRegistry::new();
    let event = DomainEvent::new("employee", "deleted", 3);
    let mut received = forward(&mut registry, &event.routing_key());
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "workforce");
    consumer.start_background(WORKFORCE_QUEUE).await;

    let hris = Publisher::new(Arc::clone(&engine), "hris");
    assert!(hris.publish(event, HRIS_EVENTS).await);

    assert_eq!(recv(&mut received).await.routing_key(), "employee.deleted");
    consumer.stop().await;
}

#[tokio::test]
async fn test_sso_users_sync_into_directory() {
    let broker = MemoryBroker::new();
    let engine = Arc::new(Engine::new(broker.connector(), 10));
    let directory = Arc::new(accounts::InMemoryAccountDirectory::new());

    let mut topology = TopologyRegistry::new();
    let mut handlers = HandlerRegistry::new();
    features::register_all(&mut topology, &mut handlers, directory.clone(), HRIS_EVENTS);
    engine.apply_topology(&topology).await.unwrap();

    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(handlers), "hris");
    consumer.start_background(accounts::SSO_USERS_QUEUE).await;

    let sso = Publisher::new(Arc::clone(&engine), "sso");
    let created = DomainEvent::new("user", "created", "u-100")
        .with_payload(&json!({"email": "grace@example.com", "name": "Grace"}));
    assert!(sso.publish(created.clone(), accounts::SSO_EXCHANGE).await);
    assert!(sso.publish(created, accounts::SSO_EXCHANGE).await);
    assert!(sso.publish(DomainEvent::new("user", "deleted", "u-100"), accounts::SSO_EXCHANGE).await);
    wait_for_acks(&broker, 3).await;

    let account = directory
        .get("u-100")
        .await
        .expect("directory lookup failed")
        .expect("account not found");
    assert_eq!(account.email, "grace@example.com");
    assert!(!account.active);
    assert_eq!(directory.len().await, 1);

    // HRIS's own employee events land on the replica queue for other services.
    let hris = employees::EmployeeEvents::new(Publisher::new(Arc::clone(&engine), "hris"), HRIS_EVENTS);
    assert!(hris.deleted(5).await);
    assert_eq!(broker.queue_depth(employees::EMPLOYEE_REPLICA_QUEUE).await, 1);

    consumer.stop().await;
}

#[tokio::test]
async fn test_consumer_survives_broker_restart() {
    let broker = MemoryBroker::new();
    let engine = workforce(&broker).await;
    let mut registry = HandlerRegistry::new();
    let mut received = forward(&mut registry, "employee.created");
    let consumer = Consumer::new(Arc::clone(&engine), Arc::new(registry), "workforce");
    consumer.start_background(WORKFORCE_QUEUE).await;
    let hris = Publisher::new(Arc::clone(&engine), "hris");

    assert!(hris.publish(DomainEvent::new("employee", "created", 1), HRIS_EVENTS).await);
    recv(&mut received).await;
    wait_for_acks(&broker, 1).await;

    broker.sever_connections().await;

    assert!(hris.publish(DomainEvent::new("employee", "created", 2), HRIS_EVENTS).await);
    assert_eq!(recv(&mut received).await.entity_id.as_i64(), Some(2));
    assert!(engine.is_connected().await);

    consumer.stop().await;
    engine.disconnect().await.unwrap();
}
