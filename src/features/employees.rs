//! Employee and org-unit change events.
//!
//! HRIS is the producer here: CRUD code builds events with the helpers below
//! and hands them to [`EmployeeEvents`]. Sibling services read them from the
//! replica queue bound in [`register`].

use serde::{Deserialize, Serialize};

use crate::event::{DomainEvent, EntityId};
use crate::publisher::Publisher;
use crate::topology::{Binding, TopologyRegistry};

/// Queue other services read employee changes from.
pub const EMPLOYEE_REPLICA_QUEUE: &str = "hris.employees.replica";

pub const EMPLOYEE: &str = "employee";
pub const ORG_UNIT: &str = "org_unit";

/// Employee fields carried in event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_unit_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso_user_id: Option<String>,
}

/// Org unit fields carried in event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgUnitRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
}

pub fn employee_created(id: impl Into<EntityId>, employee: &EmployeeRecord) -> DomainEvent {
    DomainEvent::new(EMPLOYEE, "created", id).with_payload(employee)
}

pub fn employee_updated(id: impl Into<EntityId>, employee: &EmployeeRecord) -> DomainEvent {
    DomainEvent::new(EMPLOYEE, "updated", id).with_payload(employee)
}

pub fn employee_deleted(id: impl Into<EntityId>) -> DomainEvent {
    DomainEvent::new(EMPLOYEE, "deleted", id)
}

pub fn org_unit_created(id: impl Into<EntityId>, org_unit: &OrgUnitRecord) -> DomainEvent {
    DomainEvent::new(ORG_UNIT, "created", id).with_payload(org_unit)
}

pub fn org_unit_updated(id: impl Into<EntityId>, org_unit: &OrgUnitRecord) -> DomainEvent {
    DomainEvent::new(ORG_UNIT, "updated", id).with_payload(org_unit)
}

pub fn org_unit_deleted(id: impl Into<EntityId>) -> DomainEvent {
    DomainEvent::new(ORG_UNIT, "deleted", id)
}

/// Bind the replica queue to every employee and org-unit event on
/// `exchange`.
pub fn register(topology: &mut TopologyRegistry, exchange: &str) {
    topology.register([Binding::new(EMPLOYEE_REPLICA_QUEUE, exchange)
        .routes([format!("{}.*", EMPLOYEE), format!("{}.*", ORG_UNIT)])]);
}

/// Publishes employee changes on a fixed exchange.
#[derive(Clone)]
pub struct EmployeeEvents {
    publisher: Publisher,
    exchange: String,
}

impl EmployeeEvents {
    pub fn new(publisher: Publisher, exchange: impl Into<String>) -> Self {
        Self {
            publisher,
            exchange: exchange.into(),
        }
    }

    pub async fn created(&self, id: impl Into<EntityId>, employee: &EmployeeRecord) -> bool {
        self.emit(employee_created(id, employee)).await
    }

    pub async fn updated(&self, id: impl Into<EntityId>, employee: &EmployeeRecord) -> bool {
        self.emit(employee_updated(id, employee)).await
    }

    pub async fn deleted(&self, id: impl Into<EntityId>) -> bool {
        self.emit(employee_deleted(id)).await
    }

    pub async fn org_unit_created(&self, id: impl Into<EntityId>, org_unit: &OrgUnitRecord) -> bool {
        self.emit(org_unit_created(id, org_unit)).await
    }

    pub async fn org_unit_updated(&self, id: impl Into<EntityId>, org_unit: &OrgUnitRecord) -> bool {
        self.emit(org_unit_updated(id, org_unit)).await
    }

    pub async fn org_unit_deleted(&self, id: impl Into<EntityId>) -> bool {
        self.emit(org_unit_deleted(id)).await
    }

    async fn emit(&self, event: DomainEvent) -> bool {
        self.publisher.publish(event, &self.exchange).await
    }
}
