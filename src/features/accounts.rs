//! SSO account sync.
//!
//! The SSO service publishes `user.*` events on its own exchange. This
//! feature binds a queue to them and mirrors the users into an
//! [`AccountDirectory`]. Every handler is an upsert, so replays and
//! out-of-order duplicates converge on the same state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::event::{routing_key, DomainEvent};
use crate::handlers::{EventHandler, HandlerError, HandlerRegistry};
use crate::topology::{Binding, TopologyRegistry};

/// Exchange the SSO service publishes on.
pub const SSO_EXCHANGE: &str = "sso.events";
/// Queue holding SSO user events for this service.
pub const SSO_USERS_QUEUE: &str = "hris.sso.users";

const USER: &str = "user";

/// A user account mirrored from SSO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub sso_user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub active: bool,
}

/// User fields carried in `user.created` and `user.updated` payloads.
#[derive(Debug, Deserialize)]
struct UserPayload {
    email: String,
    #[serde(default, alias = "name")]
    display_name: Option<String>,
    #[serde(default = "default_active", alias = "is_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

/// Where mirrored accounts are stored.
#[async_trait]
pub trait AccountDirectory: Send + Sync + 'static {
    /// Insert or replace an account.
    async fn upsert(&self, account: Account) -> Result<(), HandlerError>;

    /// Mark an account inactive. Returns whether the account was known.
    async fn deactivate(&self, sso_user_id: &str) -> Result<bool, HandlerError>;

    async fn get(&self, sso_user_id: &str) -> Result<Option<Account>, HandlerError>;
}

/// Process-local directory, for tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    accounts: RwLock<HashMap<String, Account>>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn upsert(&self, account: Account) -> Result<(), HandlerError> {
        self.accounts
            .write()
            .await
            .insert(account.sso_user_id.clone(), account);
        Ok(())
    }

    async fn deactivate(&self, sso_user_id: &str) -> Result<bool, HandlerError> {
        let mut accounts = self.accounts.write().await;
        match accounts.get_mut(sso_user_id) {
            Some(account) => {
                account.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, sso_user_id: &str) -> Result<Option<Account>, HandlerError> {
        Ok(self.accounts.read().await.get(sso_user_id).cloned())
    }
}

fn account_from_event(event: &DomainEvent) -> Result<Account, HandlerError> {
    let payload: UserPayload = event.payload()?;
    Ok(Account {
        sso_user_id: event.entity_id.to_string(),
        email: payload.email,
        display_name: payload.display_name,
        active: payload.active,
    })
}

/// Handles `user.created`.
pub struct UserCreated {
    directory: Arc<dyn AccountDirectory>,
}

#[async_trait]
impl EventHandler for UserCreated {
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let account = account_from_event(event)?;
        info!(sso_user_id = %account.sso_user_id, "Provisioning account from SSO");
        self.directory.upsert(account).await
    }
}

/// Handles `user.updated`. An update for an unknown user creates it.
pub struct UserUpdated {
    directory: Arc<dyn AccountDirectory>,
}

#[async_trait]
impl EventHandler for UserUpdated {
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let account = account_from_event(event)?;
        self.directory.upsert(account).await
    }
}

/// Handles `user.deleted` by deactivating the account.
pub struct UserDeleted {
    directory: Arc<dyn AccountDirectory>,
}

#[async_trait]
impl EventHandler for UserDeleted {
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let sso_user_id = event.entity_id.to_string();
        if !self.directory.deactivate(&sso_user_id).await? {
            debug!(sso_user_id = %sso_user_id, "Deleted user was never provisioned");
        }
        Ok(())
    }
}

/// Bind the SSO user queue and register the account handlers.
pub fn register(
    topology: &mut TopologyRegistry,
    handlers: &mut HandlerRegistry,
    directory: Arc<dyn AccountDirectory>,
) {
    topology.register([Binding::new(SSO_USERS_QUEUE, SSO_EXCHANGE).route("user.*")]);

    let dir = Arc::clone(&directory);
    handlers.register_with::<UserCreated, _>(routing_key(USER, "created"), move || UserCreated {
        directory: Arc::clone(&dir),
    });
    let dir = Arc::clone(&directory);
    handlers.register_with::<UserUpdated, _>(routing_key(USER, "updated"), move || UserUpdated {
        directory: Arc::clone(&dir),
    });
    handlers.register_with::<UserDeleted, _>(routing_key(USER, "deleted"), move || UserDeleted {
        directory: Arc::clone(&directory),
    });
}
