//! Interfaces to the collaborators the gateway does not own: accounts,
//! device records, forwarding rules and the message log.
//!
//! The core only talks to these traits. [`memory::MemoryStore`] implements
//! all four for tests and single-node deployments seeded from a fixtures file.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{
    Account, Device, DeviceId, ForwardingRule, LogId, LogStatus, NewLogEntry, TriggerKind, UserId,
};

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Resolve the account owning an API key.
    async fn user_by_api_key(&self, api_key: &str) -> Result<Option<Account>, StoreError>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>, StoreError>;
    async fn find_by_uid(&self, device_uid: &str) -> Result<Option<Device>, StoreError>;
    /// Create a device record bound to `user_id`.
    async fn register(
        &self,
        user_id: UserId,
        name: &str,
        device_uid: &str,
    ) -> Result<Device, StoreError>;
    async fn set_online(&self, id: DeviceId, battery: i32) -> Result<(), StoreError>;
    async fn set_offline(&self, id: DeviceId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Active rules of `trigger` kind owned by the device's user whose device
    /// filter is absent or names `device_id`.
    async fn active_rules(
        &self,
        device_id: DeviceId,
        trigger: TriggerKind,
    ) -> Result<Vec<ForwardingRule>, StoreError>;
}

#[async_trait]
pub trait LogSink: Send + Sync {
    /// Create a log entry in `pending` state.
    async fn create(&self, entry: NewLogEntry) -> Result<LogId, StoreError>;
    /// The entry as it was created, if it exists.
    async fn find(&self, id: LogId) -> Result<Option<NewLogEntry>, StoreError>;
    async fn update_status(
        &self,
        id: LogId,
        status: LogStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;
}

/// The set of collaborators injected into the gateway.
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub rules: Arc<dyn RuleStore>,
    pub logs: Arc<dyn LogSink>,
}

impl Stores {
    /// Use one [`memory::MemoryStore`] for every collaborator.
    pub fn from_memory(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            accounts: store.clone(),
            devices: store.clone(),
            rules: store.clone(),
            logs: store,
        }
    }
}
