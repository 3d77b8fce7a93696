//! In-memory implementation of every store trait.
//!
//! Seeded from a TOML fixtures file:
//!
//! ```toml
//! [[accounts]]
//! id = "6f1c1b86-4bde-4d8e-9d33-6f6a2c1f0a11"
//! api_key = "user-api-key"
//!
//! [[rules]]
//! user_id = "6f1c1b86-4bde-4d8e-9d33-6f6a2c1f0a11"
//! trigger = "sms"
//! sender_filter = "^\\+84"
//! webhook_url = "https://hooks.example.com/sms"
//! secret_header = "s3cret"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AccountStore, DeviceStore, LogSink, RuleStore};
use crate::error::StoreError;
use crate::models::{
    Account, Device, DeviceId, ForwardingRule, LogId, LogStatus, NewLogEntry, TriggerKind, UserId,
};

/// Seed data for [`MemoryStore`].
#[derive(Debug, Default, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub rules: Vec<ForwardingRule>,
}

/// A log entry plus every status it has passed through.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub entry: NewLogEntry,
    pub status: LogStatus,
    pub error: Option<String>,
    pub history: Vec<LogStatus>,
}

pub struct MemoryStore {
    accounts: RwLock<HashMap<String, Account>>,
    devices: RwLock<HashMap<DeviceId, Device>>,
    rules: RwLock<Vec<ForwardingRule>>,
    logs: RwLock<HashMap<LogId, LogRecord>>,
    next_rule_id: AtomicU64,
    next_log_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
            logs: RwLock::new(HashMap::new()),
            next_rule_id: AtomicU64::new(1),
            next_log_id: AtomicU64::new(1),
        }
    }

    pub async fn from_fixtures(fixtures: Fixtures) -> Self {
        let store = Self::new();
        for account in fixtures.accounts {
            store.add_account(account).await;
        }
        for device in fixtures.devices {
            store.add_device(device).await;
        }
        for rule in fixtures.rules {
            store.add_rule(rule).await;
        }
        store
    }

    /// Load fixtures from a TOML file.
    pub async fn from_fixtures_file(path: &Path) -> Result<Self, StoreError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::Backend(format!("read {}: {e}", path.display())))?;
        let fixtures: Fixtures = toml::from_str(&content)
            .map_err(|e| StoreError::Backend(format!("parse {}: {e}", path.display())))?;
        Ok(Self::from_fixtures(fixtures).await)
    }

    pub async fn add_account(&self, account: Account) {
        self.accounts
            .write()
            .await
            .insert(account.api_key.clone(), account);
    }

    pub async fn add_device(&self, device: Device) {
        self.devices.write().await.insert(device.id, device);
    }

    /// Insert a rule, assigning an id when it has none. Returns the id.
    pub async fn add_rule(&self, mut rule: ForwardingRule) -> u64 {
        if rule.id == 0 {
            rule.id = self.next_rule_id.fetch_add(1, Ordering::Relaxed);
        } else {
            self.next_rule_id.fetch_max(rule.id + 1, Ordering::Relaxed);
        }
        let id = rule.id;
        self.rules.write().await.push(rule);
        id
    }

    pub async fn device(&self, id: DeviceId) -> Option<Device> {
        self.devices.read().await.get(&id).cloned()
    }

    pub async fn log(&self, id: LogId) -> Option<LogRecord> {
        self.logs.read().await.get(&id).cloned()
    }

    /// All log entries ordered by id.
    pub async fn logs(&self) -> Vec<(LogId, LogRecord)> {
        let logs = self.logs.read().await;
        let mut all: Vec<_> = logs.iter().map(|(id, r)| (*id, r.clone())).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn user_by_api_key(&self, api_key: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.read().await.get(api_key).cloned())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self.device(id).await)
    }

    async fn find_by_uid(&self, device_uid: &str) -> Result<Option<Device>, StoreError> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .find(|d| d.device_uid == device_uid)
            .cloned())
    }

    async fn register(
        &self,
        user_id: UserId,
        name: &str,
        device_uid: &str,
    ) -> Result<Device, StoreError> {
        let mut devices = self.devices.write().await;
        if devices.values().any(|d| d.device_uid == device_uid) {
            return Err(StoreError::Conflict(format!(
                "device uid {device_uid} already exists"
            )));
        }
        let device = Device {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            device_uid: device_uid.to_string(),
            battery: 0,
            online: false,
        };
        devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn set_online(&self, id: DeviceId, battery: i32) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(&id).ok_or(StoreError::NotFound("device"))?;
        device.online = true;
        device.battery = battery;
        Ok(())
    }

    async fn set_offline(&self, id: DeviceId) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(&id).ok_or(StoreError::NotFound("device"))?;
        device.online = false;
        Ok(())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn active_rules(
        &self,
        device_id: DeviceId,
        trigger: TriggerKind,
    ) -> Result<Vec<ForwardingRule>, StoreError> {
        let Some(owner) = self.device(device_id).await.map(|d| d.user_id) else {
            return Ok(Vec::new());
        };
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.user_id == owner && r.applies_to(device_id, trigger))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LogSink for MemoryStore {
    async fn create(&self, entry: NewLogEntry) -> Result<LogId, StoreError> {
        let id = self.next_log_id.fetch_add(1, Ordering::Relaxed);
        self.logs.write().await.insert(
            id,
            LogRecord {
                entry,
                status: LogStatus::Pending,
                error: None,
                history: vec![LogStatus::Pending],
            },
        );
        Ok(id)
    }

    async fn find(&self, id: LogId) -> Result<Option<NewLogEntry>, StoreError> {
        Ok(self.logs.read().await.get(&id).map(|r| r.entry.clone()))
    }

    async fn update_status(
        &self,
        id: LogId,
        status: LogStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut logs = self.logs.write().await;
        let record = logs.get_mut(&id).ok_or(StoreError::NotFound("log entry"))?;
        record.status = status;
        if error.is_some() {
            record.error = error;
        }
        record.history.push(status);
        Ok(())
    }
}
