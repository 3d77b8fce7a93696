//! Domain records shared between the core and its external stores.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = Uuid;
pub type DeviceId = Uuid;
pub type RuleId = u64;
pub type LogId = u64;

/// An account as seen by the gateway: enough to authenticate a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub api_key: String,
}

/// A physical device bound to one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(default = "Uuid::new_v4")]
    pub id: DeviceId,
    pub user_id: UserId,
    #[serde(default = "default_device_name")]
    pub name: String,
    pub device_uid: String,
    #[serde(default)]
    pub battery: i32,
    #[serde(default)]
    pub online: bool,
}

pub fn default_device_name() -> String {
    "Unknown Device".to_string()
}

/// Category of inbound event used to select candidate rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Sms,
    Notification,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP verbs a webhook may be called with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

/// A user-declared filter plus webhook target. Read-only to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingRule {
    #[serde(default)]
    pub id: RuleId,
    pub user_id: UserId,
    /// Restrict the rule to one device; `None` applies to all the user's devices.
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    pub trigger: TriggerKind,
    #[serde(default)]
    pub sender_filter: Option<String>,
    #[serde(default)]
    pub content_filter: Option<String>,
    pub webhook_url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub secret_header: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl ForwardingRule {
    /// Whether this rule is a candidate for events of `trigger` on `device_id`.
    pub fn applies_to(&self, device_id: DeviceId, trigger: TriggerKind) -> bool {
        self.is_active
            && self.trigger == trigger
            && self.device_id.is_none_or(|d| d == device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDirection {
    Inbound,
    Outbound,
}

/// Status of a message log entry. Only the log sink stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

/// A message log entry to be created in `pending` state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub user_id: UserId,
    pub device_id: Option<DeviceId>,
    pub direction: LogDirection,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub sim_slot: i32,
}
