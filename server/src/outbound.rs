//! Send-SMS commands: validate, pick a device, log, and push `SEND_SMS` onto
//! the device's session.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CommandError;
use crate::models::{DeviceId, LogDirection, LogStatus, NewLogEntry, UserId};
use crate::protocol::{SendSmsData, ServerMessage};
use crate::registry::SessionRegistry;
use crate::store::Stores;

/// Longest accepted message body, in bytes.
pub const MAX_SMS_CONTENT: usize = 1600;

static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{7,15}$").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct SendSmsRequest {
    /// Target device; when absent the user's longest-connected online device is used.
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    pub phone: String,
    pub content: String,
    #[serde(default)]
    pub sim_slot: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendSmsReceipt {
    /// Correlates the device's `SMS_SENT` / `SMS_FAILED` report.
    pub request_id: String,
    pub status: &'static str,
    pub device_id: DeviceId,
}

impl SendSmsRequest {
    fn validate(&self) -> Result<(), CommandError> {
        if self.phone.is_empty() {
            return Err(CommandError::Invalid("phone is required"));
        }
        if self.content.is_empty() {
            return Err(CommandError::Invalid("content is required"));
        }
        if self.content.len() > MAX_SMS_CONTENT {
            return Err(CommandError::Invalid(
                "content exceeds maximum length of 1600 characters",
            ));
        }
        if !PHONE_PATTERN.is_match(&self.phone) {
            return Err(CommandError::Invalid("invalid phone number format"));
        }
        Ok(())
    }
}

/// Queue an SMS for a user's device. Returns once `SEND_SMS` is on the
/// device's outbound buffer; the device reports the result later.
pub async fn send_sms(
    registry: &SessionRegistry,
    stores: &Stores,
    user_id: UserId,
    req: SendSmsRequest,
) -> Result<SendSmsReceipt, CommandError> {
    req.validate()?;
    let device_id = target_device(registry, stores, user_id, req.device_id).await?;

    let log_id = stores
        .logs
        .create(NewLogEntry {
            user_id,
            device_id: Some(device_id),
            direction: LogDirection::Outbound,
            sender: String::new(),
            receiver: req.phone.clone(),
            content: req.content.clone(),
            sim_slot: req.sim_slot,
        })
        .await?;
    let request_id = log_id.to_string();

    let msg = ServerMessage::SendSms(SendSmsData {
        request_id: request_id.clone(),
        phone: req.phone,
        content: req.content,
        sim_slot: req.sim_slot,
    });
    if let Err(e) = registry.send(device_id, msg).await {
        warn!(device_id = %device_id, log_id, "SEND_SMS not queued: {e}");
        if let Err(e) = stores
            .logs
            .update_status(log_id, LogStatus::Failed, Some("failed to send to device".into()))
            .await
        {
            warn!(log_id, "Failed to mark outbound SMS failed: {e}");
        }
        return Err(e.into());
    }

    info!(device_id = %device_id, user_id = %user_id, log_id, "SEND_SMS queued");
    Ok(SendSmsReceipt {
        request_id,
        status: "queued",
        device_id,
    })
}

async fn target_device(
    registry: &SessionRegistry,
    stores: &Stores,
    user_id: UserId,
    requested: Option<DeviceId>,
) -> Result<DeviceId, CommandError> {
    let Some(device_id) = requested else {
        return registry
            .online_devices_for_user(user_id)
            .await
            .into_iter()
            .next()
            .ok_or(CommandError::NoOnlineDevice);
    };

    let device = stores
        .devices
        .find_by_id(device_id)
        .await?
        .filter(|d| d.user_id == user_id)
        .ok_or(CommandError::DeviceNotFound)?;
    if registry.is_online(device.id).await {
        Ok(device.id)
    } else {
        Err(CommandError::DeviceOffline)
    }
}
