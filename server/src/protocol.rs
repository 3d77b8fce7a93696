//! Device wire protocol.
//!
//! Every frame is a JSON text message `{"type": <KIND>, "data": {...}}`.
//!
//! | Type                    | Direction      | Payload                                      |
//! |-------------------------|----------------|----------------------------------------------|
//! | `AUTH`                  | device → server | `api_key`, `device_uid`                      |
//! | `AUTH_OK`               | server → device | `device_id`                                  |
//! | `AUTH_FAIL`             | server → device | `error`                                      |
//! | `PING`                  | device → server | `battery`, `signal`                          |
//! | `PONG`                  | server → device | `timestamp`                                  |
//! | `SMS_RECEIVED`          | device → server | `sender`, `content`, `sim_slot`, `timestamp` |
//! | `NOTIFICATION_RECEIVED` | device → server | `package_name`, `title`, `content`, `timestamp` |
//! | `SEND_SMS`              | server → device | `request_id`, `phone`, `content`, `sim_slot` |
//! | `SMS_SENT`              | device → server | `request_id`                                 |
//! | `SMS_FAILED`            | device → server | `request_id`, `error`                        |
//!
//! Device timestamps arrive as epoch milliseconds, RFC 3339 strings or empty
//! strings depending on the client build; anything unparseable becomes `None`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::models::DeviceId;

/// Default upper bound on an inbound frame, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 8192;

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// A decoded device → server message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Auth(AuthData),
    Ping(PingData),
    SmsReceived(SmsReceivedData),
    NotificationReceived(NotificationReceivedData),
    SmsSent(SmsSentData),
    SmsFailed(SmsFailedData),
    /// A well-formed envelope whose `type` is not a device → server kind.
    Unknown(String),
}

impl DeviceMessage {
    /// Decode one text frame, rejecting frames larger than `limit` bytes.
    pub fn decode(frame: &str, limit: usize) -> Result<Self, ProtocolError> {
        if frame.len() > limit {
            return Err(ProtocolError::TooLarge {
                size: frame.len(),
                limit,
            });
        }
        let raw: RawEnvelope = serde_json::from_str(frame).map_err(ProtocolError::Envelope)?;
        let msg = match raw.kind.as_str() {
            "AUTH" => Self::Auth(payload(&raw)?),
            "PING" => Self::Ping(payload(&raw)?),
            "SMS_RECEIVED" => Self::SmsReceived(payload(&raw)?),
            "NOTIFICATION_RECEIVED" => Self::NotificationReceived(payload(&raw)?),
            "SMS_SENT" => Self::SmsSent(payload(&raw)?),
            "SMS_FAILED" => Self::SmsFailed(payload(&raw)?),
            _ => Self::Unknown(raw.kind),
        };
        Ok(msg)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Auth(_) => "AUTH",
            Self::Ping(_) => "PING",
            Self::SmsReceived(_) => "SMS_RECEIVED",
            Self::NotificationReceived(_) => "NOTIFICATION_RECEIVED",
            Self::SmsSent(_) => "SMS_SENT",
            Self::SmsFailed(_) => "SMS_FAILED",
            Self::Unknown(kind) => kind,
        }
    }
}

fn payload<T: for<'de> Deserialize<'de>>(raw: &RawEnvelope) -> Result<T, ProtocolError> {
    // Payload-less kinds (`{"type":"PING"}`) decode as an empty object.
    let data = if raw.data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        raw.data.clone()
    };
    serde_json::from_value(data).map_err(|source| ProtocolError::Payload {
        kind: raw.kind.clone(),
        source,
    })
}

/// A server → device message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    AuthOk(AuthOkData),
    AuthFail(AuthFailData),
    Pong(PongData),
    SendSms(SendSmsData),
}

impl ServerMessage {
    pub fn auth_fail(error: impl Into<String>) -> Self {
        Self::AuthFail(AuthFailData {
            error: error.into(),
        })
    }

    pub fn pong() -> Self {
        Self::Pong(PongData {
            timestamp: Utc::now(),
        })
    }

    /// Serialize to the JSON text frame sent over the socket.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("server message serializes")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    pub api_key: String,
    pub device_uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOkData {
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFailData {
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingData {
    #[serde(default)]
    pub battery: i32,
    #[serde(default)]
    pub signal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongData {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsReceivedData {
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub sim_slot: i32,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReceivedData {
    pub package_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSmsData {
    pub request_id: String,
    pub phone: String,
    pub content: String,
    pub sim_slot: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsSentData {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsFailedData {
    pub request_id: String,
    #[serde(default)]
    pub error: String,
}

/// Epoch values below this are taken as seconds rather than milliseconds.
const EPOCH_MS_THRESHOLD: i64 = 100_000_000_000;

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_i64().and_then(|n| {
            if n.abs() < EPOCH_MS_THRESHOLD {
                Utc.timestamp_opt(n, 0).single()
            } else {
                Utc.timestamp_millis_opt(n).single()
            }
        }),
        Value::String(s) if !s.is_empty() => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    })
}
