//! Wire messages exchanged between the in-page content script and the
//! extension background over the long-lived port.
//! Kept in a dedicated crate so the background side and any test harness
//! share one definition of the envelope without pulling in the runtime.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub const TYPE_STATUS_UPDATE: &str = "statusUpdate";
pub const TYPE_SETTINGS_CHANGED: &str = "settingsChanged";
pub const TYPE_PUSH_TRIGGER: &str = "pushTrigger";
pub const TYPE_HEARTBEAT_RESPONSE: &str = "heartbeatResponse";
pub const TYPE_CONTENT_READY: &str = "contentScriptReady";
pub const TYPE_HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("envelope encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    Pending,
    Uploading,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub state: UploadState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, rename = "fileCount", skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u32>,
}

/// Messages the background pushes to the content script.
///
/// The four core kinds are typed; every other tag is carried opaquely in
/// [`InboundMessage::Other`] and forwarded to the UI as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    StatusUpdate { status: UploadStatus },
    SettingsChanged { valid: bool },
    PushTrigger,
    HeartbeatResponse { timestamp: u64 },
    Other { kind: String, payload: Value },
}

impl InboundMessage {
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::StatusUpdate { .. } => TYPE_STATUS_UPDATE,
            InboundMessage::SettingsChanged { .. } => TYPE_SETTINGS_CHANGED,
            InboundMessage::PushTrigger => TYPE_PUSH_TRIGGER,
            InboundMessage::HeartbeatResponse { .. } => TYPE_HEARTBEAT_RESPONSE,
            InboundMessage::Other { kind, .. } => kind,
        }
    }

    /// Whether handling this message touches the UI layer. Only liveness
    /// bookkeeping is exempt.
    pub fn requires_ui(&self) -> bool {
        !matches!(self, InboundMessage::HeartbeatResponse { .. })
    }
}

/// An inbound message together with its optional idempotency identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub message_id: Option<String>,
    pub message: InboundMessage,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "messageId")]
    message_id: Option<String>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawStatusUpdate {
    status: UploadStatus,
}

#[derive(Debug, Deserialize)]
struct RawSettingsChanged {
    #[serde(default)]
    valid: bool,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeatResponse {
    #[serde(default)]
    timestamp: u64,
}

fn typed<T: serde::de::DeserializeOwned>(
    kind: &str,
    fields: Map<String, Value>,
) -> Result<T, ProtoError> {
    serde_json::from_value(Value::Object(fields)).map_err(|source| ProtoError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

impl InboundEnvelope {
    pub fn new(message: InboundMessage) -> Self {
        Self {
            message_id: None,
            message,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtoError::Malformed)?;
        let message = match raw.kind.as_str() {
            TYPE_STATUS_UPDATE => {
                let body: RawStatusUpdate = typed(&raw.kind, raw.fields)?;
                InboundMessage::StatusUpdate {
                    status: body.status,
                }
            }
            TYPE_SETTINGS_CHANGED => {
                let body: RawSettingsChanged = typed(&raw.kind, raw.fields)?;
                InboundMessage::SettingsChanged { valid: body.valid }
            }
            TYPE_PUSH_TRIGGER => InboundMessage::PushTrigger,
            TYPE_HEARTBEAT_RESPONSE => {
                let body: RawHeartbeatResponse = typed(&raw.kind, raw.fields)?;
                InboundMessage::HeartbeatResponse {
                    timestamp: body.timestamp,
                }
            }
            _ => InboundMessage::Other {
                kind: raw.kind,
                payload: Value::Object(raw.fields),
            },
        };
        Ok(Self {
            message_id: raw.message_id,
            message,
        })
    }

    /// Background-side encoding, used by in-process backgrounds and tests.
    pub fn encode(&self) -> Result<String, ProtoError> {
        let mut body = match &self.message {
            InboundMessage::StatusUpdate { status } => json!({ "status": status }),
            InboundMessage::SettingsChanged { valid } => json!({ "valid": valid }),
            InboundMessage::PushTrigger => json!({}),
            InboundMessage::HeartbeatResponse { timestamp } => json!({ "timestamp": timestamp }),
            InboundMessage::Other { payload, .. } => match payload {
                Value::Object(map) => Value::Object(map.clone()),
                other => json!({ "payload": other }),
            },
        };
        if let Value::Object(map) = &mut body {
            map.insert("type".into(), Value::String(self.message.kind().to_string()));
            if let Some(id) = &self.message_id {
                map.insert("messageId".into(), Value::String(id.clone()));
            }
        }
        serde_json::to_string(&body).map_err(ProtoError::Encode)
    }
}

/// Messages the content script sends to the background.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Sent once after every (re)connection completes.
    ContentReady { url: Option<String> },
    Heartbeat { timestamp: u64 },
    Business {
        kind: String,
        message_id: String,
        payload: Value,
    },
}

impl OutboundMessage {
    pub fn business(kind: impl Into<String>, payload: Value) -> Self {
        OutboundMessage::Business {
            kind: kind.into(),
            message_id: Uuid::new_v4().to_string(),
            payload,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            OutboundMessage::ContentReady { .. } => TYPE_CONTENT_READY,
            OutboundMessage::Heartbeat { .. } => TYPE_HEARTBEAT,
            OutboundMessage::Business { kind, .. } => kind,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, OutboundMessage::Heartbeat { .. })
    }

    pub fn encode(&self) -> Result<String, ProtoError> {
        let value = match self {
            OutboundMessage::ContentReady { url } => json!({
                "type": TYPE_CONTENT_READY,
                "url": url,
            }),
            OutboundMessage::Heartbeat { timestamp } => json!({
                "type": TYPE_HEARTBEAT,
                "timestamp": timestamp,
            }),
            OutboundMessage::Business {
                kind,
                message_id,
                payload,
            } => json!({
                "type": kind,
                "messageId": message_id,
                "payload": payload,
            }),
        };
        serde_json::to_string(&value).map_err(ProtoError::Encode)
    }
}
