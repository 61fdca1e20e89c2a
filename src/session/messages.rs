//! Frames exchanged on the session WebSocket.
//!
//! Heartbeats are the bare text frames `ping`/`pong`, not JSON. Everything
//! else is a JSON object with a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// heartbeat text frames
pub const HEARTBEAT_PING: &str = "ping";
pub const HEARTBEAT_PONG: &str = "pong";

// 消息类型常量
pub const MSG_TYPE_AUTH: &str = "auth";
pub const MSG_TYPE_AUTH_RESPONSE: &str = "auth_response";
pub const MSG_TYPE_STATUS_UPDATE: &str = "user_status_update";
pub const MSG_TYPE_PING: &str = "ping";

pub const AUTH_STATUS_SUCCESS: &str = "success";

/// First frame a client sends after the socket opens.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthRequest {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub token: String,
    pub user_id: u64,
}

impl AuthRequest {
    pub fn new(token: impl Into<String>, user_id: u64) -> Self {
        Self {
            msg_type: MSG_TYPE_AUTH.to_string(),
            token: token.into(),
            user_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuthResponse {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            msg_type: MSG_TYPE_AUTH_RESPONSE.to_string(),
            status: AUTH_STATUS_SUCCESS.to_string(),
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            msg_type: MSG_TYPE_AUTH_RESPONSE.to_string(),
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AUTH_STATUS_SUCCESS
    }
}

/// What an inbound text frame means to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Bare `ping` or `{"type":"ping"}`; answered with `pong`, never forwarded.
    Ping,
    /// Bare `pong`.
    Pong,
    AuthResponse(AuthResponse),
    /// `user_status_update` events, for the status observer.
    StatusUpdate(Value),
    /// Any other JSON object, for the message observer.
    Message(Value),
}

/// Classifies a text frame. `None` means it was neither a heartbeat nor a
/// JSON object and should be dropped.
pub fn classify(text: &str) -> Option<Inbound> {
    match text {
        HEARTBEAT_PING => return Some(Inbound::Ping),
        HEARTBEAT_PONG => return Some(Inbound::Pong),
        _ => {}
    }

    let value: Value = serde_json::from_str(text).ok()?;
    if !value.is_object() {
        return None;
    }

    let inbound = match value.get("type").and_then(Value::as_str) {
        Some(MSG_TYPE_PING) => Inbound::Ping,
        Some(MSG_TYPE_STATUS_UPDATE) => Inbound::StatusUpdate(value),
        Some(MSG_TYPE_AUTH_RESPONSE) => match serde_json::from_value::<AuthResponse>(value.clone())
        {
            Ok(resp) => Inbound::AuthResponse(resp),
            Err(_) => Inbound::Message(value),
        },
        _ => Inbound::Message(value),
    };
    Some(inbound)
}
