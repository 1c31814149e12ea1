//! JSON envelopes carried over the WebSocket.
//!
//! Every frame is a JSON object whose `type` field selects the handler.
//! Outbound models implement [`Envelope`], which stamps `type` at encode time
//! so handlers never set the tag by hand.

use axum::extract::ws::{Message, Utf8Bytes};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A self-describing outbound message.
pub trait Envelope: Serialize {
    const TYPE: &'static str;

    /// Serialize to JSON text with `type` set to [`Self::TYPE`].
    fn encode(&self) -> Result<Utf8Bytes, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("type".to_string(), Value::String(Self::TYPE.to_string()));
        }
        Ok(serde_json::to_string(&value)?.into())
    }

    fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(self.encode()?))
    }
}

/// Only the discriminator of an inbound frame. `type` is required.
#[derive(Debug, Deserialize)]
pub struct TypeTag {
    #[serde(rename = "type")]
    pub kind: String,
}

pub fn decode_type_tag(raw: &[u8]) -> Result<TypeTag, serde_json::Error> {
    serde_json::from_slice(raw)
}

/// In-band failure kinds sent in `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadFormat,
    MessageEmpty,
    DatabaseError,
    MissingId,
    NotFound,
    RoomNameEmpty,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WhoAmI {
    #[serde(default)]
    pub n: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub nick: String,
}

impl Envelope for WhoAmI {
    const TYPE: &'static str = "whoami";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub n: String,
    pub error: ErrorKind,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            n: String::new(),
            error,
            message: message.into(),
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.n = nonce.into();
        self
    }
}

impl Envelope for ErrorEnvelope {
    const TYPE: &'static str = "error";
}

/// Inbound chat message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgSend {
    #[serde(default)]
    pub n: String,
    #[serde(default)]
    pub msg: String,
}

impl Envelope for MsgSend {
    const TYPE: &'static str = "msg_send";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MsgBroadcast {
    #[serde(default)]
    pub n: String,
    pub m_id: String,
    pub author: Author,
    pub msg: String,
    pub time: i64,
}

impl Envelope for MsgBroadcast {
    const TYPE: &'static str = "msg_broadcast";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub m_id: String,
    pub author: Author,
    pub msg: String,
    pub time: i64,
}

/// History query (inbound) and its reply (outbound, with `messages`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgHistory {
    #[serde(default)]
    pub n: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<i64>,
    #[serde(default)]
    pub messages: Vec<HistoryEntry>,
}

impl Envelope for MsgHistory {
    const TYPE: &'static str = "msg_history";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomCreate {
    #[serde(default)]
    pub n: String,
    #[serde(default)]
    pub name: String,
}

impl Envelope for RoomCreate {
    const TYPE: &'static str = "room_create";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomGet {
    #[serde(default)]
    pub n: String,
    #[serde(default)]
    pub r_id: String,
}

impl Envelope for RoomGet {
    const TYPE: &'static str = "room_get";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomInfo {
    #[serde(default)]
    pub n: String,
    pub r_id: String,
    pub name: String,
    pub o_id: String,
}

impl Envelope for RoomInfo {
    const TYPE: &'static str = "room";
}
