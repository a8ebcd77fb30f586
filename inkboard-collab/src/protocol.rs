//! Text wire protocol: named JSON events.
//!
//! Wire format (one WebSocket text frame per event):
//! ```text
//! { "event": "<name>", "data": <payload> }
//! ```
//!
//! Inbound frames are decoded in two stages, envelope first and payload
//! second, so a frame with a known name but a bad payload is rejected on its
//! own as [`ProtocolError::MalformedPayload`] and can be ignored without
//! disturbing the connection.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::operation::{ConnectionId, Operation, OperationDraft, OperationId};
use crate::presence::{Point, PresenceSnapshot};

pub const EVENT_JOIN_ROOM: &str = "join-room";
pub const EVENT_STROKE: &str = "stroke";
pub const EVENT_CURSOR: &str = "cursor";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_UNDO: &str = "undo";
pub const EVENT_REDO: &str = "redo";
pub const EVENT_PING: &str = "ping";

// ───────────────────────────────────────────────────────────────────
// Inbound
// ───────────────────────────────────────────────────────────────────

/// Which operations an undo/redo may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HistoryScope {
    /// Only the requesting connection's own operations.
    #[default]
    #[serde(rename = "self")]
    Own,
    /// Whatever is most recent in the room.
    #[serde(rename = "global")]
    Global,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryRequest {
    #[serde(default)]
    scope: Option<HistoryScope>,
}

/// `join-room` payload. A bare string on the wire is a room id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl JoinRequest {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self {
            room_id: Some(room_id.into()),
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, display_name: impl Into<String>, color: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self.color = Some(color.into());
        self
    }
}

/// `presence` heartbeat payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A stroke as sent by a drawing client: live preview or final commit.
///
/// The body is kept verbatim so live fragments can be relayed untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct StrokeFragment {
    body: Map<String, Value>,
}

impl StrokeFragment {
    pub fn new(body: Map<String, Value>) -> Self {
        Self { body }
    }

    pub fn is_final(&self) -> bool {
        self.body.get("final").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn into_body(self) -> Map<String, Value> {
        self.body
    }

    pub fn to_draft(&self) -> OperationDraft {
        OperationDraft::from_stroke(&self.body)
    }
}

/// An intent received from a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinRoom(JoinRequest),
    Stroke(StrokeFragment),
    Cursor(Point),
    Presence(PresenceUpdate),
    Undo(HistoryScope),
    Redo(HistoryScope),
    Ping(Value),
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => EVENT_JOIN_ROOM,
            Self::Stroke(_) => EVENT_STROKE,
            Self::Cursor(_) => EVENT_CURSOR,
            Self::Presence(_) => EVENT_PRESENCE,
            Self::Undo(_) => EVENT_UNDO,
            Self::Redo(_) => EVENT_REDO,
            Self::Ping(_) => EVENT_PING,
        }
    }

    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: Frame = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Self::from_parts(&frame.event, frame.data)
    }

    fn from_parts(event: &str, data: Value) -> Result<Self, ProtocolError> {
        let malformed = |reason: String| ProtocolError::MalformedPayload {
            event: event.to_string(),
            reason,
        };

        match event {
            EVENT_JOIN_ROOM => match data {
                Value::Null => Ok(Self::JoinRoom(JoinRequest::default())),
                Value::String(room) => Ok(Self::JoinRoom(JoinRequest::room(room))),
                Value::Object(_) => serde_json::from_value(data)
                    .map(Self::JoinRoom)
                    .map_err(|e| malformed(e.to_string())),
                _ => Err(malformed("expected a room id or an object".into())),
            },
            EVENT_STROKE => match data {
                Value::Object(body) => Ok(Self::Stroke(StrokeFragment::new(body))),
                _ => Err(malformed("expected an object".into())),
            },
            EVENT_CURSOR => serde_json::from_value(data)
                .map(Self::Cursor)
                .map_err(|e| malformed(e.to_string())),
            EVENT_PRESENCE => match data {
                Value::Null => Ok(Self::Presence(PresenceUpdate::default())),
                data => serde_json::from_value(data)
                    .map(Self::Presence)
                    .map_err(|e| malformed(e.to_string())),
            },
            EVENT_UNDO | EVENT_REDO => {
                let request: HistoryRequest = match data {
                    Value::Null => HistoryRequest::default(),
                    data => serde_json::from_value(data).map_err(|e| malformed(e.to_string()))?,
                };
                let scope = request.scope.unwrap_or_default();
                if event == EVENT_UNDO {
                    Ok(Self::Undo(scope))
                } else {
                    Ok(Self::Redo(scope))
                }
            }
            EVENT_PING => Ok(Self::Ping(data)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    /// Encode as a text frame (client side).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = match self {
            Self::JoinRoom(request) => to_value(request)?,
            Self::Stroke(fragment) => Value::Object(fragment.body.clone()),
            Self::Cursor(point) => to_value(point)?,
            Self::Presence(update) => to_value(update)?,
            Self::Undo(scope) | Self::Redo(scope) => json!({ "scope": scope }),
            Self::Ping(value) => value.clone(),
        };
        serde_json::to_string(&json!({ "event": self.name(), "data": data }))
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

// ───────────────────────────────────────────────────────────────────
// Outbound
// ───────────────────────────────────────────────────────────────────

/// An event produced by a room (or by the transport, for `connected`/`pong`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Identity assigned to the connection by the transport.
    Connected { connection_id: ConnectionId },
    /// Full room state for a connection that just joined.
    Init {
        operations: Vec<Operation>,
        presence_table: PresenceSnapshot,
    },
    /// Live, uncommitted stroke fragment relayed verbatim.
    Stroke(Map<String, Value>),
    OperationAdded { operation: Operation },
    OperationRemoved { id: OperationId },
    Users { presence_table: PresenceSnapshot },
    Cursor {
        connection_id: ConnectionId,
        cursor: Point,
        display_name: String,
        color: String,
    },
    UserJoined {
        connection_id: ConnectionId,
        display_name: String,
        color: String,
    },
    UserLeft {
        connection_id: ConnectionId,
        display_name: Option<String>,
    },
    Pong { timestamp: Value },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Init { .. } => "init",
            Self::Stroke(_) => "stroke",
            Self::OperationAdded { .. } => "operation-added",
            Self::OperationRemoved { .. } => "operation-removed",
            Self::Users { .. } => "users",
            Self::Cursor { .. } => "cursor",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::Pong { .. } => "pong",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    UnknownEvent(String),
    MalformedPayload { event: String, reason: String },
    ConnectionFailed(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownEvent(name) => write!(f, "Unknown event: {name}"),
            Self::MalformedPayload { event, reason } => {
                write!(f, "Malformed '{event}' payload: {reason}")
            }
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
