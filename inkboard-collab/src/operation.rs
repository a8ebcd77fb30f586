//! Committed drawing operations.
//!
//! An [`Operation`] is the unit the room log orders, undoes and redoes. Its
//! payload is whatever the drawing client sent (minus the `final` flag) and
//! is never interpreted here: only the renderer cares about geometry.
//!
//! ```text
//! stroke { type?, points?, x?, y?, ..., final: true }
//!            │
//!            ▼
//! OperationDraft { kind, payload }      ← classified, not validated
//!            │  OperationLog::commit()
//!            ▼
//! Operation { id, authorId, kind, payload }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Transport-assigned identity of one WebSocket connection.
pub type ConnectionId = Uuid;

/// Room-unique, monotonically assigned operation identifier.
pub type OperationId = u64;

/// Broad category of a drawing operation, taken from the client's `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    FreehandPath,
    Rectangle,
    Text,
    Image,
}

impl OperationKind {
    /// Classify a stroke by its `type` tag. Untagged strokes are freehand paths.
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            Some("rect") | Some("rectangle") => Self::Rectangle,
            Some("text") => Self::Text,
            Some("image") => Self::Image,
            _ => Self::FreehandPath,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FreehandPath => "freehand-path",
            Self::Rectangle => "rectangle",
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

/// An operation before commit: no id, no author.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    pub kind: OperationKind,
    pub payload: Value,
}

impl OperationDraft {
    pub fn new(kind: OperationKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// Build a draft from a raw stroke object.
    ///
    /// The `final` flag is transport bookkeeping and is stripped; every other
    /// field is kept verbatim.
    pub fn from_stroke(body: &Map<String, Value>) -> Self {
        let kind = OperationKind::from_tag(body.get("type").and_then(Value::as_str));
        let mut payload = body.clone();
        payload.remove("final");
        Self {
            kind,
            payload: Value::Object(payload),
        }
    }
}

/// A committed, immutable drawing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    /// `None` for system-originated operations.
    pub author_id: Option<ConnectionId>,
    pub kind: OperationKind,
    pub payload: Value,
}

impl Operation {
    pub fn is_authored_by(&self, author: &ConnectionId) -> bool {
        self.author_id.as_ref() == Some(author)
    }
}
