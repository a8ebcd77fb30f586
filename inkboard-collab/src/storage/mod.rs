//! Durable room snapshots.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  save after commit/undo/redo  ┌──────────────────┐
//! │ RoomSession │ ────────────────────────────► │  SnapshotStore   │
//! │ (in-memory) │  save on autosave tick        │  (last writer    │
//! └──────┬──────┘                               │   wins per room) │
//!        ▲                                      └────────┬─────────┘
//!        │ load on first reference                       │
//!        └───────────────────────────────────────────────┘
//! ```
//!
//! A snapshot is the committed operation sequence plus the id counter.
//! Redo buffers and presence are never persisted.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};

use crate::operation::{Operation, OperationId};
use crate::oplog::OperationLog;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, SnapshotMetadata, StoreConfig};

/// Persisted form of one room's committed log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub operations: Vec<Operation>,
    pub next_id: OperationId,
}

impl RoomSnapshot {
    pub fn of(log: &OperationLog) -> Self {
        Self {
            operations: log.snapshot(),
            next_id: log.next_id(),
        }
    }

    pub fn into_log(self) -> OperationLog {
        OperationLog::hydrate(self.operations, self.next_id)
    }

    /// JSON body; operation payloads are arbitrary JSON.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Rejects snapshots whose ids leave no room for another commit.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let snapshot: Self = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        if snapshot.next_id == OperationId::MAX
            || snapshot.operations.iter().any(|op| op.id == OperationId::MAX)
        {
            return Err(StoreError::Deserialization("operation id space exhausted".into()));
        }
        Ok(snapshot)
    }
}

/// Keyed, overwrite-on-save snapshot storage.
///
/// Implementations must be safe to call from several rooms at once.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, room_id: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError>;

    /// `Ok(None)` when the room has never been saved.
    fn load(&self, room_id: &str) -> Result<Option<RoomSnapshot>, StoreError>;

    fn list_rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    Serialization(String),
    Deserialization(String),
    Compression(String),
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
