//! # inkboard-collab — room-scoped sync engine for a shared drawing canvas
//!
//! Keeps every participant of a room on the same ordered list of committed
//! drawing operations, relays live strokes and cursors, tracks who is
//! present, and snapshots each room so it survives a restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON text frames   ┌──────────────┐
//! │ CanvasClient │ ◄──────────────────► │  SyncServer  │
//! │ + RoomReplica│                      │              │
//! └──────────────┘                      └──────┬───────┘
//!                                              │
//!                                       ┌──────┴───────┐
//!                                       │ RoomRegistry │
//!                                       └──────┬───────┘
//!                          ┌───────────────────┼───────────────────┐
//!                          ▼                   ▼                   ▼
//!                    RoomSession         RoomSession         RoomSession
//!                    ├ OperationLog      (one exclusive section each)
//!                    ├ PresenceTable
//!                    └ BroadcastGroup ──► members
//!                          │
//!                          ▼
//!                    SnapshotStore (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — committed operations and drafts
//! - [`oplog`] — append-ordered log with author-scoped undo/redo
//! - [`presence`] — per-room presence table with idle eviction
//! - [`protocol`] — `{event, data}` wire protocol
//! - [`broadcast`] — per-room fan-out of encoded frames
//! - [`room`] — room session, the per-room serialization point
//! - [`registry`] — get-or-hydrate room lookup
//! - [`storage`] — snapshot persistence
//! - [`maintenance`] — presence sweeper and autosave loops
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client and room replica

pub mod operation;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod broadcast;
pub mod room;
pub mod registry;
pub mod storage;
pub mod maintenance;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use operation::{ConnectionId, Operation, OperationDraft, OperationId, OperationKind};
pub use oplog::OperationLog;
pub use presence::{Point, PresenceEntry, PresenceSnapshot, PresenceTable};
pub use protocol::{
    ClientEvent, HistoryScope, JoinRequest, PresenceUpdate, ProtocolError, ServerEvent,
    StrokeFragment,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope, Recipients};
pub use room::{RoomId, RoomSession, DEFAULT_ROOM};
pub use registry::{Attachment, RoomRegistry};
pub use storage::{
    MemorySnapshotStore, RocksSnapshotStore, RoomSnapshot, SnapshotMetadata, SnapshotStore,
    StoreConfig, StoreError,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{CanvasClient, ConnectionState, RoomReplica};
