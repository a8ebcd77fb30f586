//! Room session: one operation log, one presence table, one broadcast group.
//!
//! ```text
//!   inbound intent ──► RoomSession::apply_*  ─┐
//!                                             │ lock(state)
//!                                             ├─ mutate OperationLog / PresenceTable
//!                                             ├─ enqueue ServerEvent(s) on BroadcastGroup
//!                                             │ unlock
//!                                             └─ save snapshot (committed mutations only)
//! ```
//!
//! The state mutex is the room's exclusive section. It is held for exactly
//! one intent's effect and never across an `.await`, so every member sees
//! events in the order the log was mutated. Snapshot writes happen after the
//! section is released, one at a time under a separate save mutex, and each
//! takes its snapshot inside that mutex so the last write is the newest log.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Envelope, Recipients};
use crate::operation::{ConnectionId, Operation, OperationId};
use crate::oplog::OperationLog;
use crate::presence::{now_millis, Point, PresenceEntry, PresenceSnapshot, PresenceTable};
use crate::protocol::{HistoryScope, PresenceUpdate, ServerEvent, StrokeFragment};
use crate::storage::{RoomSnapshot, SnapshotStore};

/// Opaque room identifier.
pub type RoomId = String;

/// Room used when a join names none.
pub const DEFAULT_ROOM: &str = "main";

struct RoomState {
    log: OperationLog,
    presence: PresenceTable,
    /// Bumped on every committed mutation.
    revision: u64,
    /// Last revision known to be in the store.
    persisted_revision: u64,
}

impl RoomState {
    fn with_log(log: OperationLog) -> Self {
        Self {
            log,
            presence: PresenceTable::new(),
            revision: 0,
            persisted_revision: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.revision != self.persisted_revision
    }
}

/// The unit of isolation between rooms.
pub struct RoomSession {
    room_id: RoomId,
    state: Mutex<RoomState>,
    /// Serializes snapshot-then-save. Never taken while `state` is held.
    save: Mutex<()>,
    broadcast: BroadcastGroup,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl RoomSession {
    /// Empty room.
    pub fn new(
        room_id: impl Into<RoomId>,
        broadcast_capacity: usize,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        Self::with_log(room_id, OperationLog::new(), broadcast_capacity, store)
    }

    /// Room starting from an existing (typically hydrated) log.
    pub fn with_log(
        room_id: impl Into<RoomId>,
        log: OperationLog,
        broadcast_capacity: usize,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            state: Mutex::new(RoomState::with_log(log)),
            save: Mutex::new(()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            store,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Receiver for every frame this room emits from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.broadcast.subscribe()
    }

    // ─── Drawing ──────────────────────────────────────────────────────

    /// Relay a live fragment, or commit a final one.
    ///
    /// Returns the stored operation when the fragment was committed.
    pub fn apply_stroke_fragment(
        &self,
        conn: ConnectionId,
        fragment: StrokeFragment,
    ) -> Option<Operation> {
        if !fragment.is_final() {
            self.publish(Recipients::RoomExcept(conn), &ServerEvent::Stroke(fragment.into_body()));
            return None;
        }

        let operation = {
            let mut state = self.lock();
            let operation = state.log.commit(fragment.to_draft(), Some(conn));
            state.revision += 1;
            self.publish(
                Recipients::Room,
                &ServerEvent::OperationAdded { operation: operation.clone() },
            );
            operation
        };

        log::debug!(
            "Room {}: committed {} #{} by {conn}",
            self.room_id,
            operation.kind.as_str(),
            operation.id
        );
        self.persist();
        Some(operation)
    }

    /// Undo the caller's (or the room's) latest operation.
    pub fn apply_undo(&self, conn: ConnectionId, scope: HistoryScope) -> Option<OperationId> {
        let removed = {
            let mut state = self.lock();
            let removed = match scope {
                HistoryScope::Own => state.log.undo_last_by(&conn),
                HistoryScope::Global => state.log.undo_last(),
            };
            if let Some(operation) = &removed {
                state.revision += 1;
                self.publish(Recipients::Room, &ServerEvent::OperationRemoved { id: operation.id });
            }
            removed
        };

        match removed {
            Some(operation) => {
                self.persist();
                Some(operation.id)
            }
            None => {
                log::debug!("Room {}: nothing to undo for {conn} ({scope:?})", self.room_id);
                None
            }
        }
    }

    /// Redo onto the tail of the log; the operation keeps its id.
    pub fn apply_redo(&self, conn: ConnectionId, scope: HistoryScope) -> Option<Operation> {
        let restored = {
            let mut state = self.lock();
            let restored = match scope {
                HistoryScope::Own => state.log.redo_last_by(&conn),
                HistoryScope::Global => state.log.redo_last(),
            };
            if let Some(operation) = &restored {
                state.revision += 1;
                self.publish(
                    Recipients::Room,
                    &ServerEvent::OperationAdded { operation: operation.clone() },
                );
            }
            restored
        };

        if restored.is_some() {
            self.persist();
        } else {
            log::debug!("Room {}: nothing to redo for {conn} ({scope:?})", self.room_id);
        }
        restored
    }

    // ─── Presence ─────────────────────────────────────────────────────

    pub fn apply_cursor(&self, conn: ConnectionId, cursor: Point) {
        let mut state = self.lock();
        let entry = state.presence.move_cursor(conn, cursor, now_millis());
        log::trace!("Room {}: cursor {conn} at ({}, {})", self.room_id, cursor.x, cursor.y);
        self.publish(
            Recipients::RoomExcept(conn),
            &ServerEvent::Cursor {
                connection_id: conn,
                cursor,
                display_name: entry.display_name,
                color: entry.color,
            },
        );
    }

    pub fn apply_presence_heartbeat(&self, conn: ConnectionId, update: PresenceUpdate) {
        let mut state = self.lock();
        state
            .presence
            .heartbeat(conn, update.display_name, update.color, now_millis());
        let presence_table = state.presence.snapshot();
        self.publish(Recipients::Room, &ServerEvent::Users { presence_table });
    }

    /// Attach `conn` to this room.
    ///
    /// `carried` is the entry the connection had in the room it just left.
    /// The joiner gets `init`; everyone else gets `user-joined`; the whole
    /// room gets the refreshed table.
    pub fn join(
        &self,
        conn: ConnectionId,
        display_name: Option<String>,
        color: Option<String>,
        carried: Option<PresenceEntry>,
    ) -> PresenceEntry {
        let mut state = self.lock();
        let entry = state
            .presence
            .attach(conn, display_name, color, carried, now_millis());

        self.publish(
            Recipients::Connection(conn),
            &ServerEvent::Init {
                operations: state.log.snapshot(),
                presence_table: state.presence.snapshot(),
            },
        );
        self.publish(
            Recipients::RoomExcept(conn),
            &ServerEvent::UserJoined {
                connection_id: conn,
                display_name: entry.display_name.clone(),
                color: entry.color.clone(),
            },
        );
        self.publish(
            Recipients::Room,
            &ServerEvent::Users { presence_table: state.presence.snapshot() },
        );

        log::info!("{} ({conn}) joined room {}", entry.display_name, self.room_id);
        entry
    }

    /// Detach `conn`. No-op if it has no entry here.
    pub fn leave(&self, conn: ConnectionId) -> Option<PresenceEntry> {
        let mut state = self.lock();
        let entry = state.presence.remove(&conn)?;

        self.publish(
            Recipients::Room,
            &ServerEvent::UserLeft {
                connection_id: conn,
                display_name: Some(entry.display_name.clone()),
            },
        );
        self.publish(
            Recipients::Room,
            &ServerEvent::Users { presence_table: state.presence.snapshot() },
        );

        log::info!("{} ({conn}) left room {}", entry.display_name, self.room_id);
        Some(entry)
    }

    /// Evict entries silent for longer than `window`, as if each had left.
    ///
    /// One `user-left` per evicted connection, then a single `users`.
    pub fn evict_idle(&self, now_ms: u64, window: Duration) -> Vec<ConnectionId> {
        let mut state = self.lock();
        let evicted = state.presence.evict_idle(now_ms, window);
        if evicted.is_empty() {
            return Vec::new();
        }

        for (conn, entry) in &evicted {
            log::info!(
                "Room {}: evicting {} ({conn}) after {}ms of silence",
                self.room_id,
                entry.display_name,
                now_ms.saturating_sub(entry.last_seen_at)
            );
            self.publish(
                Recipients::Room,
                &ServerEvent::UserLeft {
                    connection_id: *conn,
                    display_name: Some(entry.display_name.clone()),
                },
            );
        }
        self.publish(
            Recipients::Room,
            &ServerEvent::Users { presence_table: state.presence.snapshot() },
        );

        evicted.into_iter().map(|(conn, _)| conn).collect()
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Save the committed log if it changed since the last successful save.
    ///
    /// Returns whether a snapshot was written. Failures are logged; the
    /// room stays dirty and is retried on the next call.
    pub fn persist(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        let _saving = self.save.lock().unwrap_or_else(PoisonError::into_inner);
        let (snapshot, revision) = {
            let state = self.lock();
            if state.revision <= state.persisted_revision {
                return false;
            }
            (RoomSnapshot::of(&state.log), state.revision)
        };

        match store.save(&self.room_id, &snapshot) {
            Ok(()) => {
                let mut state = self.lock();
                state.persisted_revision = state.persisted_revision.max(revision);
                true
            }
            Err(e) => {
                log::error!("Failed to persist snapshot for room {}: {e}", self.room_id);
                false
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().is_dirty()
    }

    // ─── Queries ──────────────────────────────────────────────────────

    /// Copy of the committed log.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().log.snapshot()
    }

    pub fn presence(&self) -> PresenceSnapshot {
        self.lock().presence.snapshot()
    }

    pub fn member_count(&self) -> usize {
        self.lock().presence.len()
    }

    pub fn contains(&self, conn: &ConnectionId) -> bool {
        self.lock().presence.contains(conn)
    }

    pub fn next_operation_id(&self) -> OperationId {
        self.lock().log.next_id()
    }

    pub fn redo_len(&self) -> usize {
        self.lock().log.redo_len()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    /// Account for frames a member's receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.broadcast.record_lag(skipped);
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, recipients: Recipients, event: &ServerEvent) {
        if let Err(e) = self.broadcast.send(recipients, event) {
            log::error!("Room {}: failed to encode {}: {e}", self.room_id, event.name());
        }
    }
}
