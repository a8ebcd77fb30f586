//! Room registry: the only shared map between rooms.
//!
//! Lookups take the read lock. Creation loads the snapshot with no lock held,
//! then takes the write lock and re-checks, so concurrent first joins to the
//! same room all end up with the one session that was inserted.
//! Sessions are never removed while the process runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use crate::broadcast::Envelope;
use crate::operation::ConnectionId;
use crate::protocol::JoinRequest;
use crate::room::{RoomId, RoomSession, DEFAULT_ROOM};
use crate::storage::{SnapshotStore, StoreError};

/// A connection's membership in one room.
pub struct Attachment {
    pub session: Arc<RoomSession>,
    /// Every frame the room emits; filter with `Recipients::includes`.
    pub events: broadcast::Receiver<Arc<Envelope>>,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<RoomSession>>>,
    store: Option<Arc<dyn SnapshotStore>>,
    broadcast_capacity: usize,
    default_room: RoomId,
}

impl RoomRegistry {
    pub fn new(
        store: Option<Arc<dyn SnapshotStore>>,
        broadcast_capacity: usize,
        default_room: impl Into<RoomId>,
    ) -> Self {
        let default_room = default_room.into();
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            broadcast_capacity,
            default_room: if default_room.is_empty() {
                DEFAULT_ROOM.to_string()
            } else {
                default_room
            },
        }
    }

    /// Registry without persistence.
    pub fn in_memory(broadcast_capacity: usize) -> Self {
        Self::new(None, broadcast_capacity, DEFAULT_ROOM)
    }

    /// Map an absent or empty room id to the default room.
    pub fn resolve<'a>(&'a self, room_id: Option<&'a str>) -> &'a str {
        match room_id {
            Some(id) if !id.is_empty() => id,
            _ => &self.default_room,
        }
    }

    /// Get or create the session for `room_id`.
    ///
    /// A new session is hydrated from the store when a snapshot exists.
    pub async fn get(&self, room_id: Option<&str>) -> Arc<RoomSession> {
        let room_id = self.resolve(room_id);

        // Fast path: room already live
        {
            let rooms = self.rooms.read().await;
            if let Some(session) = rooms.get(room_id) {
                return session.clone();
            }
        }

        // Slow path: load without holding the map, then insert double-checking.
        // A session loaded by a losing racer is untouched and simply dropped.
        let loaded = Arc::new(self.load_session(room_id));
        let mut rooms = self.rooms.write().await;
        if let Some(session) = rooms.get(room_id) {
            return session.clone();
        }
        let session = loaded;
        rooms.insert(room_id.to_string(), session.clone());
        log::info!("Room {room_id} opened ({} live)", rooms.len());
        session
    }

    /// Live session for `room_id`, without creating one.
    pub async fn find(&self, room_id: &str) -> Option<Arc<RoomSession>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Move `conn` into the room named by `request`.
    ///
    /// Subscribes before joining so the joiner's `init` is on its receiver.
    /// Leaving `current` first carries the connection's name and color over
    /// when the request does not supply them.
    pub async fn attach(
        &self,
        conn: ConnectionId,
        request: JoinRequest,
        current: Option<&Arc<RoomSession>>,
    ) -> Attachment {
        let target = self.get(request.room_id.as_deref()).await;

        let carried = match current {
            Some(previous) if !Arc::ptr_eq(previous, &target) => previous.leave(conn),
            _ => None,
        };

        let events = target.subscribe();
        target.join(conn, request.display_name, request.color, carried);
        Attachment { session: target, events }
    }

    pub async fn sessions(&self) -> Vec<Arc<RoomSession>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Hydrate every room the store knows about.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let room_ids = store.list_rooms()?;
        for room_id in &room_ids {
            self.get(Some(room_id)).await;
        }

        log::info!("Recovery complete: {} rooms restored", room_ids.len());
        Ok(room_ids.len())
    }

    /// Save every dirty room. Returns how many snapshots were written.
    pub async fn persist_all(&self) -> usize {
        let sessions = self.sessions().await;
        sessions.iter().filter(|session| session.persist()).count()
    }

    /// Evict idle presence in every room. Returns the total evicted.
    pub async fn sweep_idle(&self, now_ms: u64, window: Duration) -> usize {
        let sessions = self.sessions().await;
        sessions
            .iter()
            .map(|session| session.evict_idle(now_ms, window).len())
            .sum()
    }

    pub fn default_room(&self) -> &str {
        &self.default_room
    }

    pub fn store(&self) -> Option<&Arc<dyn SnapshotStore>> {
        self.store.as_ref()
    }

    fn load_session(&self, room_id: &str) -> RoomSession {
        let store = self.store.clone();
        let snapshot = match &store {
            Some(s) => match s.load(room_id) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::error!("Failed to load snapshot for room {room_id}, starting empty: {e}");
                    None
                }
            },
            None => None,
        };

        match snapshot {
            Some(snapshot) => {
                log::info!(
                    "Hydrated room {room_id}: {} operations, next id {}",
                    snapshot.operations.len(),
                    snapshot.next_id
                );
                RoomSession::with_log(room_id, snapshot.into_log(), self.broadcast_capacity, store)
            }
            None => RoomSession::new(room_id, self.broadcast_capacity, store),
        }
    }
}
