//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── RoomSession "main" ── BroadcastGroup ──► A, B
//!             ├── handle_connection ─┤        │
//! Client B ──┘    (one task each)    │        └── SnapshotStore (RocksDB)
//!                                    │
//! Client C ──── handle_connection ───┴── RoomSession "sketch" ── BroadcastGroup ──► C
//!
//!                 presence sweeper ──► every room (evict idle)
//!                 autosave         ──► every room (persist dirty)
//! ```
//!
//! Each connection task owns its socket. It decodes inbound frames into
//! [`ClientEvent`]s, applies them to its current room, and forwards the
//! room's broadcast frames addressed to it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::maintenance::{spawn_autosave, spawn_presence_sweeper};
use crate::operation::ConnectionId;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::{Attachment, RoomRegistry};
use crate::room::DEFAULT_ROOM;
use crate::storage::{RocksSnapshotStore, SnapshotStore, StoreConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Snapshot storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Room joined when a request names none
    pub default_room: String,
    /// Silence after which a presence entry is evicted
    pub presence_timeout: Duration,
    /// How often the presence sweeper runs
    pub sweep_interval: Duration,
    /// How often dirty rooms are saved
    pub autosave_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            default_room: DEFAULT_ROOM.to_string(),
            presence_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            autosave_interval: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `INKBOARD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ServerConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(bind) = lookup("INKBOARD_BIND") {
            config.bind_addr = bind;
        } else if let Some(port) = parse_var::<u16>(&lookup, "PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(dir) = lookup("INKBOARD_DATA_DIR").filter(|d| !d.is_empty()) {
            config.storage_path = Some(PathBuf::from(dir));
        }
        if let Some(room) = lookup("INKBOARD_DEFAULT_ROOM").filter(|r| !r.is_empty()) {
            config.default_room = room;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "INKBOARD_PRESENCE_TIMEOUT_SECS") {
            config.presence_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "INKBOARD_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "INKBOARD_AUTOSAVE_INTERVAL_SECS") {
            config.autosave_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "INKBOARD_BROADCAST_CAPACITY") {
            config.broadcast_capacity = capacity.max(1);
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames dropped as undecodable or malformed
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening the snapshot store if one is configured.
    ///
    /// A store that fails to open is logged and the server runs in memory.
    pub fn new(config: ServerConfig) -> Self {
        let store: Option<Arc<dyn SnapshotStore>> = match &config.storage_path {
            Some(path) => match RocksSnapshotStore::open(StoreConfig::at(path.clone())) {
                Ok(store) => {
                    log::info!("Snapshot store opened at {}", path.display());
                    Some(Arc::new(store))
                }
                Err(e) => {
                    log::error!(
                        "Failed to open snapshot store at {}, running in memory: {e}",
                        path.display()
                    );
                    None
                }
            },
            None => None,
        };
        Self::with_store(config, store)
    }

    /// Create a server over an already-open store.
    pub fn with_store(config: ServerConfig, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        let registry = Arc::new(RoomRegistry::new(
            store,
            config.broadcast_capacity,
            config.default_room.clone(),
        ));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// Recovers stored rooms, starts the background loops, then accepts
    /// connections until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        match self.registry.recover().await {
            Ok(0) => {}
            Ok(recovered) => log::info!("Recovered {recovered} rooms from persistent storage"),
            Err(e) => log::error!("Room recovery failed, continuing with empty registry: {e}"),
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        let sweeper = spawn_presence_sweeper(
            self.registry.clone(),
            self.config.sweep_interval,
            self.config.presence_timeout,
        );
        let autosave = self
            .registry
            .store()
            .map(|_| spawn_autosave(self.registry.clone(), self.config.autosave_interval));

        let result = self.accept_loop(listener).await;

        sweeper.abort();
        if let Some(autosave) = autosave {
            autosave.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let connection_id: ConnectionId = Uuid::new_v4();

        log::info!("WebSocket connection {connection_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut attachment: Option<Attachment> = None;
        let result =
            Self::serve(ws_stream, addr, connection_id, &registry, &stats, &mut attachment).await;

        // Cleanup: leave the current room
        if let Some(attachment) = attachment.take() {
            attachment.session.leave(connection_id);
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {connection_id} from {addr} closed");

        result
    }

    async fn serve(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        connection_id: ConnectionId,
        registry: &RoomRegistry,
        stats: &RwLock<ServerStats>,
        attachment: &mut Option<Attachment>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        send_event(&mut ws_sender, &ServerEvent::Connected { connection_id }).await?;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }

                            match ClientEvent::decode(text.as_str()) {
                                Ok(event) => {
                                    let reply =
                                        Self::dispatch(connection_id, event, registry, attachment).await;
                                    if let Some(reply) = reply {
                                        send_event(&mut ws_sender, &reply).await?;
                                    }
                                }
                                Err(e) => {
                                    stats.write().await.malformed_messages += 1;
                                    log::warn!("Ignoring frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Binary(data))) => {
                            stats.write().await.malformed_messages += 1;
                            log::debug!("Ignoring {}-byte binary frame from {addr}", data.len());
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Close received from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room frame
                envelope = async {
                    match attachment.as_mut() {
                        Some(a) => a.events.recv().await,
                        // Not in a room yet
                        None => std::future::pending().await,
                    }
                } => {
                    match envelope {
                        Ok(envelope) => {
                            if envelope.recipients.includes(&connection_id) {
                                ws_sender.send(Message::text(envelope.frame.to_string())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            if let Some(a) = attachment.as_ref() {
                                a.session.record_lag(n);
                            }
                            log::warn!("Connection {connection_id} lagged by {n} frames");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Apply one intent. Returns a reply addressed only to the sender.
    async fn dispatch(
        conn: ConnectionId,
        event: ClientEvent,
        registry: &RoomRegistry,
        attachment: &mut Option<Attachment>,
    ) -> Option<ServerEvent> {
        let session = match event {
            ClientEvent::Ping(timestamp) => return Some(ServerEvent::Pong { timestamp }),
            ClientEvent::JoinRoom(request) => {
                let current = attachment.as_ref().map(|a| a.session.clone());
                *attachment = Some(registry.attach(conn, request, current.as_ref()).await);
                return None;
            }
            ref other => match attachment.as_ref() {
                Some(a) => a.session.clone(),
                None => {
                    log::debug!("Ignoring {} from {conn}: not in a room", other.name());
                    return None;
                }
            },
        };

        match event {
            ClientEvent::Stroke(fragment) => {
                session.apply_stroke_fragment(conn, fragment);
            }
            ClientEvent::Cursor(cursor) => session.apply_cursor(conn, cursor),
            ClientEvent::Presence(update) => session.apply_presence_heartbeat(conn, update),
            ClientEvent::Undo(scope) => {
                session.apply_undo(conn, scope);
            }
            ClientEvent::Redo(scope) => {
                session.apply_redo(conn, scope);
            }
            ClientEvent::JoinRoom(_) | ClientEvent::Ping(_) => {}
        }
        None
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Save every room with unsaved changes.
    pub async fn persist_all(&self) -> usize {
        let saved = self.registry.persist_all().await;
        log::info!("Persisted {saved} room snapshots");
        saved
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

async fn send_event(sink: &mut WsSink, event: &ServerEvent) -> Result<(), BoxError> {
    let frame = event.encode()?;
    sink.send(Message::text(frame)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemorySnapshotStore, RoomSnapshot};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.default_room, "main");
        assert_eq!(config.presence_timeout, Duration::from_secs(10));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.autosave_interval, Duration::from_secs(15));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("INKBOARD_BIND", "0.0.0.0:4000"),
            ("INKBOARD_DATA_DIR", "/var/lib/inkboard"),
            ("INKBOARD_DEFAULT_ROOM", "lobby"),
            ("INKBOARD_PRESENCE_TIMEOUT_SECS", "30"),
            ("INKBOARD_BROADCAST_CAPACITY", "1024"),
        ]));
        assert_eq!(config.bind_addr, "0.0.0.0:4000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/inkboard")));
        assert_eq!(config.default_room, "lobby");
        assert_eq!(config.presence_timeout, Duration::from_secs(30));
        assert_eq!(config.broadcast_capacity, 1024);
    }

    #[test]
    fn test_config_port_fallback_and_bad_values() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("INKBOARD_SWEEP_INTERVAL_SECS", "soon"),
        ]));
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:3000");
        assert!(server.registry().store().is_none());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("db"));
        assert!(server.registry().store().is_some());
    }

    #[tokio::test]
    async fn test_unopenable_store_falls_back_to_memory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", file.path().join("db"));
        assert!(server.registry().store().is_none());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.malformed_messages, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_dispatch_ignores_intents_before_join() {
        let registry = RoomRegistry::in_memory(16);
        let mut attachment = None;
        let conn = Uuid::new_v4();

        let reply =
            SyncServer::dispatch(conn, ClientEvent::Undo(Default::default()), &registry, &mut attachment)
                .await;
        assert!(reply.is_none());
        assert!(attachment.is_none());
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_ping_and_join() {
        let registry = RoomRegistry::in_memory(16);
        let mut attachment = None;
        let conn = Uuid::new_v4();

        let reply = SyncServer::dispatch(
            conn,
            ClientEvent::Ping(serde_json::json!(42)),
            &registry,
            &mut attachment,
        )
        .await;
        assert_eq!(reply, Some(ServerEvent::Pong { timestamp: serde_json::json!(42) }));

        let join = ClientEvent::decode(r#"{"event":"join-room","data":""}"#).unwrap();
        SyncServer::dispatch(conn, join, &registry, &mut attachment).await;
        let session = &attachment.as_ref().unwrap().session;
        assert_eq!(session.room_id(), "main");
        assert!(session.contains(&conn));
    }

    #[tokio::test]
    async fn test_persist_all_with_memory_store() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.save("kept", &RoomSnapshot { operations: Vec::new(), next_id: 9 }).unwrap();
        let server = SyncServer::with_store(ServerConfig::default(), Some(store.clone()));

        assert_eq!(server.registry().recover().await.unwrap(), 1);
        assert_eq!(server.persist_all().await, 0);
        assert_eq!(server.stats().await.active_rooms, 1);
    }
}
