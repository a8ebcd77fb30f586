//! WebSocket client for the drawing server, plus a local mirror of a room.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - One method per inbound intent (join, stroke, cursor, presence, undo, redo, ping)
//! - A channel of decoded [`ServerEvent`]s
//! - [`RoomReplica`], which folds that event stream into operations and peers

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::operation::{ConnectionId, Operation, OperationId};
use crate::presence::{Point, PresenceEntry, PresenceSnapshot};
use crate::protocol::{
    ClientEvent, HistoryScope, JoinRequest, PresenceUpdate, ProtocolError, ServerEvent,
    StrokeFragment,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A drawing client.
///
/// Frames are written by a background task fed through a channel, so the
/// send methods only need `&self`.
pub struct CanvasClient {
    server_url: String,

    /// Identity assigned by the server on connect
    connection_id: Option<ConnectionId>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ServerEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ServerEvent>,
}

impl CanvasClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            connection_id: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Connect and wait for the server to assign an identity.
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect(&mut self) -> Result<ConnectionId, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // The first frame names this connection
        let connection_id = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Text(text))) => match ServerEvent::decode(text.as_str()) {
                    Ok(ServerEvent::Connected { connection_id }) => break connection_id,
                    Ok(other) => {
                        log::debug!("Skipping {} before handshake", other.name());
                    }
                    Err(e) => {
                        *self.state.write().await = ConnectionState::Disconnected;
                        return Err(e);
                    }
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    *self.state.write().await = ConnectionState::Disconnected;
                    return Err(ProtocolError::ConnectionFailed(e.to_string()));
                }
                None => {
                    *self.state.write().await = ConnectionState::Disconnected;
                    return Err(ProtocolError::ConnectionClosed);
                }
            }
        };
        self.connection_id = Some(connection_id);

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::text(frame)).await.is_err() {
                    return;
                }
            }
            // Sender dropped: close politely
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: decode frames and hand them to the application
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
        });

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {} as {connection_id}", self.server_url);
        Ok(connection_id)
    }

    /// Send any intent.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let frame = event.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx.send(frame).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn join_room(&self, request: JoinRequest) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::JoinRoom(request)).await
    }

    /// Send a stroke; `is_final` commits it, otherwise it is a live preview.
    pub async fn send_stroke(
        &self,
        mut body: Map<String, Value>,
        is_final: bool,
    ) -> Result<(), ProtocolError> {
        body.insert("final".to_string(), Value::Bool(is_final));
        self.send(&ClientEvent::Stroke(StrokeFragment::new(body))).await
    }

    pub async fn send_cursor(&self, cursor: Point) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Cursor(cursor)).await
    }

    pub async fn send_presence(&self, update: PresenceUpdate) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Presence(update)).await
    }

    pub async fn undo(&self, scope: HistoryScope) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Undo(scope)).await
    }

    pub async fn redo(&self, scope: HistoryScope) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Redo(scope)).await
    }

    /// The server echoes `timestamp` back in a `pong`.
    pub async fn ping(&self, timestamp: Value) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Ping(timestamp)).await
    }

    /// Close the connection. Queued frames are flushed first.
    pub async fn close(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

// ───────────────────────────────────────────────────────────────────
// Room replica
// ───────────────────────────────────────────────────────────────────

/// Client-side mirror of one room, rebuilt from server events.
#[derive(Debug, Clone, Default)]
pub struct RoomReplica {
    operations: Vec<Operation>,
    peers: PresenceSnapshot,
}

impl RoomReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Returns whether the replica changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Init { operations, presence_table } => {
                self.operations = operations.clone();
                self.peers = presence_table.clone();
                true
            }
            ServerEvent::OperationAdded { operation } => {
                // A redo lands on the tail even if a stale copy lingers
                self.operations.retain(|op| op.id != operation.id);
                self.operations.push(operation.clone());
                true
            }
            ServerEvent::OperationRemoved { id } => {
                let before = self.operations.len();
                self.operations.retain(|op| op.id != *id);
                self.operations.len() != before
            }
            ServerEvent::Users { presence_table } => {
                self.peers = presence_table.clone();
                true
            }
            ServerEvent::Cursor { connection_id, cursor, display_name, color } => {
                let peer = self.peers.entry(*connection_id).or_insert_with(|| PresenceEntry {
                    color: color.clone(),
                    display_name: display_name.clone(),
                    cursor: None,
                    last_seen_at: 0,
                });
                peer.cursor = Some(*cursor);
                peer.display_name = display_name.clone();
                peer.color = color.clone();
                true
            }
            ServerEvent::UserJoined { connection_id, display_name, color } => {
                if self.peers.contains_key(connection_id) {
                    return false;
                }
                self.peers.insert(
                    *connection_id,
                    PresenceEntry {
                        color: color.clone(),
                        display_name: display_name.clone(),
                        cursor: None,
                        last_seen_at: 0,
                    },
                );
                true
            }
            ServerEvent::UserLeft { connection_id, .. } => {
                self.peers.remove(connection_id).is_some()
            }
            ServerEvent::Connected { .. } | ServerEvent::Stroke(_) | ServerEvent::Pong { .. } => {
                false
            }
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operation_ids(&self) -> Vec<OperationId> {
        self.operations.iter().map(|op| op.id).collect()
    }

    pub fn peers(&self) -> &PresenceSnapshot {
        &self.peers
    }

    pub fn peer(&self, conn: &ConnectionId) -> Option<&PresenceEntry> {
        self.peers.get(conn)
    }
}
