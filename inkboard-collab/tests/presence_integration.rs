//! Integration tests for presence liveness and sweeper eviction.
//!
//! These tests run a server with a short liveness window and verify that a
//! connection which stops sending presence-bearing messages is evicted
//! exactly once, while an active one is kept.

use inkboard_collab::client::CanvasClient;
use inkboard_collab::operation::ConnectionId;
use inkboard_collab::presence::Point;
use inkboard_collab::protocol::{JoinRequest, PresenceUpdate, ServerEvent};
use inkboard_collab::server::{ServerConfig, SyncServer};
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration, Instant};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Server with a 300ms liveness window swept every 50ms.
async fn start_test_server() -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        presence_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn join(url: &str, room: &str, name: &str) -> (CanvasClient, Receiver<ServerEvent>, ConnectionId) {
    let mut client = CanvasClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    let id = client.connect().await.unwrap();
    client
        .join_room(JoinRequest::room(room).with_identity(name, "#aa5500"))
        .await
        .unwrap();
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if event.name() == "init" {
                return;
            }
        }
    })
    .await
    .unwrap();
    (client, events, id)
}

async fn heartbeat(client: &CanvasClient) {
    client.send_presence(PresenceUpdate::default()).await.unwrap();
}

#[tokio::test]
async fn test_silent_connection_evicted_exactly_once() {
    let url = start_test_server().await;
    let (_silent, _silent_events, silent_id) = join(&url, "r1", "Quiet").await;
    let (active, mut events, active_id) = join(&url, "r1", "Busy").await;

    // Keep `active` alive for well past the window while `silent` says nothing.
    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(900);
    while Instant::now() < deadline {
        heartbeat(&active).await;
        let tick = Instant::now() + Duration::from_millis(60);
        while let Ok(Some(event)) = tokio::time::timeout_at(tick, events.recv()).await {
            received.push(event);
        }
    }

    let departures: Vec<&ServerEvent> =
        received.iter().filter(|e| e.name() == "user-left").collect();
    assert_eq!(
        departures,
        vec![&ServerEvent::UserLeft { connection_id: silent_id, display_name: Some("Quiet".into()) }]
    );

    // The table sent right after the departure no longer lists the silent peer
    let position = received.iter().position(|e| e.name() == "user-left").unwrap();
    let ServerEvent::Users { presence_table } = &received[position + 1] else {
        panic!("expected users after user-left, got {:?}", received[position + 1]);
    };
    assert!(!presence_table.contains_key(&silent_id));
    assert!(presence_table.contains_key(&active_id));

    // And the active peer was never evicted
    assert!(received.iter().all(|e| !matches!(
        e,
        ServerEvent::UserLeft { connection_id, .. } if *connection_id == active_id
    )));
}

#[tokio::test]
async fn test_cursor_counts_as_liveness() {
    let url = start_test_server().await;
    let (mover, _mover_events, mover_id) = join(&url, "r1", "Mover").await;
    let (watcher, mut events, _) = join(&url, "r1", "Watcher").await;

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(700);
    let mut x = 0.0;
    while Instant::now() < deadline {
        x += 1.0;
        mover.send_cursor(Point::new(x, 0.0)).await.unwrap();
        heartbeat(&watcher).await;
        let tick = Instant::now() + Duration::from_millis(60);
        while let Ok(Some(event)) = tokio::time::timeout_at(tick, events.recv()).await {
            received.push(event);
        }
    }

    assert!(received.iter().any(|e| e.name() == "cursor"));
    assert!(received.iter().all(|e| !matches!(
        e,
        ServerEvent::UserLeft { connection_id, .. } if *connection_id == mover_id
    )));
}

#[tokio::test]
async fn test_evicted_connection_can_keep_drawing() {
    let url = start_test_server().await;
    let (silent, _silent_events, silent_id) = join(&url, "r1", "Quiet").await;
    let (active, mut events, _) = join(&url, "r1", "Busy").await;

    // Wait for the eviction
    timeout(Duration::from_secs(3), async {
        loop {
            heartbeat(&active).await;
            if let Ok(Some(ServerEvent::UserLeft { connection_id, .. })) =
                timeout(Duration::from_millis(60), events.recv()).await
            {
                if connection_id == silent_id {
                    return;
                }
            }
        }
    })
    .await
    .unwrap();

    // Still attached to the room: cursor traffic reappears
    silent.send_cursor(Point::new(9.0, 9.0)).await.unwrap();
    let cursor = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(ServerEvent::Cursor { connection_id, cursor, .. }) = events.recv().await {
                if connection_id == silent_id {
                    return cursor;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(cursor, Point::new(9.0, 9.0));
}
