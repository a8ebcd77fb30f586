//! Per-room fan-out of pre-encoded frames.
//!
//! Uses one tokio broadcast channel per room. Every connection attached to
//! the room holds a receiver and filters frames by their [`Recipients`]
//! tag, so one send reaches the whole room, the room minus the sender, or a
//! single member, without the room tracking sockets itself.
//!
//! ```text
//! RoomSession ──send(Recipients, ServerEvent)──► broadcast::Sender
//!                                                   │   │   │
//!                                         ┌─────────┘   │   └─────────┐
//!                                         ▼             ▼             ▼
//!                                    conn A rx     conn B rx     conn C rx
//!                                  (delivers?)   (delivers?)   (delivers?)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::operation::ConnectionId;
use crate::protocol::{ProtocolError, ServerEvent};

/// Who inside a room should receive a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    Room,
    RoomExcept(ConnectionId),
    Connection(ConnectionId),
}

impl Recipients {
    pub fn includes(&self, conn: &ConnectionId) -> bool {
        match self {
            Recipients::Room => true,
            Recipients::RoomExcept(excluded) => excluded != conn,
            Recipients::Connection(target) => target == conn,
        }
    }
}

/// An encoded frame plus its addressing.
#[derive(Debug)]
pub struct Envelope {
    pub recipients: Recipients,
    pub frame: Arc<str>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub receivers: usize,
}

struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a receiver may fall behind before it
    /// starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats {
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    /// Encode `event` once and enqueue it for every receiver.
    ///
    /// Returns the number of receivers the frame was enqueued for (before
    /// recipient filtering).
    pub fn send(&self, recipients: Recipients, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = event.encode()?.into();
        Ok(self.send_raw(Envelope { recipients, frame }))
    }

    /// Enqueue an already-encoded frame.
    pub fn send_raw(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(Arc::new(envelope)).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            receivers: self.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;
    use uuid::Uuid;

    #[test]
    fn test_recipients_filtering() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(Recipients::Room.includes(&a));
        assert!(!Recipients::RoomExcept(a).includes(&a));
        assert!(Recipients::RoomExcept(a).includes(&b));
        assert!(Recipients::Connection(a).includes(&a));
        assert!(!Recipients::Connection(a).includes(&b));
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();

        let count = group
            .send(Recipients::Room, &ServerEvent::OperationRemoved { id: 3 })
            .unwrap();
        assert_eq!(count, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.frame, e2.frame);
        assert_eq!(
            ServerEvent::decode(&e1.frame).unwrap(),
            ServerEvent::OperationRemoved { id: 3 }
        );
    }

    #[test]
    fn test_send_without_receivers() {
        let group = BroadcastGroup::new(4);
        let count = group
            .send(Recipients::Room, &ServerEvent::OperationRemoved { id: 1 })
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(group.stats().frames_sent, 1);
    }

    #[test]
    fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for id in 0..5 {
            group
                .send(Recipients::Room, &ServerEvent::OperationRemoved { id })
                .unwrap();
        }

        match rx.try_recv() {
            Err(TryRecvError::Lagged(skipped)) => group.record_lag(skipped),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats();
        assert_eq!(stats.frames_sent, 5);
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.receivers, 1);
    }

    #[test]
    fn test_capacity() {
        let group = BroadcastGroup::new(32);
        assert_eq!(group.capacity(), 32);
    }
}
