//! Background loops: presence sweeper and snapshot autosave.
//!
//! Both run on their own tokio interval, independent of message handling,
//! and reach room state only through each session's exclusive section.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::presence::now_millis;
use crate::registry::RoomRegistry;

/// Run one sweep over every room. Returns the number of evicted entries.
pub async fn sweep_once(registry: &RoomRegistry, window: Duration) -> usize {
    let evicted = registry.sweep_idle(now_millis(), window).await;
    if evicted > 0 {
        log::info!("Presence sweep evicted {evicted} idle connections");
    }
    evicted
}

/// Evict presence entries silent for longer than `window`, every `interval`.
pub fn spawn_presence_sweeper(
    registry: Arc<RoomRegistry>,
    interval: Duration,
    window: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_once(&registry, window).await;
        }
    })
}

/// Persist dirty rooms every `interval`.
pub fn spawn_autosave(registry: Arc<RoomRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let saved = registry.persist_all().await;
            if saved > 0 {
                log::debug!("Autosave wrote {saved} room snapshots");
            }
        }
    })
}
