//! Per-room presence: who is here, what they are called, where their cursor is.
//!
//! ```text
//! join / presence / cursor          sweeper tick
//!        │                               │
//!        ▼                               ▼
//! PresenceTable::attach / heartbeat   PresenceTable::evict_idle(now, window)
//!        │  (refreshes lastSeenAt)       │  (removes silent entries)
//!        ▼                               ▼
//!   PresenceSnapshot ──────► `users` broadcast to the room
//! ```
//!
//! Timestamps are wall-clock milliseconds since the Unix epoch so the table
//! can be shipped to clients as-is.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

use crate::operation::ConnectionId;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One connection's presence metadata within a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub color: String,
    pub display_name: String,
    #[serde(default)]
    pub cursor: Option<Point>,
    /// Milliseconds since the Unix epoch of the last presence-bearing message.
    pub last_seen_at: u64,
}

impl PresenceEntry {
    /// Entry with generated name and color for `conn`.
    pub fn with_defaults(conn: &ConnectionId, now_ms: u64) -> Self {
        Self {
            color: default_color(conn),
            display_name: default_display_name(conn),
            cursor: None,
            last_seen_at: now_ms,
        }
    }

    /// Whether the entry has been silent for longer than `window` at `now_ms`.
    pub fn is_idle(&self, now_ms: u64, window: Duration) -> bool {
        now_ms.saturating_sub(self.last_seen_at) > window.as_millis() as u64
    }
}

/// Ordered copy of a presence table, as sent on the wire.
pub type PresenceSnapshot = BTreeMap<ConnectionId, PresenceEntry>;

/// Presence entries of one room, keyed by connection.
#[derive(Debug, Default)]
pub struct PresenceTable {
    entries: HashMap<ConnectionId, PresenceEntry>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh the entry for a joining connection.
    ///
    /// Name resolution: supplied name, else the name already known in this
    /// room, else the carried-over entry's name, else a generated one.
    /// Color follows the same order.
    pub fn attach(
        &mut self,
        conn: ConnectionId,
        display_name: Option<String>,
        color: Option<String>,
        carried: Option<PresenceEntry>,
        now_ms: u64,
    ) -> PresenceEntry {
        let known = self.entries.remove(&conn).or(carried);
        let mut entry = known.unwrap_or_else(|| PresenceEntry::with_defaults(&conn, now_ms));
        if let Some(name) = non_empty(display_name) {
            entry.display_name = name;
        }
        if let Some(color) = non_empty(color) {
            entry.color = color;
        }
        entry.last_seen_at = now_ms;
        self.entries.insert(conn, entry.clone());
        entry
    }

    /// Merge heartbeat metadata. Absent fields leave the entry untouched.
    pub fn heartbeat(
        &mut self,
        conn: ConnectionId,
        display_name: Option<String>,
        color: Option<String>,
        now_ms: u64,
    ) -> PresenceEntry {
        let entry = self
            .entries
            .entry(conn)
            .or_insert_with(|| PresenceEntry::with_defaults(&conn, now_ms));
        if let Some(name) = non_empty(display_name) {
            entry.display_name = name;
        }
        if let Some(color) = non_empty(color) {
            entry.color = color;
        }
        entry.last_seen_at = now_ms;
        entry.clone()
    }

    /// Record a cursor position, recreating the entry if it was swept.
    pub fn move_cursor(&mut self, conn: ConnectionId, cursor: Point, now_ms: u64) -> PresenceEntry {
        let entry = self
            .entries
            .entry(conn)
            .or_insert_with(|| PresenceEntry::with_defaults(&conn, now_ms));
        entry.cursor = Some(cursor);
        entry.last_seen_at = now_ms;
        entry.clone()
    }

    pub fn remove(&mut self, conn: &ConnectionId) -> Option<PresenceEntry> {
        self.entries.remove(conn)
    }

    /// Remove every entry silent for longer than `window`.
    pub fn evict_idle(&mut self, now_ms: u64, window: Duration) -> Vec<(ConnectionId, PresenceEntry)> {
        let idle: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_idle(now_ms, window))
            .map(|(id, _)| *id)
            .collect();

        idle.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    pub fn get(&self, conn: &ConnectionId) -> Option<&PresenceEntry> {
        self.entries.get(conn)
    }

    pub fn contains(&self, conn: &ConnectionId) -> bool {
        self.entries.contains_key(conn)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.entries
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ───────────────────────────────────────────────────────────────────
// Defaults
// ───────────────────────────────────────────────────────────────────

/// Short name from the tail of the connection id.
pub fn default_display_name(conn: &ConnectionId) -> String {
    let simple = conn.simple().to_string();
    simple[simple.len() - 4..].to_string()
}

/// Stable, saturated `#rrggbb` color derived from the connection id.
pub fn default_color(conn: &ConnectionId) -> String {
    let hash = conn.as_u128();
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
