//! In-process snapshot store.
//!
//! Keeps encoded snapshot bytes so the codec path is the same as the
//! durable store's. Contents vanish with the process.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{RoomSnapshot, SnapshotStore, StoreError};

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    rooms: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, room_id: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        let bytes = snapshot.encode()?;
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room_id.to_string(), bytes);
        Ok(())
    }

    fn load(&self, room_id: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms
            .get(room_id)
            .map(|bytes| RoomSnapshot::decode(bytes))
            .transpose()
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = rooms.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_overwrites() {
        let store = MemorySnapshotStore::new();
        store.save("r1", &RoomSnapshot { operations: Vec::new(), next_id: 1 }).unwrap();
        store.save("r1", &RoomSnapshot { operations: Vec::new(), next_id: 5 }).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.load("r1").unwrap().unwrap().next_id, 5);
    }

    #[test]
    fn test_load_missing_room() {
        let store = MemorySnapshotStore::new();
        assert!(store.load("nowhere").unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_list_rooms_sorted() {
        let store = MemorySnapshotStore::new();
        let empty = RoomSnapshot { operations: Vec::new(), next_id: 1 };
        store.save("b", &empty).unwrap();
        store.save("a", &empty).unwrap();
        assert_eq!(store.list_rooms().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
