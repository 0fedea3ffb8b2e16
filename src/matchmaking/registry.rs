//! Registry of all active rooms

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::game::Room;
use crate::util::time::unix_millis;

/// Process-wide table of active rooms
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    next_seq: AtomicU64,
    evictions: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            next_seq: AtomicU64::new(1),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fresh room id, unique for the lifetime of this registry
    pub fn next_room_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("room_{}_{}", unix_millis(), seq)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|r| r.value().clone())
    }

    pub fn insert(&self, room: Arc<Room>) {
        self.rooms.insert(room.id().to_string(), room);
    }

    /// Remove a room. Removing twice is harmless; only a real removal counts
    /// as an eviction.
    pub fn remove(&self, id: &str) -> Option<Arc<Room>> {
        let removed = self.rooms.remove(id).map(|(_, room)| room);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn total_players(&self) -> usize {
        self.rooms.iter().map(|r| r.value().player_count()).sum()
    }

    /// Snapshot of the registered rooms, in registry iteration order
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| r.value().clone()).collect()
    }

    /// Room currently holding this user, if any
    pub fn find_player(&self, user_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .iter()
            .find(|r| r.value().has_player(user_id))
            .map(|r| r.value().clone())
    }

    /// Rooms removed since startup
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
