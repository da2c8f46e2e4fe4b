//! In-memory per-room cache of replayable updates and awareness states.
//!
//! A `RoomState` is created on the first register for a room and retained
//! across empty periods so that reconnecting clients replay history without
//! a store round-trip. The hub's scheduler is the only writer, but stats
//! readers may observe a room concurrently, so the interior is guarded by
//! a read/write lock.

use std::collections::HashMap;
use std::sync::RwLock;

/// Mutable state for one active room.
#[derive(Debug, Default)]
pub struct RoomState {
    /// Retained sync frames in broadcast order.
    updates: RwLock<Vec<Vec<u8>>>,
    /// Latest awareness frame per session id.
    awareness: RwLock<HashMap<u64, Vec<u8>>>,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sync frame to the replay list.
    pub fn add_update(&self, update: Vec<u8>) {
        let mut updates = self.updates.write().unwrap_or_else(|e| e.into_inner());
        updates.push(update);
    }

    /// Cloned snapshot of the replay list.
    pub fn updates(&self) -> Vec<Vec<u8>> {
        self.updates.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the replay list (used when loading from the store).
    pub fn set_updates(&self, updates: Vec<Vec<u8>>) {
        let mut current = self.updates.write().unwrap_or_else(|e| e.into_inner());
        *current = updates;
    }

    pub fn update_count(&self) -> usize {
        self.updates.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Record a session's latest awareness frame.
    pub fn set_awareness(&self, session_id: u64, frame: Vec<u8>) {
        let mut awareness = self.awareness.write().unwrap_or_else(|e| e.into_inner());
        awareness.insert(session_id, frame);
    }

    /// Drop a session's awareness entry (on unregister).
    pub fn remove_awareness(&self, session_id: u64) {
        let mut awareness = self.awareness.write().unwrap_or_else(|e| e.into_inner());
        awareness.remove(&session_id);
    }

    /// All retained awareness frames, for catch-up replay.
    pub fn awareness_frames(&self) -> Vec<Vec<u8>> {
        let awareness = self.awareness.read().unwrap_or_else(|e| e.into_inner());
        awareness.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_and_read_updates() {
        let room = RoomState::new();
        room.add_update(vec![0x00, 0x02, 1]);
        room.add_update(vec![0x00, 0x02, 2]);

        let updates = room.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], vec![0x00, 0x02, 1]);
        assert_eq!(updates[1], vec![0x00, 0x02, 2]);
    }

    #[test]
    fn test_set_updates_replaces() {
        let room = RoomState::new();
        room.add_update(vec![1]);
        room.set_updates(vec![vec![2], vec![3]]);

        assert_eq!(room.update_count(), 2);
        assert_eq!(room.updates()[0], vec![2]);
    }

    #[test]
    fn test_awareness_latest_wins() {
        let room = RoomState::new();
        room.set_awareness(7, vec![0x01, 0x00, 1]);
        room.set_awareness(7, vec![0x01, 0x00, 2]);
        room.set_awareness(9, vec![0x01, 0x00, 3]);

        let frames = room.awareness_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames.contains(&vec![0x01, 0x00, 2]));
        assert!(frames.contains(&vec![0x01, 0x00, 3]));
    }

    #[test]
    fn test_awareness_removed_on_unregister() {
        let room = RoomState::new();
        room.set_awareness(7, vec![0x01, 0x00]);
        room.remove_awareness(7);
        assert!(room.awareness_frames().is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let room = Arc::new(RoomState::new());
        let mut handles = Vec::new();

        for i in 0..100u8 {
            let room = room.clone();
            handles.push(std::thread::spawn(move || {
                room.add_update(vec![0x00, 0x02, i]);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(room.update_count(), 100);
    }
}
