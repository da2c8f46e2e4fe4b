//! Periodic compaction of per-room update logs into snapshot blobs.
//!
//! Rooms whose persisted update count reaches the threshold have the
//! prefix of their log (everything except the newest `keep_recent`
//! updates) merged into the room's length-prefixed snapshot blob, after
//! which the merged updates are deleted. The blob grows by appending on
//! each cycle, so snapshot-expanded frames followed by the stored tail
//! always reproduce the full history a late joiner must replay.
//!
//! Snapshot-first ordering matters: the upsert and the truncate are
//! separate transactions, and a crash between them leaves the log fully
//! recoverable. The next cycle would then re-merge the surviving prefix
//! into the blob; duplicated frames are harmless because clients merge
//! CRDT updates idempotently.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (log compaction)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;

use crate::protocol;
use crate::store::{Store, StoreError};

/// Compaction tuning.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Pass cadence.
    pub interval: Duration,
    /// Persisted update count at which a room is compacted.
    pub update_threshold: u64,
    /// Updates left individually stored after compaction.
    pub keep_recent: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            update_threshold: 100,
            keep_recent: 10,
        }
    }
}

/// Background compaction service.
pub struct Compactor {
    store: Arc<Store>,
    config: CompactionConfig,
    stop_tx: watch::Sender<bool>,
}

impl Compactor {
    pub fn new(store: Arc<Store>, config: CompactionConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            config,
            stop_tx,
        }
    }

    /// Spawn the periodic task: one pass immediately, then every tick.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let config = self.config.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        log::info!(
            "Compaction service started (interval: {:?}, threshold: {} updates)",
            config.interval,
            config.update_threshold
        );

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.tick().await; // immediate first pass

            loop {
                compact_all_rooms(&store, &config);

                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => {
                        log::info!("Compaction service stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Signal the periodic task to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Compact a single room immediately, regardless of the timer.
    pub fn compact_now(&self, room_id: &str) -> Result<(), StoreError> {
        compact_room(&self.store, room_id, &self.config)
    }
}

fn compact_all_rooms(store: &Store, config: &CompactionConfig) {
    let rooms = match store.list_rooms(1000, 0) {
        Ok(rooms) => rooms,
        Err(e) => {
            log::error!("Compaction: failed to list rooms: {e}");
            return;
        }
    };

    let mut compacted = 0usize;
    for room in &rooms {
        let count = match store.count_updates(&room.id) {
            Ok(count) => count,
            Err(_) => continue,
        };
        if count < config.update_threshold {
            continue;
        }
        match compact_room(store, &room.id, config) {
            Ok(()) => compacted += 1,
            Err(e) => log::error!("Compaction: failed for room {}: {e}", room.id),
        }
    }

    if compacted > 0 {
        log::info!("Compacted {compacted} rooms");
    }
}

fn compact_room(store: &Store, room_id: &str, config: &CompactionConfig) -> Result<(), StoreError> {
    let updates = store.list_updates(room_id)?;
    if (updates.len() as u64) < config.update_threshold {
        return Ok(());
    }

    // Merge everything except the tail that stays individually stored
    let cut = updates.len().saturating_sub(config.keep_recent as usize);
    if cut == 0 {
        return Ok(());
    }

    let (mut blob, prior_count) = match store.get_snapshot(room_id)? {
        Some((blob, count)) => (blob, count),
        None => (Vec::new(), 0),
    };
    blob.extend_from_slice(&protocol::merge_updates(&updates[..cut]));
    let merged_count = prior_count + cut as u32;

    // Snapshot before truncate: a crash here only duplicates the prefix.
    store.put_snapshot(room_id, &blob, merged_count)?;
    store.truncate_updates_keeping_tail(room_id, config.keep_recent)?;

    log::info!(
        "Compacted room {room_id}: {} updates -> snapshot({merged_count}) + {} recent",
        updates.len(),
        config.keep_recent
    );

    Ok(())
}
