//! SQLite-backed durable store for rooms, updates, snapshots, and versions.
//!
//! Schema (WAL mode, foreign keys cascade on room delete):
//! ```text
//! ┌────────────────────┐     ┌──────────────────────┐
//! │ rooms              │◄────│ document_updates     │  append-only log,
//! │  id (PK)           │     │  id (autoincrement)  │  ordered by id
//! │  name              │     │  room_id (FK)        │
//! │  created/updated   │     │  update_data (BLOB)  │
//! └─────────┬──────────┘     └──────────────────────┘
//!           │                ┌──────────────────────┐
//!           ├───────────────►│ room_snapshots       │  one per room,
//!           │                │  room_id (PK, FK)    │  upserted by the
//!           │                │  snapshot_data (BLOB)│  compactor
//!           │                │  update_count        │
//!           │                └──────────────────────┘
//!           │                ┌──────────────────────┐
//!           └───────────────►│ document_versions    │  named full-text
//!                            │  id (autoincrement)  │  snapshots
//!                            │  content, hash, ...  │
//!                            └──────────────────────┘
//! ```
//!
//! Concurrent callers are permitted; the store serializes writers
//! internally. Each operation is one transaction. Point reads return
//! `Ok(None)` for absence — engine failures are a separate error path.
//!
//! Reference: Kleppmann — DDIA, Chapter 7 (single-writer serialization)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage errors.
#[derive(Debug)]
pub enum StoreError {
    /// SQLite engine failure.
    Database(String),
    /// Filesystem failure creating the database directory.
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A collaborative room row.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named document version row.
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub id: i64,
    pub room_id: String,
    pub name: String,
    pub description: String,
    /// Full text content. Empty in list views (not selected).
    pub content: String,
    pub content_hash: String,
    pub created_by: String,
    pub is_auto: bool,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts for the stats endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub room_count: u64,
    pub update_count: u64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS document_updates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id TEXT NOT NULL,
    update_data BLOB NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_document_updates_room_id
    ON document_updates(room_id);

CREATE TABLE IF NOT EXISTS room_snapshots (
    room_id TEXT PRIMARY KEY,
    snapshot_data BLOB NOT NULL,
    update_count INTEGER DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS document_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_by TEXT NOT NULL DEFAULT '',
    is_auto INTEGER NOT NULL DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_document_versions_room_created
    ON document_versions(room_id, created_at DESC);
";

/// SQLite-backed store.
///
/// Holds one connection behind a mutex: SQLite in WAL mode supports
/// concurrent readers with a single writer, and every operation here is a
/// single short transaction.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// Enables WAL journaling and foreign-key enforcement, then applies
    /// the schema. Failure here is fatal to the caller.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        log::info!("Store initialized at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a prior writer panicked mid-operation;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    /// Idempotent room insert.
    pub fn create_room_if_absent(&self, id: &str, name: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO rooms (id, name) VALUES (?1, ?2)",
            params![id, name],
        )?;
        Ok(())
    }

    pub fn get_room(&self, id: &str) -> Result<Option<Room>, StoreError> {
        let conn = self.lock();
        let room = conn
            .query_row(
                "SELECT id, name, created_at, updated_at FROM rooms WHERE id = ?1",
                params![id],
                row_to_room,
            )
            .optional()?;
        Ok(room)
    }

    /// Rooms ordered by last activity, newest first.
    pub fn list_rooms(&self, limit: u32, offset: u32) -> Result<Vec<Room>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, created_at, updated_at FROM rooms
             ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rooms = stmt
            .query_map(params![limit, offset], row_to_room)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rooms)
    }

    /// Refresh a room's last-activity timestamp.
    pub fn touch_room(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE rooms SET updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Delete a room; updates, snapshot, and versions cascade.
    pub fn delete_room(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute("DELETE FROM rooms WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ─── Document updates ─────────────────────────────────────────────

    /// Append a sync frame to a room's update log.
    ///
    /// Creates the room when missing, inserts the update with the next
    /// sequence, and touches the room — one transaction.
    pub fn append_update(&self, room_id: &str, update: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO rooms (id, name) VALUES (?1, '')",
            params![room_id],
        )?;
        tx.execute(
            "INSERT INTO document_updates (room_id, update_data) VALUES (?1, ?2)",
            params![room_id, update],
        )?;
        tx.execute(
            "UPDATE rooms SET updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
            params![room_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All updates for a room, ascending sequence.
    pub fn list_updates(&self, room_id: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT update_data FROM document_updates WHERE room_id = ?1 ORDER BY id ASC",
        )?;
        let updates = stmt
            .query_map(params![room_id], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(updates)
    }

    pub fn count_updates(&self, room_id: &str) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM document_updates WHERE room_id = ?1",
            params![room_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete all of a room's updates except the `keep` newest by sequence.
    pub fn truncate_updates_keeping_tail(
        &self,
        room_id: &str,
        keep: u32,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM document_updates
             WHERE room_id = ?1 AND id NOT IN (
                 SELECT id FROM document_updates
                 WHERE room_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2
             )",
            params![room_id, keep],
        )?;
        Ok(())
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Upsert the room's snapshot blob (one snapshot per room).
    pub fn put_snapshot(
        &self,
        room_id: &str,
        snapshot: &[u8],
        merged_count: u32,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO room_snapshots (room_id, snapshot_data, update_count, updated_at)
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
             ON CONFLICT(room_id) DO UPDATE SET
                 snapshot_data = excluded.snapshot_data,
                 update_count = excluded.update_count,
                 updated_at = CURRENT_TIMESTAMP",
            params![room_id, snapshot, merged_count],
        )?;
        Ok(())
    }

    /// Snapshot blob and merged-update count, when present.
    pub fn get_snapshot(&self, room_id: &str) -> Result<Option<(Vec<u8>, u32)>, StoreError> {
        let conn = self.lock();
        let snapshot = conn
            .query_row(
                "SELECT snapshot_data, update_count FROM room_snapshots WHERE room_id = ?1",
                params![room_id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()?;
        Ok(snapshot)
    }

    // ─── Versions ─────────────────────────────────────────────────────

    /// Insert a named version; returns the stored row.
    #[allow(clippy::too_many_arguments)]
    pub fn create_version(
        &self,
        room_id: &str,
        name: &str,
        description: &str,
        content: &str,
        content_hash: &str,
        created_by: &str,
        is_auto: bool,
    ) -> Result<Version, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO rooms (id, name) VALUES (?1, '')",
            params![room_id],
        )?;
        tx.execute(
            "INSERT INTO document_versions
                 (room_id, name, description, content, content_hash, created_by, is_auto)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![room_id, name, description, content, content_hash, created_by, is_auto],
        )?;
        let id = tx.last_insert_rowid();
        let version = tx.query_row(
            "SELECT id, room_id, name, description, content, content_hash,
                    created_by, is_auto, created_at
             FROM document_versions WHERE id = ?1",
            params![id],
            row_to_version,
        )?;
        tx.commit()?;
        Ok(version)
    }

    /// Full version row including content.
    pub fn get_version(&self, id: i64) -> Result<Option<Version>, StoreError> {
        let conn = self.lock();
        let version = conn
            .query_row(
                "SELECT id, room_id, name, description, content, content_hash,
                        created_by, is_auto, created_at
                 FROM document_versions WHERE id = ?1",
                params![id],
                row_to_version,
            )
            .optional()?;
        Ok(version)
    }

    /// Versions for a room, newest first. Content is omitted from the rows
    /// to keep list payloads small.
    pub fn list_versions(
        &self,
        room_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Version>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, room_id, name, description, '', content_hash,
                    created_by, is_auto, created_at
             FROM document_versions
             WHERE room_id = ?1
             ORDER BY id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let versions = stmt
            .query_map(params![room_id, limit, offset], row_to_version)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    pub fn count_versions(&self, room_id: &str) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM document_versions WHERE room_id = ?1",
            params![room_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// The most recently created version for a room, content included.
    pub fn get_latest_version(&self, room_id: &str) -> Result<Option<Version>, StoreError> {
        let conn = self.lock();
        let version = conn
            .query_row(
                "SELECT id, room_id, name, description, content, content_hash,
                        created_by, is_auto, created_at
                 FROM document_versions
                 WHERE room_id = ?1
                 ORDER BY id DESC
                 LIMIT 1",
                params![room_id],
                row_to_version,
            )
            .optional()?;
        Ok(version)
    }

    pub fn delete_version(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute("DELETE FROM document_versions WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Delete auto-created versions beyond the newest `keep`.
    pub fn trim_auto_versions(&self, room_id: &str, keep: u32) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM document_versions
             WHERE room_id = ?1 AND is_auto = 1 AND id NOT IN (
                 SELECT id FROM document_versions
                 WHERE room_id = ?1 AND is_auto = 1
                 ORDER BY id DESC
                 LIMIT ?2
             )",
            params![room_id, keep],
        )?;
        Ok(())
    }

    // ─── Stats ────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock();
        let room_count: u64 =
            conn.query_row("SELECT COUNT(*) FROM rooms", [], |row| row.get(0))?;
        let update_count: u64 =
            conn.query_row("SELECT COUNT(*) FROM document_updates", [], |row| row.get(0))?;
        Ok(StoreStats {
            room_count,
            update_count,
        })
    }
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    Ok(Room {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<Version> {
    Ok(Version {
        id: row.get(0)?,
        room_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        content: row.get(4)?,
        content_hash: row.get(5)?,
        created_by: row.get(6)?,
        is_auto: row.get(7)?,
        created_at: row.get(8)?,
    })
}
