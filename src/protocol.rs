//! Wire framing for the CRDT sync/awareness protocol.
//!
//! The hub validates frames but never interprets them: payload bytes past
//! the kind/subkind prefix belong to the client-side CRDT library.
//!
//! Frame layout:
//! ```text
//! ┌──────────┬─────────────┬─────────────────────┐
//! │ kind     │ sync subkind│ opaque CRDT payload │
//! │ 1 byte   │ 1 byte      │ variable            │
//! └──────────┴─────────────┴─────────────────────┘
//! kind:    0x00 = sync, 0x01 = awareness
//! subkind: 0 = step1, 1 = step2, 2 = update (sync frames only)
//! ```
//!
//! Snapshot blobs produced by compaction concatenate frames with a u32
//! big-endian length prefix each. Splitting tolerates truncation: any
//! well-formed prefix is a valid replay.

use std::fmt;

/// First byte of a sync frame.
pub const FRAME_SYNC: u8 = 0x00;
/// First byte of an awareness frame.
pub const FRAME_AWARENESS: u8 = 0x01;

/// Highest valid sync subkind (step1 = 0, step2 = 1, update = 2).
pub const MAX_SYNC_SUBKIND: u8 = 2;

/// Maximum accepted inbound frame size: 1 MiB.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Socket read deadline, refreshed on pong.
pub const READ_DEADLINE_SECS: u64 = 60;
/// Ping period: ~9/10 of the read deadline.
pub const PING_PERIOD_SECS: u64 = 54;
/// Per-frame write deadline.
pub const WRITE_DEADLINE_SECS: u64 = 10;

/// Outbound frames buffered per session before eviction.
pub const SESSION_BUFFER: usize = 512;
/// Hub broadcast mailbox depth.
pub const BROADCAST_QUEUE: usize = 256;

/// Frame classification after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// CRDT document update — persisted and replayed to late joiners.
    Sync,
    /// Presence/cursor state — forwarded, never persisted.
    Awareness,
}

/// Frame validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Zero-length frame.
    Empty,
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    TooLarge(usize),
    /// First byte is neither sync nor awareness.
    UnknownKind(u8),
    /// Sync frame shorter than 2 bytes.
    SyncTooShort,
    /// Sync subkind outside {0, 1, 2}.
    InvalidSyncSubkind(u8),
    /// Awareness frame shorter than 2 bytes.
    AwarenessTooShort,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Empty => write!(f, "empty frame"),
            FrameError::TooLarge(n) => write!(f, "frame too large: {n} bytes"),
            FrameError::UnknownKind(k) => write!(f, "unknown frame kind: {k}"),
            FrameError::SyncTooShort => write!(f, "sync frame too short"),
            FrameError::InvalidSyncSubkind(s) => write!(f, "invalid sync subkind: {s}"),
            FrameError::AwarenessTooShort => write!(f, "awareness frame too short"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Validate an inbound frame and classify it.
///
/// Bytes beyond the kind/subkind prefix are opaque and not inspected.
pub fn validate_frame(data: &[u8]) -> Result<FrameKind, FrameError> {
    if data.is_empty() {
        return Err(FrameError::Empty);
    }
    if data.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(data.len()));
    }

    match data[0] {
        FRAME_SYNC => {
            if data.len() < 2 {
                return Err(FrameError::SyncTooShort);
            }
            let subkind = data[1];
            if subkind > MAX_SYNC_SUBKIND {
                return Err(FrameError::InvalidSyncSubkind(subkind));
            }
            Ok(FrameKind::Sync)
        }
        FRAME_AWARENESS => {
            if data.len() < 2 {
                return Err(FrameError::AwarenessTooShort);
            }
            Ok(FrameKind::Awareness)
        }
        other => Err(FrameError::UnknownKind(other)),
    }
}

/// Merge updates into a snapshot blob: per update, a u32 big-endian length
/// prefix followed by the frame bytes, in log order.
pub fn merge_updates(updates: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = updates.iter().map(|u| u.len()).sum();
    let mut merged = Vec::with_capacity(total + updates.len() * 4);

    for update in updates {
        merged.extend_from_slice(&(update.len() as u32).to_be_bytes());
        merged.extend_from_slice(update);
    }

    merged
}

/// Split a snapshot blob back into individual frames.
///
/// Truncation or a length prefix extending past the end terminates parsing
/// silently — the well-formed prefix parsed so far is returned.
pub fn split_updates(merged: &[u8]) -> Vec<Vec<u8>> {
    let mut updates = Vec::new();
    let mut offset = 0usize;

    while offset + 4 <= merged.len() {
        let len = u32::from_be_bytes([
            merged[offset],
            merged[offset + 1],
            merged[offset + 2],
            merged[offset + 3],
        ]) as usize;
        offset += 4;

        if offset + len > merged.len() {
            break;
        }

        updates.push(merged[offset..offset + len].to_vec());
        offset += len;
    }

    updates
}
