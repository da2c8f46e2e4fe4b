//! # lattice-collab — coordination core for collaborative text editing
//!
//! Fans out CRDT update frames between clients in the same room, persists
//! them for catch-up replay, and keeps the on-disk log bounded through
//! periodic compaction. Update payloads are opaque: the server validates
//! framing and never parses or merges CRDT state.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐  /ws?room=…   ┌──────────┐   mailbox   ┌───────────┐
//!            ├───────────────│ sessions │────────────►│ hub       │
//! Client B ──┘  (reader +    └──────────┘             │ scheduler │
//!                writer pump)                         └─────┬─────┘
//!                                                          │
//!                                       ┌──────────────────┼─────────────┐
//!                                       ▼                  ▼             ▼
//!                                 RoomState cache    fan-out to     Store (SQLite)
//!                                 (replay + presence) members       updates/snapshots
//!                                                                        ▲
//!                              ┌──────────┐    merge + truncate          │
//!                              │ compactor│──────────────────────────────┤
//!                              └──────────┘                              │
//!                              ┌──────────┐    named versions            │
//!                              │ versions │──────────────────────────────┘
//!                              └──────────┘    (create/diff/restore)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]  — frame validation and the snapshot blob codec
//! - [`store`]     — durable rooms, update log, snapshots, versions
//! - [`ratelimit`] — per-client token buckets
//! - [`room`]      — in-memory replay and awareness cache
//! - [`hub`]       — actor-mailbox membership and broadcast
//! - [`session`]   — per-connection WebSocket pumps
//! - [`compaction`]— periodic merge-and-truncate
//! - [`versions`]  — named-version capture, line diff, restore
//! - [`api`]       — HTTP endpoints and the WebSocket upgrade

pub mod api;
pub mod compaction;
pub mod hub;
pub mod protocol;
pub mod ratelimit;
pub mod room;
pub mod session;
pub mod store;
pub mod versions;

pub use api::{router, AppState};
pub use compaction::{CompactionConfig, Compactor};
pub use hub::{Hub, HubCommand, HubScheduler};
pub use protocol::{validate_frame, FrameError, FrameKind};
pub use ratelimit::{ClientLimiters, TokenBucket};
pub use room::RoomState;
pub use store::{Room, Store, StoreError, StoreStats, Version};
pub use versions::{
    compute_diff, hash_content, CreateVersionParams, DiffKind, DiffLine, VersionError,
    VersionService,
};
