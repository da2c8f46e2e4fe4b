//! Room hub: the single serialization point for membership and broadcast.
//!
//! Architecture:
//! ```text
//! reader tasks ──┐  Register / Unregister /
//!                ├─ Broadcast / Stop ──► mailbox ──► scheduler task
//! api, shutdown ─┘                                       │
//!                                                        ├── members:    room → {session → outbound}
//!                                                        ├── roomStates: room → RoomState (replay cache)
//!                                                        └── store:      append-through on sync frames
//! ```
//!
//! One scheduler task drains the mailbox and applies every state
//! transition, so the member map needs no fine-grained locking: the
//! scheduler is the only writer, and stats readers take a read lock.
//! Fan-out uses non-blocking sends; a session whose outbound buffer is
//! full is evicted (slow-consumer policy). Within a room, the scheduler's
//! serialization defines a single broadcast order observed by all healthy
//! members, and a sender never receives its own frame.
//!
//! Reference: Kleppmann — DDIA, Chapter 8 (total order broadcast)

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

use crate::protocol::{self, BROADCAST_QUEUE};
use crate::room::RoomState;
use crate::store::Store;

/// Commands accepted by the scheduler mailbox.
#[derive(Debug)]
pub enum HubCommand {
    Register {
        session_id: u64,
        room_id: String,
        outbound: mpsc::Sender<Vec<u8>>,
    },
    Unregister {
        session_id: u64,
        room_id: String,
    },
    Broadcast {
        room_id: String,
        data: Vec<u8>,
        sender: Option<u64>,
    },
    Stop,
}

type MemberMap = HashMap<String, HashMap<u64, mpsc::Sender<Vec<u8>>>>;

struct HubInner {
    /// room → {session id → outbound channel}. Written only by the
    /// scheduler; read-locked for stats.
    members: RwLock<MemberMap>,
    /// room → replay cache. Entries persist across empty periods.
    room_states: RwLock<HashMap<String, Arc<RoomState>>>,
    store: Option<Arc<Store>>,
}

/// Cloneable handle for enqueueing commands and reading stats.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
    tx: mpsc::Sender<HubCommand>,
}

/// Owns the mailbox receiver; consumed by [`HubScheduler::run`].
pub struct HubScheduler {
    inner: Arc<HubInner>,
    rx: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Create a hub and its scheduler. Spawn `scheduler.run()` to start.
    pub fn new(store: Option<Arc<Store>>) -> (Hub, HubScheduler) {
        let (tx, rx) = mpsc::channel(BROADCAST_QUEUE);
        let inner = Arc::new(HubInner {
            members: RwLock::new(HashMap::new()),
            room_states: RwLock::new(HashMap::new()),
            store,
        });
        (
            Hub {
                inner: inner.clone(),
                tx,
            },
            HubScheduler { inner, rx },
        )
    }

    /// Enqueue a registration for a newly accepted session.
    pub async fn register(
        &self,
        session_id: u64,
        room_id: impl Into<String>,
        outbound: mpsc::Sender<Vec<u8>>,
    ) {
        let _ = self
            .tx
            .send(HubCommand::Register {
                session_id,
                room_id: room_id.into(),
                outbound,
            })
            .await;
    }

    /// Enqueue removal of a session.
    pub async fn unregister(&self, session_id: u64, room_id: impl Into<String>) {
        let _ = self
            .tx
            .send(HubCommand::Unregister {
                session_id,
                room_id: room_id.into(),
            })
            .await;
    }

    /// Enqueue a validated frame for classification and fan-out.
    pub async fn broadcast(&self, room_id: impl Into<String>, data: Vec<u8>, sender: Option<u64>) {
        let _ = self
            .tx
            .send(HubCommand::Broadcast {
                room_id: room_id.into(),
                data,
                sender,
            })
            .await;
    }

    /// Ask the scheduler to return.
    pub async fn stop(&self) {
        let _ = self.tx.send(HubCommand::Stop).await;
    }

    // ─── Read-side snapshots ──────────────────────────────────────────

    /// Number of rooms with at least one connected session.
    pub async fn active_room_count(&self) -> usize {
        self.inner.members.read().await.len()
    }

    /// Total connected sessions across all rooms.
    pub async fn client_count(&self) -> usize {
        self.inner
            .members
            .read()
            .await
            .values()
            .map(|clients| clients.len())
            .sum()
    }

    /// room id → connected session count.
    pub async fn active_rooms(&self) -> HashMap<String, usize> {
        self.inner
            .members
            .read()
            .await
            .iter()
            .map(|(room, clients)| (room.clone(), clients.len()))
            .collect()
    }
}

impl HubScheduler {
    /// Drain the mailbox until `Stop` or until every `Hub` handle is gone.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                HubCommand::Register {
                    session_id,
                    room_id,
                    outbound,
                } => self.handle_register(session_id, room_id, outbound).await,
                HubCommand::Unregister {
                    session_id,
                    room_id,
                } => self.handle_unregister(session_id, &room_id).await,
                HubCommand::Broadcast {
                    room_id,
                    data,
                    sender,
                } => self.handle_broadcast(&room_id, data, sender).await,
                HubCommand::Stop => return,
            }
        }
    }

    async fn handle_register(
        &self,
        session_id: u64,
        room_id: String,
        outbound: mpsc::Sender<Vec<u8>>,
    ) {
        let member_count = {
            let mut members = self.inner.members.write().await;
            let clients = members.entry(room_id.clone()).or_default();
            clients.insert(session_id, outbound.clone());
            clients.len()
        };
        log::info!("Client {session_id} joined room {room_id} (total: {member_count})");

        let room_state = self.get_or_load_room_state(&room_id).await;

        // Catch-up replay: retained updates in order, then awareness.
        // A full buffer here is logged but never evicts the new session.
        let updates = room_state.updates();
        if !updates.is_empty() {
            log::info!(
                "Replaying {} updates to client {session_id} in room {room_id}",
                updates.len()
            );
            for update in updates {
                if outbound.try_send(update).is_err() {
                    log::warn!("Catch-up buffer full for client {session_id} in room {room_id}");
                }
            }
        }

        for frame in room_state.awareness_frames() {
            let _ = outbound.try_send(frame);
        }
    }

    async fn handle_unregister(&self, session_id: u64, room_id: &str) {
        let mut members = self.inner.members.write().await;
        if let Some(clients) = members.get_mut(room_id) {
            // Dropping the outbound sender closes the session's channel;
            // the map holds the only copy, so this happens exactly once.
            if clients.remove(&session_id).is_some() {
                if clients.is_empty() {
                    members.remove(room_id);
                    log::info!("Room {room_id} closed (empty)");
                } else {
                    log::info!(
                        "Client {session_id} left room {room_id} (remaining: {})",
                        clients.len()
                    );
                }
            }
        }
        drop(members);

        let room_states = self.inner.room_states.read().await;
        if let Some(state) = room_states.get(room_id) {
            state.remove_awareness(session_id);
        }
    }

    async fn handle_broadcast(&self, room_id: &str, data: Vec<u8>, sender: Option<u64>) {
        let room_state = self.get_or_load_room_state(room_id).await;

        if !data.is_empty() {
            match data[0] {
                protocol::FRAME_SYNC => {
                    room_state.add_update(data.clone());

                    if let Some(store) = &self.inner.store {
                        // Persistence failure must not block the broadcast.
                        if let Err(e) = store.append_update(room_id, &data) {
                            log::error!("Error persisting update for room {room_id}: {e}");
                        }
                    }
                }
                protocol::FRAME_AWARENESS => {
                    if let Some(sender_id) = sender {
                        room_state.set_awareness(sender_id, data.clone());
                    }
                }
                _ => {}
            }
        }

        let mut members = self.inner.members.write().await;
        let Some(clients) = members.get_mut(room_id) else {
            return;
        };

        let mut evicted = Vec::new();
        for (&id, outbound) in clients.iter() {
            if Some(id) == sender {
                continue;
            }
            match outbound.try_send(data.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    evicted.push(id);
                }
            }
        }

        for id in evicted {
            clients.remove(&id);
            // No longer a member: stop replaying its presence to joiners
            room_state.remove_awareness(id);
            log::warn!("Evicted slow client {id} from room {room_id}");
        }
        if clients.is_empty() {
            members.remove(room_id);
        }
    }

    /// Room replay cache, loaded from the store on first reference.
    ///
    /// A load failure is logged and the room served as empty — clients
    /// converge via peer CRDT sync on top of the hub.
    async fn get_or_load_room_state(&self, room_id: &str) -> Arc<RoomState> {
        {
            let room_states = self.inner.room_states.read().await;
            if let Some(state) = room_states.get(room_id) {
                return state.clone();
            }
        }

        let state = Arc::new(RoomState::new());

        if let Some(store) = &self.inner.store {
            let mut all_updates = Vec::new();

            match store.get_snapshot(room_id) {
                Ok(Some((blob, merged_count))) => {
                    let snapshot_updates = protocol::split_updates(&blob);
                    log::info!(
                        "Loaded snapshot with {} updates for room {room_id} (merged: {merged_count})",
                        snapshot_updates.len()
                    );
                    all_updates.extend(snapshot_updates);
                }
                Ok(None) => {}
                Err(e) => log::error!("Error loading snapshot for room {room_id}: {e}"),
            }

            match store.list_updates(room_id) {
                Ok(tail) => {
                    if !tail.is_empty() {
                        log::info!("Loaded {} recent updates for room {room_id}", tail.len());
                        all_updates.extend(tail);
                    }
                }
                Err(e) => log::error!("Error loading updates for room {room_id}: {e}"),
            }

            if !all_updates.is_empty() {
                state.set_updates(all_updates);
            }
        }

        let mut room_states = self.inner.room_states.write().await;
        // Another command may have loaded it while we read the store
        room_states
            .entry(room_id.to_string())
            .or_insert_with(|| state.clone())
            .clone()
    }
}
