//! Per-connection I/O pumps bridging a WebSocket to the hub.
//!
//! Each accepted connection runs one reader and one writer task. The
//! reader enforces the rate limit and frame validation, then enqueues on
//! the hub mailbox; the writer drains the session's outbound channel to
//! the socket, pinging on a timer. Deadlines: 60 s read, extended only
//! when a pong arrives, 54 s ping period, 10 s per write.
//!
//! The hub's member map holds the only sender for the outbound channel,
//! so eviction or unregistration closes it; the writer then sends a Close
//! frame and exits, which surfaces as a read error and ends the reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, timeout_at, Instant};

use crate::hub::Hub;
use crate::protocol::{
    self, PING_PERIOD_SECS, READ_DEADLINE_SECS, SESSION_BUFFER, WRITE_DEADLINE_SECS,
};
use crate::ratelimit::ClientLimiters;

/// Rate-limit violations tolerated before the session is terminated.
const MAX_RATE_VIOLATIONS: u64 = 1000;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Serve one accepted WebSocket until either pump stops.
pub async fn serve_socket(
    socket: WebSocket,
    room_id: String,
    client_key: String,
    hub: Hub,
    limiters: Arc<ClientLimiters>,
) {
    let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(SESSION_BUFFER);

    hub.register(session_id, room_id.clone(), outbound_tx).await;

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(sink, outbound_rx));

    read_pump(stream, session_id, &room_id, &client_key, &hub, &limiters).await;

    // Unregistration drops the hub's outbound sender, which lets the
    // writer send its Close frame and exit on its own.
    hub.unregister(session_id, room_id).await;
    if timeout(Duration::from_secs(WRITE_DEADLINE_SECS), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

/// Drain inbound frames: rate-limit, validate, enqueue.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    session_id: u64,
    room_id: &str,
    client_key: &str,
    hub: &Hub,
    limiters: &ClientLimiters,
) {
    let bucket = limiters.get(client_key);
    let mut rate_violations: u64 = 0;
    let read_deadline = Duration::from_secs(READ_DEADLINE_SECS);
    // Liveness is pong-driven: only a pong pushes the deadline out.
    // Other traffic does not count — a peer that floods frames but
    // cannot answer pings is still dropped.
    let mut deadline = Instant::now() + read_deadline;

    loop {
        let message = match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                log::warn!("Read deadline expired for client {client_key} in room {room_id}");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                log::debug!("WebSocket error from {client_key}: {e}");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => return,
            Message::Pong(_) => {
                deadline = Instant::now() + read_deadline;
                continue;
            }
            // Pings are answered by the transport
            Message::Ping(_) => continue,
            Message::Text(_) => {
                log::debug!("Ignoring text frame from {client_key}");
                continue;
            }
        };

        if !bucket.allow() {
            rate_violations += 1;
            if rate_violations % 100 == 1 {
                log::warn!(
                    "Rate limit exceeded for client {client_key} in room {room_id} (violation #{rate_violations})"
                );
            }
            if rate_violations > MAX_RATE_VIOLATIONS {
                log::warn!("Disconnecting client {client_key} for excessive rate limit violations");
                return;
            }
            continue;
        }

        if let Err(e) = protocol::validate_frame(&data) {
            log::warn!("Invalid frame from client {client_key}: {e}");
            continue;
        }

        hub.broadcast(room_id, data.to_vec(), Some(session_id)).await;
    }
}

/// Drain the outbound channel to the socket; ping on a timer.
async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Vec<u8>>) {
    let write_deadline = Duration::from_secs(WRITE_DEADLINE_SECS);
    let mut ping = interval(Duration::from_secs(PING_PERIOD_SECS));
    ping.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(data) => {
                        let send = sink.send(Message::Binary(data.into()));
                        match timeout(write_deadline, send).await {
                            Ok(Ok(())) => {}
                            _ => return,
                        }
                    }
                    // Channel closed by the hub: say goodbye properly
                    None => {
                        let _ = timeout(write_deadline, sink.send(Message::Close(None))).await;
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                let send = sink.send(Message::Ping(Vec::new().into()));
                if !matches!(timeout(write_deadline, send).await, Ok(Ok(()))) {
                    return;
                }
            }
        }
    }
}
