//! End-to-end tests over a live server: real WebSocket clients, real HTTP.
//!
//! Each test starts the full router on a free port with an in-memory
//! store and drives it the way browser clients would.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use lattice_collab::{router, AppState, Hub, Store};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_server() -> (String, Arc<Store>, Hub) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let (hub, scheduler) = Hub::new(Some(store.clone()));
    tokio::spawn(scheduler.run());

    let state = AppState::new(hub.clone(), store.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr.to_string(), store, hub)
}

async fn connect(addr: &str, room: &str) -> WsClient {
    let url = format!("ws://{addr}/ws?room={room}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("WebSocket connect failed");
    ws
}

/// Next binary frame, skipping pings/pongs.
async fn recv_binary(ws: &mut WsClient) -> Vec<u8> {
    loop {
        let message = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        match message {
            Message::Binary(data) => return data.into(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Assert no binary frame arrives within the grace period.
async fn assert_silent(ws: &mut WsClient, grace: Duration) {
    let result = timeout(grace, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(_)) => continue,
                _ => std::future::pending().await,
            }
        }
    })
    .await;
    assert!(result.is_err(), "expected silence, got {:?}", result.unwrap());
}

// ─── Sync fan-out ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_update_fans_out_and_persists() {
    let (addr, store, _hub) = start_server().await;

    let mut a = connect(&addr, "r1").await;
    let mut b = connect(&addr, "r1").await;
    sleep(Duration::from_millis(100)).await;

    let frame = vec![0x00, 0x02, 0xDE, 0xAD];
    a.send(Message::Binary(frame.clone().into())).await.unwrap();

    assert_eq!(recv_binary(&mut b).await, frame);
    // Sender gets no echo
    assert_silent(&mut a, Duration::from_millis(200)).await;

    assert_eq!(store.count_updates("r1").unwrap(), 1);
    assert_eq!(store.list_updates("r1").unwrap()[0], frame);
}

#[tokio::test]
async fn test_awareness_forwarded_not_persisted() {
    let (addr, store, _hub) = start_server().await;

    let mut a = connect(&addr, "r2").await;
    let mut b = connect(&addr, "r2").await;
    sleep(Duration::from_millis(100)).await;

    a.send(Message::Binary(vec![0x01, 0x00].into())).await.unwrap();

    assert_eq!(recv_binary(&mut b).await, vec![0x01, 0x00]);
    assert_eq!(store.count_updates("r2").unwrap(), 0);
}

#[tokio::test]
async fn test_late_joiner_replays_history_in_order() {
    let (addr, _store, _hub) = start_server().await;

    let mut a = connect(&addr, "r1").await;
    sleep(Duration::from_millis(100)).await;

    let u1 = vec![0x00, 0x02, 1];
    let u2 = vec![0x00, 0x02, 2];
    let u3 = vec![0x00, 0x02, 3];
    for update in [&u1, &u2, &u3] {
        a.send(Message::Binary(update.clone().into())).await.unwrap();
    }
    sleep(Duration::from_millis(100)).await;
    a.close(None).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let mut b = connect(&addr, "r1").await;
    assert_eq!(recv_binary(&mut b).await, u1);
    assert_eq!(recv_binary(&mut b).await, u2);
    assert_eq!(recv_binary(&mut b).await, u3);
}

#[tokio::test]
async fn test_rooms_do_not_leak_frames() {
    let (addr, _store, _hub) = start_server().await;

    let mut a = connect(&addr, "alpha").await;
    let mut b = connect(&addr, "beta").await;
    sleep(Duration::from_millis(100)).await;

    a.send(Message::Binary(vec![0x00, 0x02, 7].into())).await.unwrap();

    assert_silent(&mut b, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_invalid_frames_dropped_session_survives() {
    let (addr, store, _hub) = start_server().await;

    let mut a = connect(&addr, "r1").await;
    let mut b = connect(&addr, "r1").await;
    sleep(Duration::from_millis(100)).await;

    // Unknown kind, bad subkind, short sync, empty: all dropped
    a.send(Message::Binary(vec![0x02, 0x00].into())).await.unwrap();
    a.send(Message::Binary(vec![0x00, 0x03].into())).await.unwrap();
    a.send(Message::Binary(vec![0x00].into())).await.unwrap();
    a.send(Message::Binary(Vec::new().into())).await.unwrap();

    // The session is still alive and a valid frame goes through
    let valid = vec![0x00, 0x02, 0x01];
    a.send(Message::Binary(valid.clone().into())).await.unwrap();

    assert_eq!(recv_binary(&mut b).await, valid);
    assert_eq!(store.count_updates("r1").unwrap(), 1);
}

#[tokio::test]
async fn test_default_room_when_query_missing() {
    let (addr, store, _hub) = start_server().await;

    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    ws.send(Message::Binary(vec![0x00, 0x02, 5].into())).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(store.count_updates("default").unwrap(), 1);
}

#[tokio::test]
async fn test_rate_limited_session_terminated() {
    let (addr, _store, hub) = start_server().await;

    let mut x = connect(&addr, "limits").await;
    sleep(Duration::from_millis(100)).await;

    // Far beyond 200 burst + refill: accumulates > 1000 violations
    for i in 0..3000u32 {
        let frame = vec![0x01, 0x00, (i % 256) as u8];
        if x.send(Message::Binary(frame.into())).await.is_err() {
            break;
        }
    }

    // Reader task exits and unregisters the session
    let mut closed = false;
    for _ in 0..50 {
        sleep(Duration::from_millis(100)).await;
        if hub.client_count().await == 0 {
            closed = true;
            break;
        }
    }
    assert!(closed, "rate-limited session was not terminated");
}

// ─── HTTP API ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _store, _hub) = start_server().await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_stats_endpoint() {
    let (addr, store, _hub) = start_server().await;
    store.append_update("r1", &[0x00, 0x02, 1]).unwrap();

    let _a = connect(&addr, "r1").await;
    sleep(Duration::from_millis(100)).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/api/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["active_rooms"], 1);
    assert_eq!(body["active_clients"], 1);
    assert_eq!(body["total_rooms"], 1);
    assert_eq!(body["total_updates"], 1);
}

#[tokio::test]
async fn test_room_crud() {
    let (addr, _store, _hub) = start_server().await;
    let client = reqwest::Client::new();

    // Missing id -> 400
    let resp = client
        .post(format!("http://{addr}/api/rooms"))
        .json(&serde_json::json!({ "name": "No id" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Malformed JSON -> 400
    let resp = client
        .post(format!("http://{addr}/api/rooms"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Create -> 201
    let resp = client
        .post(format!("http://{addr}/api/rooms"))
        .json(&serde_json::json!({ "id": "design-doc", "name": "Design Doc" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "design-doc");
    assert_eq!(body["name"], "Design Doc");

    // Get -> 200
    let body: serde_json::Value = client
        .get(format!("http://{addr}/api/rooms/design-doc"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["id"], "design-doc");
    assert_eq!(body["active_users"], 0);

    // List
    let body: serde_json::Value = client
        .get(format!("http://{addr}/api/rooms"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["rooms"].as_array().unwrap().len(), 1);
    assert_eq!(body["limit"], 20);

    // Delete, then 404
    let resp = client
        .delete(format!("http://{addr}/api/rooms/design-doc"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("http://{addr}/api/rooms/design-doc"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_room_get_unknown_is_404() {
    let (addr, _store, _hub) = start_server().await;
    let resp = reqwest::get(format!("http://{addr}/api/rooms/ghost")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_version_create_and_auto_dedup() {
    let (addr, _store, _hub) = start_server().await;
    let client = reqwest::Client::new();

    let payload = serde_json::json!({
        "room_id": "r1",
        "content": "hello",
        "is_auto": true,
    });

    let resp = client
        .post(format!("http://{addr}/api/versions"))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let first: serde_json::Value = resp.json().await.unwrap();

    // Identical auto-save: 200 with the same row, no new insert
    let resp = client
        .post(format!("http://{addr}/api/versions"))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let second: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(second["id"], first["id"]);

    let body: serde_json::Value = client
        .get(format!("http://{addr}/api/versions?room_id=r1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);
}

#[tokio::test]
async fn test_version_validation_and_fetch() {
    let (addr, _store, _hub) = start_server().await;
    let client = reqwest::Client::new();

    // Empty room_id / content -> 400
    for bad in [
        serde_json::json!({ "content": "x" }),
        serde_json::json!({ "room_id": "r1" }),
    ] {
        let resp = client
            .post(format!("http://{addr}/api/versions"))
            .json(&bad)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    let resp = client
        .post(format!("http://{addr}/api/versions"))
        .json(&serde_json::json!({
            "room_id": "r1",
            "name": "Draft",
            "content": "line1\nline2",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = resp.json().await.unwrap();
    // Create/list responses omit content
    assert!(created.get("content").is_none());
    assert_eq!(created["content_hash"].as_str().unwrap().len(), 16);

    // Get returns the full row
    let body: serde_json::Value = client
        .get(format!("http://{addr}/api/versions/{}", created["id"]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["content"], "line1\nline2");

    // Unknown id -> 404
    let resp = client
        .get(format!("http://{addr}/api/versions/99999"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_version_diff_endpoint() {
    let (addr, _store, _hub) = start_server().await;
    let client = reqwest::Client::new();

    let mut ids = Vec::new();
    for content in ["a\nb\nc", "a\nx\nc"] {
        let resp = client
            .post(format!("http://{addr}/api/versions"))
            .json(&serde_json::json!({ "room_id": "r1", "content": content }))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        ids.push(body["id"].as_i64().unwrap());
    }

    let body: serde_json::Value = client
        .get(format!(
            "http://{addr}/api/versions/diff?from={}&to={}",
            ids[0], ids[1]
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["from"]["id"], ids[0]);
    assert_eq!(body["to"]["id"], ids[1]);
    let diff = body["diff"].as_array().unwrap();
    let added: Vec<_> = diff.iter().filter(|l| l["type"] == "added").collect();
    let removed: Vec<_> = diff.iter().filter(|l| l["type"] == "removed").collect();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0]["content"], "x");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0]["content"], "b");

    // Missing params -> 400
    let resp = client
        .get(format!("http://{addr}/api/versions/diff?from={}", ids[0]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_version_restore_endpoint() {
    let (addr, _store, _hub) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/versions"))
        .json(&serde_json::json!({
            "room_id": "r1",
            "name": "Checkpoint",
            "content": "the good state",
        }))
        .send()
        .await
        .unwrap();
    let created: serde_json::Value = resp.json().await.unwrap();
    let id = created["id"].as_i64().unwrap();

    let body: serde_json::Value = client
        .post(format!("http://{addr}/api/versions/{id}/restore"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["restored_from"], id);
    assert_eq!(body["room_id"], "r1");
    assert_eq!(body["content"], "the good state");
    assert_ne!(body["new_version"], id);

    let fetched: serde_json::Value = client
        .get(format!("http://{addr}/api/versions/{}", body["new_version"]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["name"], "Restored from: Checkpoint");
    assert_eq!(fetched["is_auto"], false);
}
