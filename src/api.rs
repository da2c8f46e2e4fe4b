//! HTTP endpoints and the WebSocket upgrade route.
//!
//! JSON in, JSON out. Absent entities map to 404, malformed bodies to
//! 400, store failures to 500; method mismatches fall out of axum's
//! method routing as 405.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::hub::Hub;
use crate::protocol::MAX_FRAME_SIZE;
use crate::ratelimit::ClientLimiters;
use crate::session;
use crate::store::{Store, Version};
use crate::versions::{CreateVersionParams, VersionError, VersionService};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub store: Arc<Store>,
    pub versions: VersionService,
    pub limiters: Arc<ClientLimiters>,
}

impl AppState {
    pub fn new(hub: Hub, store: Arc<Store>) -> Self {
        Self {
            hub,
            versions: VersionService::new(store.clone()),
            store,
            limiters: Arc::new(ClientLimiters::with_defaults()),
        }
    }
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/rooms/:id", get(get_room).delete(delete_room))
        .route("/api/versions", get(list_versions).post(create_version))
        .route("/api/versions/diff", get(diff_versions))
        .route("/api/versions/:id", get(get_version).delete(delete_version))
        .route("/api/versions/:id/restore", post(restore_version))
        .with_state(state)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

// ─── Health & stats ───────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut body = json!({
        "active_rooms": state.hub.active_room_count().await,
        "active_clients": state.hub.client_count().await,
        "timestamp": Utc::now().to_rfc3339(),
    });

    if let Ok(store_stats) = state.store.stats() {
        body["total_rooms"] = json!(store_stats.room_count);
        body["total_updates"] = json!(store_stats.update_count);
    }

    Json(body)
}

// ─── WebSocket upgrade ────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsQuery {
    room: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let room_id = query
        .room
        .filter(|room| !room.is_empty())
        .unwrap_or_else(|| "default".to_string());
    let client_key = format!("{addr}-{}", Uuid::new_v4());

    ws.max_message_size(MAX_FRAME_SIZE)
        .write_buffer_size(4 * 1024)
        .on_upgrade(move |socket| {
            session::serve_socket(socket, room_id, client_key, state.hub, state.limiters)
        })
}

// ─── Rooms ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RoomResponse {
    id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    active_users: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    update_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

fn clamp_page(query: &PageQuery, default_limit: u32) -> (u32, u32) {
    let limit = match query.limit {
        Some(limit) if limit > 0 && limit <= 100 => limit as u32,
        _ => default_limit,
    };
    let offset = match query.offset {
        Some(offset) if offset > 0 => offset as u32,
        _ => 0,
    };
    (limit, offset)
}

async fn list_rooms(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Response {
    let (limit, offset) = clamp_page(&query, 20);

    let rooms = match state.store.list_rooms(limit, offset) {
        Ok(rooms) => rooms,
        Err(e) => {
            log::error!("Failed to list rooms: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list rooms");
        }
    };

    let active = state.hub.active_rooms().await;
    let response: Vec<RoomResponse> = rooms
        .into_iter()
        .map(|room| RoomResponse {
            active_users: active.get(&room.id).copied().unwrap_or(0),
            id: room.id,
            name: room.name,
            created_at: room.created_at,
            updated_at: room.updated_at,
            update_count: None,
        })
        .collect();

    Json(json!({ "rooms": response, "limit": limit, "offset": offset })).into_response()
}

async fn create_room(
    State(state): State<AppState>,
    body: Result<Json<CreateRoomRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
    };

    if request.id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Room ID is required");
    }

    if let Err(e) = state.store.create_room_if_absent(&request.id, &request.name) {
        log::error!("Failed to create room {}: {e}", request.id);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create room");
    }

    match state.store.get_room(&request.id) {
        Ok(Some(room)) => (
            StatusCode::CREATED,
            Json(RoomResponse {
                id: room.id,
                name: room.name,
                created_at: room.created_at,
                updated_at: room.updated_at,
                active_users: 0,
                update_count: None,
            }),
        )
            .into_response(),
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get room"),
    }
}

async fn get_room(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let room = match state.store.get_room(&id) {
        Ok(Some(room)) => room,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Room not found"),
        Err(e) => {
            log::error!("Failed to get room {id}: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get room");
        }
    };

    let update_count = state.store.count_updates(&id).unwrap_or(0);
    let active = state.hub.active_rooms().await;

    Json(RoomResponse {
        active_users: active.get(&room.id).copied().unwrap_or(0),
        id: room.id,
        name: room.name,
        created_at: room.created_at,
        updated_at: room.updated_at,
        update_count: Some(update_count),
    })
    .into_response()
}

async fn delete_room(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if let Err(e) = state.store.delete_room(&id) {
        log::error!("Failed to delete room {id}: {e}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete room");
    }
    Json(json!({ "message": "Room deleted" })).into_response()
}

// ─── Versions ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct VersionResponse {
    id: i64,
    room_id: String,
    name: String,
    description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    content: String,
    content_hash: String,
    created_by: String,
    created_at: DateTime<Utc>,
    is_auto: bool,
}

impl From<Version> for VersionResponse {
    fn from(v: Version) -> Self {
        Self {
            id: v.id,
            room_id: v.room_id,
            name: v.name,
            description: v.description,
            content: v.content,
            content_hash: v.content_hash,
            created_by: v.created_by,
            created_at: v.created_at,
            is_auto: v.is_auto,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateVersionRequest {
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    created_by: String,
    #[serde(default)]
    is_auto: bool,
}

#[derive(Debug, Deserialize)]
struct ListVersionsQuery {
    room_id: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

fn version_error_response(e: VersionError, action: &str) -> Response {
    match e {
        VersionError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Version not found"),
        VersionError::Store(e) => {
            log::error!("Failed to {action}: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("Failed to {action}"))
        }
    }
}

async fn list_versions(
    State(state): State<AppState>,
    Query(query): Query<ListVersionsQuery>,
) -> Response {
    let Some(room_id) = query.room_id.filter(|room| !room.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "room_id is required");
    };

    let (limit, offset) = clamp_page(
        &PageQuery {
            limit: query.limit,
            offset: query.offset,
        },
        50,
    );

    match state.versions.list(&room_id, limit, offset) {
        Ok((versions, total)) => {
            let response: Vec<VersionResponse> =
                versions.into_iter().map(VersionResponse::from).collect();
            Json(json!({
                "versions": response,
                "total": total,
                "limit": limit,
                "offset": offset,
            }))
            .into_response()
        }
        Err(e) => version_error_response(e, "list versions"),
    }
}

async fn create_version(
    State(state): State<AppState>,
    body: Result<Json<CreateVersionRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
    };

    if request.room_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "room_id is required");
    }
    if request.content.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "content is required");
    }

    let outcome = match state.versions.create(CreateVersionParams {
        room_id: request.room_id,
        name: request.name,
        description: request.description,
        content: request.content,
        created_by: request.created_by,
        is_auto: request.is_auto,
    }) {
        Ok(outcome) => outcome,
        Err(e) => return version_error_response(e, "create version"),
    };

    // Dedup hit returns the existing row with 200 rather than 201
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let mut response = VersionResponse::from(outcome.version);
    response.content = String::new();
    (status, Json(response)).into_response()
}

async fn get_version(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.versions.get(id) {
        Ok(version) => Json(VersionResponse::from(version)).into_response(),
        Err(e) => version_error_response(e, "get version"),
    }
}

async fn delete_version(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.versions.delete(id) {
        Ok(()) => Json(json!({ "message": "Version deleted" })).into_response(),
        Err(e) => version_error_response(e, "delete version"),
    }
}

#[derive(Debug, Deserialize)]
struct DiffQuery {
    from: Option<i64>,
    to: Option<i64>,
}

#[derive(Debug, Serialize)]
struct DiffVersionMeta {
    id: i64,
    name: String,
    content_hash: String,
    created_at: DateTime<Utc>,
}

impl From<&Version> for DiffVersionMeta {
    fn from(v: &Version) -> Self {
        Self {
            id: v.id,
            name: v.name.clone(),
            content_hash: v.content_hash.clone(),
            created_at: v.created_at,
        }
    }
}

async fn diff_versions(
    State(state): State<AppState>,
    Query(query): Query<DiffQuery>,
) -> Response {
    let Some(from_id) = query.from else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid 'from' version ID");
    };
    let Some(to_id) = query.to else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid 'to' version ID");
    };

    match state.versions.diff(from_id, to_id) {
        Ok((from, to, diff)) => Json(json!({
            "from": DiffVersionMeta::from(&from),
            "to": DiffVersionMeta::from(&to),
            "diff": diff,
        }))
        .into_response(),
        Err(e) => version_error_response(e, "diff versions"),
    }
}

async fn restore_version(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.versions.restore(id) {
        Ok(outcome) => Json(json!({
            "message": "Version restored",
            "restored_from": outcome.restored_from,
            "new_version": outcome.new_version.id,
            "room_id": outcome.room_id,
            "content": outcome.content,
        }))
        .into_response(),
        Err(e) => version_error_response(e, "restore version"),
    }
}
