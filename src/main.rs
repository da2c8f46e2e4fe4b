//! Lattice server binary: store, hub, compactor, HTTP/WS listener.

use std::net::SocketAddr;
use std::sync::Arc;

use lattice_collab::ratelimit;
use lattice_collab::{router, AppState, CompactionConfig, Compactor, Hub, Store};

#[tokio::main]
async fn main() {
    env_logger::init();

    let db_path =
        std::env::var("LATTICE_DB_PATH").unwrap_or_else(|_| "./data/lattice.db".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let store = match Store::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("Failed to initialize store at {db_path}: {e}");
            std::process::exit(1);
        }
    };

    let (hub, scheduler) = Hub::new(Some(store.clone()));
    tokio::spawn(scheduler.run());

    let compactor = Compactor::new(store.clone(), CompactionConfig::default());
    let compactor_task = compactor.start();

    let state = AppState::new(hub.clone(), store);

    // Periodic flush of the per-client limiter map
    let limiters = state.limiters.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ratelimit::SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let dropped = limiters.sweep();
            if dropped > 0 {
                log::info!("Rate limiter sweep dropped {dropped} entries");
            }
        }
    });

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    log::info!("Lattice server listening on :{port}");
    log::info!("Database: {db_path}");
    log::info!("Endpoints:");
    log::info!("  - WebSocket: /ws?room={{roomId}}");
    log::info!("  - Health:    GET /health");
    log::info!("  - Stats:     GET /api/stats");
    log::info!("  - Rooms:     GET/POST /api/rooms, GET/DELETE /api/rooms/{{id}}");
    log::info!("  - Versions:  GET/POST /api/versions, GET/DELETE /api/versions/{{id}}");
    log::info!("  - Diff:      GET /api/versions/diff?from=X&to=Y");
    log::info!("  - Restore:   POST /api/versions/{{id}}/restore");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Shutting down server...");
    })
    .await;

    if let Err(e) = result {
        log::error!("Server error: {e}");
    }

    compactor.stop();
    let _ = compactor_task.await;
    hub.stop().await;
}
