//! HTTP route definitions

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, Method, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::app::AppState;
use crate::game::RoomSummary;
use crate::util::time::uptime_secs;
use crate::ws::handler::{upgrade, ws_handler};

/// Body served on `/` to plain HTTP requests
pub const ROOT_BANNER: &str = "Game Server is Running!";

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rooms", get(rooms_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(state.config.client_origin.as_deref()))
        .with_state(state)
}

/// Permissive unless CLIENT_ORIGIN lists the allowed origins (comma-separated)
fn cors_layer(client_origin: Option<&str>) -> CorsLayer {
    let Some(origins) = client_origin else {
        return CorsLayer::permissive();
    };

    let allowed_origins: Vec<header::HeaderValue> = origins
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// WebSocket clients connect to the root path; everyone else gets a banner
async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    uri: Uri,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Some(ws) => upgrade(ws, &uri, state),
        None => ROOT_BANNER.into_response(),
    }
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_rooms: usize,
    active_players: usize,
    evicted_rooms: u64,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_rooms: state.registry.len(),
        active_players: state.registry.total_players(),
        evicted_rooms: state.registry.evictions(),
    })
}

// ============================================================================
// Room listing
// ============================================================================

async fn rooms_handler(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    let mut rooms: Vec<RoomSummary> = state
        .registry
        .rooms()
        .iter()
        .map(|room| room.summary())
        .collect();
    rooms.sort_by_key(|room| room.created_at_ms);
    Json(rooms)
}
