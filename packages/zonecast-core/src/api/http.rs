//! HTTP route handlers.
//!
//! Handlers are thin; the engines own every decision.

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::broker::broker_ws_handler;
use crate::api::mic::mic_ws_handler;
use crate::api::response::api_success;
use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::ZonecastResult;
use crate::protocol_constants::SERVICE_ID;
use crate::types::ZoneId;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let trusted_origins = state.config.trusted_origins.clone();
    log::info!("CORS trusted origins: {:?}", trusted_origins);

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let origin_str = origin.to_str().unwrap_or("");
            trusted_origins
                .iter()
                .any(|allowed| origin_str.starts_with(allowed.as_str()))
        }))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(false);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/state", get(get_current_state))
        .route("/api/zones/{zone}/status", get(request_zone_status))
        .route("/ws", get(ws_handler))
        .route("/ws/mic", get(mic_ws_handler))
        .route("/ws/broker", get(broker_ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    api_success(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "version": env!("CARGO_PKG_VERSION"),
        "zones": state.zones.zone_count(),
        "playback": state.arbiter.active_mode(),
        "brokerConnected": state.broker.is_connected(),
        "connections": state.ws_manager.counts(),
    }))
}

async fn get_current_state(State(state): State<AppState>) -> impl IntoResponse {
    api_success(json!({
        "zones": state.zones.zones(),
        "playback": state.arbiter.status(),
    }))
}

/// Asks a zone for its status over the broker and waits for the reply.
async fn request_zone_status(
    State(state): State<AppState>,
    Path(zone): Path<ZoneId>,
) -> ZonecastResult<impl IntoResponse> {
    let frame = state.zones.request_status(zone).await?;
    Ok(api_success(frame))
}
