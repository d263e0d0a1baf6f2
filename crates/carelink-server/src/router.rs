//! Axum router construction.
//!
//! Assembles the REST and `WebSocket` routes into a single [`Router`] with
//! CORS and request tracing.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete router.
///
/// See [`handlers`] for the endpoint table. CORS allows any origin so the
/// web client can be served from elsewhere.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        // WebSocket
        .route("/ws", get(ws::ws_connect))
        // Profiles
        .route(
            "/api/providers/me",
            get(handlers::get_provider_profile).put(handlers::put_provider_profile),
        )
        .route("/api/providers/me/status", put(handlers::put_provider_status))
        .route("/api/providers/nearby", get(handlers::nearby_providers))
        .route(
            "/api/requesters/me",
            get(handlers::get_requester_profile).put(handlers::put_requester_profile),
        )
        // Requests
        .route("/api/requests", post(handlers::create_request))
        .route("/api/requests/{id}", get(handlers::get_request))
        .route("/api/requests/{id}/accept", post(handlers::accept_request))
        .route("/api/requests/{id}/reject", post(handlers::reject_request))
        .route("/api/requests/{id}/cancel", post(handlers::cancel_request))
        // Sessions
        .route("/api/sessions/active", get(handlers::active_session))
        .route("/api/sessions/history", get(handlers::session_history))
        .route("/api/sessions/{id}", get(handlers::get_session))
        .route("/api/sessions/{id}/start", post(handlers::start_session))
        .route("/api/sessions/{id}/arrived", post(handlers::arrive_session))
        .route("/api/sessions/{id}/complete", post(handlers::complete_session))
        .route("/api/sessions/{id}/cancel", post(handlers::cancel_session))
        .route("/api/sessions/{id}/payment", post(handlers::update_payment))
        .route("/api/sessions/{id}/chat", post(handlers::post_chat))
        .route("/api/sessions/{id}/location", post(handlers::post_location))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
