//! REST endpoint handlers.
//!
//! Every handler except [`health`] authenticates its caller through the
//! [`Caller`] extractor and forwards to the [`DispatchCoordinator`]. Errors
//! are returned as [`ApiError`] and rendered by its `IntoResponse` impl.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness and connection counts |
//! | `GET` | `/api/providers/me` | Caller's provider profile |
//! | `PUT` | `/api/providers/me` | Create or update the provider profile |
//! | `PUT` | `/api/providers/me/status` | Go on or off shift |
//! | `GET` | `/api/providers/nearby` | Candidates and price range for an origin |
//! | `GET` | `/api/requesters/me` | Caller's requester profile |
//! | `PUT` | `/api/requesters/me` | Create or update the requester profile |
//! | `POST` | `/api/requests` | Open a request |
//! | `GET` | `/api/requests/{id}` | Fetch a request |
//! | `POST` | `/api/requests/{id}/accept` | Provider accepts |
//! | `POST` | `/api/requests/{id}/reject` | Provider declines or backs out |
//! | `POST` | `/api/requests/{id}/cancel` | Requester withdraws |
//! | `GET` | `/api/sessions/active` | Caller's live session |
//! | `GET` | `/api/sessions/history` | Caller's sessions, newest first |
//! | `GET` | `/api/sessions/{id}` | Session detail |
//! | `POST` | `/api/sessions/{id}/start` | Provider sets off |
//! | `POST` | `/api/sessions/{id}/arrived` | Provider arrived |
//! | `POST` | `/api/sessions/{id}/complete` | Either party completes |
//! | `POST` | `/api/sessions/{id}/cancel` | Either party cancels |
//! | `POST` | `/api/sessions/{id}/payment` | Record payment details |
//! | `POST` | `/api/sessions/{id}/chat` | Post a chat line |
//! | `POST` | `/api/sessions/{id}/location` | Provider position report |
//!
//! [`DispatchCoordinator`]: carelink_core::DispatchCoordinator

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use carelink_core::{LocationOutcome, RejectOutcome};
use carelink_types::{
    AvailabilityUpdate, ChatMessage, ChatText, LocationReport, NearbyProviders, NearbyQuery,
    NewRequest, PaymentUpdate, ProviderProfile, ProviderRegistration, Request, RequestId,
    RequesterProfile, RequesterRegistration, Session, SessionId,
};

use crate::auth::Caller;
use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Liveness probe with a few counters. Reports `degraded` when the store
/// does not answer.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = state.dispatch.store().is_reachable().await;
    Json(serde_json::json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "connected": state.presence.connected_count(),
        "pending_requests": state.dispatch.pending_count(),
        "live_sessions": state.dispatch.sessions().cached_count(),
        "store": state.dispatch.store().backend(),
        "started_at": state.started_at,
    }))
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// `GET /api/providers/me`
pub async fn get_provider_profile(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<Json<ProviderProfile>, ApiError> {
    let id = caller.provider()?;
    Ok(Json(state.dispatch.provider(id).await?))
}

/// `PUT /api/providers/me`
pub async fn put_provider_profile(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(body): Json<ProviderRegistration>,
) -> Result<Json<ProviderProfile>, ApiError> {
    let id = caller.provider()?;
    Ok(Json(state.dispatch.register_provider(id, body).await?))
}

/// `PUT /api/providers/me/status`
pub async fn put_provider_status(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(body): Json<AvailabilityUpdate>,
) -> Result<Json<ProviderProfile>, ApiError> {
    let id = caller.provider()?;
    Ok(Json(state.dispatch.set_availability(id, body.status).await?))
}

/// `GET /api/requesters/me`
pub async fn get_requester_profile(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<Json<RequesterProfile>, ApiError> {
    let id = caller.requester()?;
    Ok(Json(state.dispatch.requester(id).await?))
}

/// `PUT /api/requesters/me`
pub async fn put_requester_profile(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(body): Json<RequesterRegistration>,
) -> Result<Json<RequesterProfile>, ApiError> {
    let id = caller.requester()?;
    Ok(Json(state.dispatch.register_requester(id, body).await?))
}

/// `GET /api/providers/nearby?latitude=..&longitude=..&serviceType=..`
pub async fn nearby_providers(
    State(state): State<Arc<AppState>>,
    _caller: Caller,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<NearbyProviders>, ApiError> {
    let nearby = state
        .dispatch
        .nearby_providers(query.origin(), query.service_type.as_deref())
        .await?;
    Ok(Json(nearby))
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// `POST /api/requests`
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(body): Json<NewRequest>,
) -> Result<(StatusCode, Json<Request>), ApiError> {
    let requester = caller.requester()?;
    let request = state.dispatch.create_request(requester, body).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// `GET /api/requests/{id}`
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<RequestId>,
) -> Result<Json<Request>, ApiError> {
    Ok(Json(state.dispatch.get_request(id, caller.0).await?))
}

/// `POST /api/requests/{id}/accept`
pub async fn accept_request(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<RequestId>,
) -> Result<Json<Session>, ApiError> {
    let provider = caller.provider()?;
    Ok(Json(state.dispatch.accept(id, provider).await?))
}

/// `POST /api/requests/{id}/reject`
pub async fn reject_request(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<RequestId>,
) -> Result<Json<RejectOutcome>, ApiError> {
    let provider = caller.provider()?;
    Ok(Json(state.dispatch.reject(id, provider).await?))
}

/// `POST /api/requests/{id}/cancel`
pub async fn cancel_request(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<RequestId>,
) -> Result<Json<Request>, ApiError> {
    let requester = caller.requester()?;
    Ok(Json(state.dispatch.cancel_request(id, requester).await?))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// `GET /api/sessions/active`
///
/// Returns `null` when the caller has no live session.
pub async fn active_session(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<Json<Option<Session>>, ApiError> {
    Ok(Json(state.dispatch.active_session_for(caller.0).await?))
}

/// `GET /api/sessions/history`
pub async fn session_history(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sessions = state.dispatch.session_history_for(caller.0).await?;
    Ok(Json(serde_json::json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

/// `GET /api/sessions/{id}`
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<SessionId>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.dispatch.get_session(id, caller.0).await?))
}

/// `POST /api/sessions/{id}/start`
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<SessionId>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.dispatch.start_progress(id, caller.0).await?))
}

/// `POST /api/sessions/{id}/arrived`
pub async fn arrive_session(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<SessionId>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.dispatch.mark_arrived(id, caller.0).await?))
}

/// `POST /api/sessions/{id}/complete`
pub async fn complete_session(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<SessionId>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.dispatch.complete(id, caller.0).await?))
}

/// `POST /api/sessions/{id}/cancel`
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<SessionId>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.dispatch.cancel(id, caller.0).await?))
}

/// `POST /api/sessions/{id}/payment`
pub async fn update_payment(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<SessionId>,
    Json(body): Json<PaymentUpdate>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.dispatch.update_payment(id, caller.0, &body).await?))
}

/// `POST /api/sessions/{id}/chat`
pub async fn post_chat(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<SessionId>,
    Json(body): Json<ChatText>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let message = state
        .dispatch
        .post_chat(id, caller.0, None, &body.text)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// `POST /api/sessions/{id}/location`
///
/// The path names the session; any `sessionId` in the body is ignored.
pub async fn post_location(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<SessionId>,
    Json(body): Json<LocationReport>,
) -> Result<Json<LocationOutcome>, ApiError> {
    let provider = caller.provider()?;
    let report = LocationReport {
        session_id: Some(id),
        ..body
    };
    Ok(Json(state.dispatch.update_location(provider, &report).await?))
}
