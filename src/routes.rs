use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::{
    client::{
        bridge::{verify_bridge_signature, BridgeEnvelope, SIGNATURE_HEADER},
        BridgeEventRouter,
    },
    error::AppError,
    manager::SessionManager,
    types::{now_iso, Contact, NewContact, PairingResponse, ResendResponse, SessionStatus},
};

pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// Present only when sessions run on the HTTP bridge.
    pub bridge_events: Option<Arc<BridgeEventRouter>>,
    pub bridge_secret: String,
    pub api_token: Option<String>,
}

pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tenants/{tenant_id}/pairing", post(start_pairing))
        .route(
            "/api/tenants/{tenant_id}/session",
            get(get_session).delete(disconnect_session),
        )
        .route("/api/tenants/{tenant_id}/resend", post(resend_pending))
        .route("/api/tenants/{tenant_id}/contacts", post(ingest_contact))
        .route("/api/bridge/events", post(bridge_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "now": now_iso(),
        "sessions": state.manager.registry().len(),
    }))
}

async fn start_pairing(
    Path(tenant_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PairingResponse>, AppError> {
    authorize(&state, &headers)?;
    let response = state.manager.start_pairing(&tenant_id).await?;
    Ok(Json(response))
}

async fn get_session(
    Path(tenant_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SessionStatus>, AppError> {
    authorize(&state, &headers)?;
    Ok(Json(state.manager.get_status(&tenant_id)?))
}

async fn disconnect_session(
    Path(tenant_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SessionStatus>, AppError> {
    authorize(&state, &headers)?;
    Ok(Json(state.manager.disconnect(&tenant_id).await?))
}

async fn resend_pending(
    Path(tenant_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ResendResponse>, AppError> {
    authorize(&state, &headers)?;
    Ok(Json(state.manager.resend_pending(&tenant_id).await?))
}

async fn ingest_contact(
    Path(tenant_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<NewContact>, JsonRejection>,
) -> Result<(StatusCode, Json<Contact>), AppError> {
    authorize(&state, &headers)?;
    let Json(contact) = payload.map_err(|rejection| AppError::InvalidRequest(rejection.body_text()))?;
    let stored = state.manager.ingest_contact(&tenant_id, contact).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn bridge_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(router) = state.bridge_events.as_ref() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "not_found",
                "message": "bridge callbacks are not enabled",
            })),
        )
            .into_response();
    };

    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !verify_bridge_signature(&state.bridge_secret, signature_header, &body) {
        warn!("rejected bridge callback with invalid signature");
        return AppError::Unauthorized.into_response();
    }

    let envelope = match serde_json::from_slice::<BridgeEnvelope>(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            return AppError::InvalidRequest(format!("invalid bridge event: {err}")).into_response()
        }
    };
    let session_id = envelope.session_id.clone();
    let routed = router.route(envelope);
    debug!(session_id = %session_id, routed, "bridge callback received");
    Json(json!({ "received": true, "routed": routed })).into_response()
}
