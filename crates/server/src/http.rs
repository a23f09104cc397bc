//! HTTP surface: session creation, WebSocket upgrade, WebRTC signaling,
//! health and metrics.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use dhwani_transport::{Transport, WebRtcConfig, WebRtcTransport};

use crate::session::spawn_bridge;
use crate::state::AppState;
use crate::websocket::ws_handler;

#[derive(Serialize)]
struct SessionCreated {
    session_id: String,
}

#[derive(Deserialize)]
struct OfferRequest {
    sdp: String,
}

#[derive(Serialize)]
struct AnswerResponse {
    sdp: String,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/sessions", post(create_session))
        .route("/ws/:session_id", get(ws_handler))
        .route("/webrtc/:session_id/offer", post(webrtc_offer))
        .layer(TraceLayer::new_for_http())
        // CORS policy is a deployment concern; permissive here, replace at
        // the edge.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

async fn create_session(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionCreated>, StatusCode> {
    if !state.rate_limiter.try_acquire() {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    let session = state
        .sessions
        .create(&state)
        .map_err(|e| {
            tracing::error!("session creation failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(SessionCreated {
        session_id: session.id.clone(),
    }))
}

/// SDP offer/answer exchange; on success the WebRTC transport is bridged
/// into the session pipeline.
async fn webrtc_offer(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(offer): Json<OfferRequest>,
) -> Result<Json<AnswerResponse>, StatusCode> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or(StatusCode::NOT_FOUND)?;

    let transport = WebRtcTransport::accept(&WebRtcConfig::default(), &offer.sdp)
        .await
        .map_err(|e| {
            tracing::warn!("webrtc accept failed: {}", e);
            StatusCode::BAD_REQUEST
        })?;

    let answer = transport
        .answer_sdp()
        .await
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
    let _ = transport
        .send_event(&dhwani_transport::ControlEvent::SessionInfo {
            session_id: session.id.clone(),
        })
        .await;
    spawn_bridge(session, transport);

    Ok(Json(AnswerResponse { sdp: answer }))
}
