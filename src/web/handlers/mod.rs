pub mod pipeline;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::mjpeg::BOUNDARY;
use crate::video::SessionStatus;

// ============================================================================
// Health & Info
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Slot listing
#[derive(Serialize)]
pub struct ServerInfo {
    pub message: &'static str,
    pub status: &'static str,
    pub cameras: Vec<SessionStatus>,
}

/// List populated camera slots
/// GET /
pub async fn server_info(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(ServerInfo {
        message: "Multi-camera streaming server",
        status: "running",
        cameras: state.server.slot_list(),
    })
}

// ============================================================================
// Camera control
// ============================================================================

/// Per-slot status
/// GET /status/:index
pub async fn camera_status(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<SessionStatus>> {
    Ok(Json(state.server.status(index)?))
}

#[derive(Serialize)]
pub struct ReconnectResponse {
    pub camera_id: usize,
    pub status: &'static str,
}

/// Trigger a background reconnect; does not wait for the outcome
/// POST /reconnect/:index
pub async fn camera_reconnect(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<impl IntoResponse> {
    state.server.trigger_reconnect(index)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ReconnectResponse {
            camera_id: index,
            status: "reconnecting",
        }),
    ))
}

#[derive(Serialize)]
pub struct DiscoverResponse {
    pub message: &'static str,
    pub cameras: Vec<SessionStatus>,
}

/// Re-run discovery and fill empty slots
/// GET /discover
pub async fn discover(State(state): State<Arc<AppState>>) -> Result<Json<DiscoverResponse>> {
    let cameras = state.rediscover().await?;
    Ok(Json(DiscoverResponse {
        message: "Discovery complete",
        cameras,
    }))
}

// ============================================================================
// MJPEG
// ============================================================================

fn camera_status_header(connected: bool) -> &'static str {
    if connected {
        "connected"
    } else {
        "disconnected"
    }
}

/// Multipart MJPEG stream for one camera
/// GET /camera/:index
pub async fn camera_stream(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Response> {
    let session = state.server.session(index)?;
    let connected = session.is_connected();
    let body_stream = state.multiplexer.viewer_stream(session);

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .header("X-Camera-Status", camera_status_header(connected))
        .body(Body::from_stream(body_stream))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Single JPEG: latest frame or the placeholder
/// GET /snapshot/:index
pub async fn camera_snapshot(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Response> {
    let session = state.server.session(index)?;
    let image = state
        .multiplexer
        .current_image(&session)
        .ok_or_else(|| AppError::Internal(format!("No image available for camera {}", index)))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/jpeg")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Camera-Status", camera_status_header(session.is_connected()))
        .body(Body::from(image))
        .map_err(|e| AppError::Internal(e.to_string()))
}
