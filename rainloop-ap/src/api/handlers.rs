//! HTTP request handlers

use crate::api::AppContext;
use crate::error::Error;
use crate::playback::{EngineReport, HostVisibility, MixerState, PlayOutcome};
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
    port: u16,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeBody {
    /// 0.0-1.0; out-of-range values are clamped by the engine
    volume: f32,
}

#[derive(Debug, Serialize)]
pub struct PlayResponse {
    outcome: PlayOutcome,
    state: MixerState,
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    visible: bool,
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    devices: Vec<String>,
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn api_error(status: StatusCode, e: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(StatusResponse {
            status: format!("error: {}", e),
        }),
    )
}

fn engine_error(e: Error) -> ApiError {
    error!("Engine request failed: {}", e);
    let status = match e {
        Error::EngineClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e)
}

fn ok() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
    })
}

// ============================================================================
// Health
// ============================================================================

/// GET /health
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "rainloop-ap".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        port: ctx.port,
    })
}

// ============================================================================
// Transport
// ============================================================================

/// GET /playback/state
pub async fn get_state(State(ctx): State<AppContext>) -> Json<MixerState> {
    Json(ctx.engine.state())
}

/// POST /playback/play
///
/// A host refusal is not an HTTP error: the response carries
/// `"outcome": "rejected"` and the client may retry after a user gesture.
pub async fn play(State(ctx): State<AppContext>) -> Result<Json<PlayResponse>, ApiError> {
    let outcome = ctx.engine.play().await.map_err(engine_error)?;
    info!("Play requested: {:?}", outcome);
    Ok(Json(PlayResponse {
        outcome,
        state: ctx.engine.state(),
    }))
}

/// POST /playback/pause
pub async fn pause(State(ctx): State<AppContext>) -> Result<Json<StatusResponse>, ApiError> {
    ctx.engine.pause().await.map_err(engine_error)?;
    info!("Pause requested");
    Ok(ok())
}

/// POST /playback/stop
pub async fn stop(State(ctx): State<AppContext>) -> Result<Json<StatusResponse>, ApiError> {
    ctx.engine.stop().await.map_err(engine_error)?;
    info!("Stop requested");
    Ok(ok())
}

// ============================================================================
// Volume and devices
// ============================================================================

/// GET /audio/volume - smoothed level currently applied
pub async fn get_volume(State(ctx): State<AppContext>) -> Json<VolumeBody> {
    Json(VolumeBody {
        volume: ctx.engine.state().volume,
    })
}

/// POST /audio/volume
pub async fn set_volume(
    State(ctx): State<AppContext>,
    Json(req): Json<VolumeBody>,
) -> Result<Json<VolumeBody>, ApiError> {
    if !req.volume.is_finite() {
        return Err(api_error(StatusCode::BAD_REQUEST, "volume must be a finite number"));
    }
    let volume = req.volume.clamp(0.0, 1.0);
    ctx.engine.set_volume(volume).await.map_err(engine_error)?;
    Ok(Json(VolumeBody { volume }))
}

/// GET /audio/devices
pub async fn list_audio_devices() -> Result<Json<DeviceListResponse>, ApiError> {
    let devices = tokio::task::spawn_blocking(crate::audio::output::list_devices)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .map_err(|e| {
            error!("Failed to list audio devices: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        })?;
    Ok(Json(DeviceListResponse { devices }))
}

// ============================================================================
// Host integration
// ============================================================================

/// POST /host/visibility
pub async fn set_visibility(
    State(ctx): State<AppContext>,
    Json(req): Json<VisibilityRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    ctx.engine
        .notify_visibility(HostVisibility::from_visible(req.visible))
        .await
        .map_err(engine_error)?;
    Ok(ok())
}

/// GET /diagnostics
pub async fn diagnostics(State(ctx): State<AppContext>) -> Result<Json<EngineReport>, ApiError> {
    let report = ctx.engine.report().await.map_err(engine_error)?;
    Ok(Json(report))
}
