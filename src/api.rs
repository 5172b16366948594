//! JSON-over-HTTP surface of the console.
//!
//! Handlers are thin: they validate the request shape, call into the
//! registry, image manager or orchestrator, and serialize the result.
//! Errors become `{detail}` bodies with the status code of their kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::devices::{DeviceRegistry, SystemProbe};
use crate::error::{ConsoleError, Result};
use crate::flash::{AdbDeviceControl, FlashOrchestrator, OrchestratorSettings};
use crate::images::{HttpImageSource, ImageDownloadManager, StartOutcome, validate_filename};
use crate::models::{Device, DownloadTask, FlashSession, OsImage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicesResponse {
    pub devices: Vec<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OsCheckQuery {
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsCheckResponse {
    pub available: bool,
    pub filename: String,
}

/// Body of the status endpoint when the device has no session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleStatus {
    pub state: String,
    pub progress: u8,
    pub message: String,
}

impl Default for IdleStatus {
    fn default() -> Self {
        Self {
            state: "idle".to_string(),
            progress: 0,
            message: "No flash operation in progress".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub sessions: Vec<FlashSession>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagesResponse {
    pub images: Vec<OsImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub already_exists: bool,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<DownloadTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub downloads: BTreeMap<String, DownloadTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request rejected ({}): {}", status, self);
        }
        (status, Json(ErrorBody { detail: self.to_string() })).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub images: ImageDownloadManager,
    pub orchestrator: FlashOrchestrator,
    /// Image used when a request does not name one
    pub default_image: String,
}

impl AppState {
    /// Wire the production components from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let registry = Arc::new(DeviceRegistry::new(Arc::new(SystemProbe::new(
            &settings.lsusb_path,
            &settings.adb_path,
        ))));

        let source = Arc::new(HttpImageSource::from_settings(settings));
        let mut images =
            ImageDownloadManager::new(&settings.cache_dir, source, settings.stall_timeout());
        if let Some(sha256) = &settings.image_sha256 {
            images = images.with_checksum(settings.image_filename(), sha256);
        }

        let backend = Arc::new(AdbDeviceControl::new(
            &settings.adb_path,
            settings.recovery_timeout(),
        ));
        let orchestrator = FlashOrchestrator::new(
            Arc::clone(&registry),
            images.clone(),
            backend,
            OrchestratorSettings::from_settings(settings),
        );

        Self {
            registry,
            images,
            orchestrator,
            default_image: settings.image_filename(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/os/check", get(check_os))
        .route("/api/devices/{id}/flash/prepare", post(prepare_flash))
        .route("/api/devices/{id}/flash/confirm", post(confirm_flash))
        .route("/api/devices/{id}/flash/status", get(flash_status))
        .route("/api/devices/{id}/flash/close", post(close_flash))
        .route("/api/flash/history", get(flash_history))
        .route("/api/os/list", get(list_images))
        .route("/api/os/download", post(start_download))
        .route("/api/os/download/progress", get(download_progress))
        .route("/api/os/delete/{filename}", delete(delete_image))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

async fn list_devices(State(state): State<AppState>) -> Json<DevicesResponse> {
    let mut devices = state.registry.list();
    state.orchestrator.annotate(&mut devices);
    Json(DevicesResponse {
        devices,
        error: state.registry.last_error(),
    })
}

async fn check_os(
    State(state): State<AppState>,
    Query(query): Query<OsCheckQuery>,
) -> Result<Json<OsCheckResponse>> {
    let filename = query.filename.unwrap_or_else(|| state.default_image.clone());
    validate_filename(&filename)?;
    Ok(Json(OsCheckResponse {
        available: state.images.is_cached(&filename),
        filename,
    }))
}

async fn prepare_flash(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlashSession>> {
    Ok(Json(state.orchestrator.prepare(&id).await?))
}

async fn confirm_flash(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlashSession>> {
    Ok(Json(state.orchestrator.confirm(&id)?))
}

async fn flash_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.status(&id) {
        Some(session) => Json(session).into_response(),
        None => Json(IdleStatus::default()).into_response(),
    }
}

async fn close_flash(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlashSession>> {
    Ok(Json(state.orchestrator.close(&id)?))
}

async fn flash_history(State(state): State<AppState>) -> Json<HistoryResponse> {
    Json(HistoryResponse {
        sessions: state.orchestrator.history(),
    })
}

async fn list_images(State(state): State<AppState>) -> Result<Json<ImagesResponse>> {
    Ok(Json(ImagesResponse {
        images: state.images.list()?,
    }))
}

async fn start_download(State(state): State<AppState>, body: Bytes) -> Result<Json<DownloadResponse>> {
    // An empty body means "the configured image"
    let request: DownloadRequest = if body.iter().all(u8::is_ascii_whitespace) {
        DownloadRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ConsoleError::Validation(format!("Invalid request body: {}", e)))?
    };
    let filename = request
        .filename
        .unwrap_or_else(|| state.default_image.clone());

    let outcome = state.images.start_download(&filename)?;
    Ok(Json(DownloadResponse {
        already_exists: matches!(outcome, StartOutcome::AlreadyExists),
        task: outcome.snapshot(),
        filename,
    }))
}

async fn download_progress(State(state): State<AppState>) -> Json<ProgressResponse> {
    Json(ProgressResponse {
        downloads: state.images.progress(),
    })
}

async fn delete_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<DeleteResponse>> {
    state.images.delete(&filename)?;
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("Deleted {filename}"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(error: ConsoleError) -> (StatusCode, ErrorBody) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn errors_render_detail_with_their_status() {
        let (status, body) = body_of(ConsoleError::Validation("USB debugging must be enabled first".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.detail, "USB debugging must be enabled first");

        let (status, _) = body_of(ConsoleError::StateConflict("busy".into())).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = body_of(ConsoleError::Config("Lineage OS URL not configured".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.detail, "Lineage OS URL not configured");

        let (status, _) = body_of(ConsoleError::Transfer("Failed to download: HTTP 404".into())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn idle_status_matches_the_wire_shape() {
        let value = serde_json::to_value(IdleStatus::default()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "state": "idle",
                "progress": 0,
                "message": "No flash operation in progress"
            })
        );
    }

    #[test]
    fn download_request_filename_is_optional() {
        let request: DownloadRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.filename, None);
        let request: DownloadRequest = serde_json::from_str(r#"{"filename":"lineage-21.zip"}"#).unwrap();
        assert_eq!(request.filename.as_deref(), Some("lineage-21.zip"));
    }
}
