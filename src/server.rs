//! HTTP surface: routes that turn requests into conversion jobs.

use crate::error::ConversionError;
use crate::job::Conversion;
use crate::queue::{QueueStats, WorkQueue};
use crate::source::{ConversionSource, Format};
use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{error, info};

const UPLOAD_HEADER: &str = "x-weaver-upload";

/// Dependencies handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<WorkQueue>,
    pub auth_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(queue: Arc<WorkQueue>, auth_key: Option<String>) -> Self {
        Self {
            queue,
            auth_key: auth_key.map(Arc::from),
        }
    }

    fn authorize(&self, supplied: Option<&str>) -> Result<(), ApiError> {
        match &self.auth_key {
            Some(expected) if supplied != Some(expected.as_ref()) => Err(ApiError::Unauthorized),
            _ => Ok(()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stats", get(stats))
        .route("/convert", get(convert_by_url).post(convert_by_file))
        .with_state(state)
}

/// Errors returned by the HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Internal(String),
    Conversion(ConversionError),
}

impl From<ConversionError> for ApiError {
    fn from(e: ConversionError) -> Self {
        Self::Conversion(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid auth key".to_string(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
            ApiError::Conversion(e) => (
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.code(),
                e.to_string(),
            ),
        };

        if status.is_server_error() {
            error!(status = %status, error = %message, "Conversion request failed");
        }

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct UrlParams {
    url: Option<String>,
    ext: Option<String>,
    aggressive: Option<String>,
    wait_for_status: Option<String>,
    key: Option<String>,
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileParams {
    ext: Option<String>,
    filename: Option<String>,
    aggressive: Option<String>,
    wait_for_status: Option<String>,
    key: Option<String>,
    auth: Option<String>,
}

/// A flag is set when present (`?aggressive`, `?aggressive=1`) unless its
/// value is an explicit no.
fn flag(value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
    }
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// Writes an uploaded page to a temp `.html` file that is removed on drop.
fn write_page(body: &[u8]) -> Result<NamedTempFile, ApiError> {
    let mut page = tempfile::Builder::new()
        .prefix("weaver-")
        .suffix(".html")
        .tempfile()
        .map_err(|e| ApiError::Internal(format!("failed to create temp file: {e}")))?;
    page.write_all(body)
        .and_then(|_| page.flush())
        .map_err(|e| ApiError::Internal(format!("failed to write temp file: {e}")))?;
    Ok(page)
}

async fn index() -> &'static str {
    "PDF Weaver: HTML to PDF/PNG conversion service"
}

async fn stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.queue.stats())
}

async fn convert_by_url(
    State(state): State<AppState>,
    query: Result<Query<UrlParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let params = query_params(query)?;
    state.authorize(params.auth.as_deref())?;

    let url = params
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing 'url' parameter".to_string()))?;
    let format = Format::from(params.ext.as_deref().unwrap_or("pdf"));

    let mut source = ConversionSource::new(url, format)
        .with_aggressive(flag(params.aggressive.as_deref()))
        .with_wait_for_status(flag(params.wait_for_status.as_deref()));
    if let Some(key) = params.key {
        source = source.with_upload_key(key);
    }

    info!(uri = %source.actual_uri(), format = %format, "Conversion requested by URL");
    let conversion = state.queue.submit(source).await?;
    Ok(artifact_response(format, conversion))
}

async fn convert_by_file(
    State(state): State<AppState>,
    query: Result<Query<FileParams>, QueryRejection>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let params = query_params(query)?;
    state.authorize(params.auth.as_deref())?;

    if body.is_empty() {
        return Err(ApiError::BadRequest("request body is empty".to_string()));
    }
    let format = Format::from(params.ext.as_deref().unwrap_or("pdf"));

    let body_len = body.len();
    // The temp file lives until the conversion finishes.
    let page = tokio::task::spawn_blocking(move || write_page(&body))
        .await
        .map_err(|e| ApiError::Internal(format!("temp file task failed: {e}")))??;

    let path = page.path().to_string_lossy().to_string();
    let mut source = ConversionSource::new(path, format)
        .with_actual_uri(params.filename.unwrap_or_else(|| "upload.html".to_string()))
        .with_aggressive(flag(params.aggressive.as_deref()))
        .with_wait_for_status(flag(params.wait_for_status.as_deref()));
    if let Some(key) = params.key {
        source = source.with_upload_key(key);
    }

    info!(uri = %source.actual_uri(), bytes = body_len, format = %format, "Conversion requested by upload");
    let conversion = state.queue.submit(source).await?;
    drop(page);
    Ok(artifact_response(format, conversion))
}

fn artifact_response(format: Format, conversion: Conversion) -> Response {
    let mut response = (
        [(header::CONTENT_TYPE, HeaderValue::from_static(format.content_type()))],
        conversion.bytes,
    )
        .into_response();

    if let Some(upload) = &conversion.upload {
        response
            .headers_mut()
            .insert(UPLOAD_HEADER, HeaderValue::from_static(upload.label()));
    }
    response
}
