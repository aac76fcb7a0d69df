//! HTTP route handlers.

pub mod models;
pub mod modules;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use tfd_core::ServableId;

use crate::error::ApiError;
use crate::server::{ping, AppState};
use crate::service::Archive;

/// Maximum accepted upload body (1 GiB).
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Builds the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .nest("/v1/models", models::routes())
        .nest("/v1/modules", modules::routes())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Parses and validates a servable identifier from path segments.
///
/// Segments are lowercased before validation, matching the URL
/// conventions of the serving fleet names.
pub(crate) fn parse_servable(team: &str, project: &str, name: &str) -> Result<ServableId, ApiError> {
    ServableId::new(
        team.to_lowercase(),
        project.to_lowercase(),
        name.to_lowercase(),
    )
    .map_err(ApiError::bad_request)
}

/// Parses a fleet-level `(team, project)` identifier.
pub(crate) fn parse_fleet(team: &str, project: &str) -> Result<ServableId, ApiError> {
    ServableId::fleet(team.to_lowercase(), project.to_lowercase()).map_err(ApiError::bad_request)
}

/// Validates a version path parameter.
pub(crate) fn validate_version(version: i64) -> Result<i64, ApiError> {
    if (1..=999).contains(&version) {
        Ok(version)
    } else {
        Err(ApiError::bad_request(
            "version must be between 1 and 999",
        ))
    }
}

/// Validates and lowercases a label path parameter.
pub(crate) fn validate_label(label: &str) -> Result<String, ApiError> {
    let label = label.to_lowercase();
    if label.is_empty() || label.len() > 32 {
        return Err(ApiError::bad_request(
            "label must be between 1 and 32 characters",
        ));
    }
    Ok(label)
}

/// Serves a packaged archive as an attachment.
pub(crate) fn binary_response(archive: Archive) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", archive.name),
            ),
        ],
        archive.data,
    )
        .into_response()
}
