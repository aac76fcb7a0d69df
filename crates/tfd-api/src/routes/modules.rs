//! Module API routes.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;

use crate::checksum::is_checksum_valid;
use crate::error::ApiError;
use crate::server::AppState;

use super::models::ListQuery;
use super::{binary_response, parse_fleet, parse_servable, validate_version};

/// Module routes mounted under `/v1/modules`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/list", get(list_modules))
        .route("/:team/:project/list", get(list_modules_by_project))
        .route("/:team/:project/names/:name", post(upload_module))
        .route("/:team/:project/names/:name/list", get(list_modules_by_name))
        .route(
            "/:team/:project/names/:name/versions/:version",
            get(download_module_by_version).delete(delete_module_by_version),
        )
}

async fn list_modules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let filter = query.into_filter()?;
    let modules = state
        .modules
        .list_modules(&filter)
        .map_err(ApiError::internal)?;
    Ok(Json(modules).into_response())
}

async fn list_modules_by_project(
    State(state): State<Arc<AppState>>,
    Path((team, project)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_fleet(&team, &project)?;
    let modules = state
        .modules
        .list_modules_by_project(&id.team, &id.project)
        .map_err(ApiError::internal)?;
    Ok(Json(modules).into_response())
}

async fn list_modules_by_name(
    State(state): State<Arc<AppState>>,
    Path((team, project, name)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let modules = state
        .modules
        .list_modules_by_name(&id)
        .map_err(ApiError::internal)?;
    Ok(Json(modules).into_response())
}

async fn upload_module(
    State(state): State<Arc<AppState>>,
    Path((team, project, name)): Path<(String, String, String)>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let _guard = state.lock.guard_servable(&id).map_err(ApiError::temporary)?;

    let mut data: Option<Bytes> = None;
    let mut checksum = String::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(ApiError::temporary)?
    {
        let name = field.name().map(ToString::to_string);
        match name.as_deref() {
            Some("archive_data") => {
                data = Some(field.bytes().await.map_err(ApiError::temporary)?);
            }
            Some("archive_hash") => {
                checksum = field.text().await.map_err(ApiError::temporary)?;
            }
            _ => {}
        }
    }
    let data = data.ok_or_else(|| ApiError::temporary("missing archive_data form field"))?;
    if !is_checksum_valid(&data, &checksum) {
        return Err(ApiError::bad_request("invalid checksum"));
    }

    let uploaded = tokio::time::timeout(
        state.upload_timeout,
        state.modules.upload_module(&id, &data),
    )
    .await
    .map_err(|_| ApiError::temporary("upload timed out"))?
    .map_err(ApiError::temporary)?;

    Ok(Json(uploaded).into_response())
}

async fn download_module_by_version(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, version)): Path<(String, String, String, i64)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let version = validate_version(version)?;

    let archive = state
        .modules
        .archive_by_version(&id, version)
        .await
        .map_err(ApiError::temporary)?;
    Ok(binary_response(archive))
}

async fn delete_module_by_version(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, version)): Path<(String, String, String, i64)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let version = validate_version(version)?;
    let _guard = state.lock.guard_servable(&id).map_err(ApiError::temporary)?;

    state
        .modules
        .remove_by_version(&id, version)
        .await
        .map_err(ApiError::temporary)?;
    Ok(StatusCode::OK.into_response())
}
