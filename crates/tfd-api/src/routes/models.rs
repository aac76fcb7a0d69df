//! Model API routes.
//!
//! Mutating routes hold the per-servable lock for their full duration;
//! a contended lock answers 307 so the caller retries.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;

use tfd_core::{ModelId, ServableId, STABLE_LABEL};
use tfd_metadata::{QueryFilter, Status};
use tfd_serving::ServingError;

use crate::checksum::is_checksum_valid;
use crate::error::ApiError;
use crate::server::AppState;
use crate::service::ServiceError;

use super::{binary_response, parse_fleet, parse_servable, validate_label, validate_version};

/// Model routes mounted under `/v1/models`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/list", get(list_models))
        .route("/:team/:project/config", get(config_file))
        .route("/:team/:project/list", get(list_models_by_project))
        .route("/:team/:project/reload", post(reload))
        .route("/:team/:project/names/:name", post(upload_model))
        .route("/:team/:project/names/:name/list", get(list_models_by_name))
        .route("/:team/:project/names/:name/revert", put(revert_model))
        .route(
            "/:team/:project/names/:name/labels/:label",
            get(download_model_by_label)
                .post(upload_model_with_label)
                .delete(delete_model_label),
        )
        .route(
            "/:team/:project/names/:name/labels/:label/remove_version",
            axum::routing::delete(delete_model_by_label),
        )
        .route(
            "/:team/:project/names/:name/versions/:version",
            get(download_model_by_version).delete(delete_model_by_version),
        )
        .route(
            "/:team/:project/names/:name/versions/:version/labels/stable",
            put(set_model_label_stable),
        )
        .route(
            "/:team/:project/names/:name/versions/:version/labels/:label",
            put(set_model_label),
        )
}

/// Optional query filters accepted by the listing routes.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    team: Option<String>,
    project: Option<String>,
    name: Option<String>,
    version: Option<i64>,
    label: Option<String>,
    status: Option<String>,
}

impl ListQuery {
    pub(crate) fn into_filter(self) -> Result<QueryFilter, ApiError> {
        let mut filter = QueryFilter::new();
        if let Some(team) = self.team {
            filter = filter.with_team(team.to_lowercase());
        }
        if let Some(project) = self.project {
            filter = filter.with_project(project.to_lowercase());
        }
        if let Some(name) = self.name {
            filter = filter.with_name(name.to_lowercase());
        }
        if let Some(version) = self.version {
            filter = filter.with_version(validate_version(version)?);
        }
        if let Some(label) = self.label {
            filter = filter.with_label(validate_label(&label)?);
        }
        if let Some(status) = self.status {
            let status = Status::parse(&status.to_lowercase())
                .map_err(ApiError::bad_request)?;
            filter = filter.with_status(status);
        }
        Ok(filter)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReloadQuery {
    #[serde(default)]
    skipshortconfig: Option<bool>,
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let filter = query.into_filter()?;
    let models = state.models.list_models(&filter).map_err(ApiError::internal)?;
    Ok(Json(models).into_response())
}

async fn list_models_by_project(
    State(state): State<Arc<AppState>>,
    Path((team, project)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_fleet(&team, &project)?;
    let models = state
        .models
        .list_models_by_project(&id.team, &id.project)
        .map_err(ApiError::internal)?;
    Ok(Json(models).into_response())
}

async fn list_models_by_name(
    State(state): State<Arc<AppState>>,
    Path((team, project, name)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let models = state
        .models
        .list_models_by_name(&id)
        .map_err(ApiError::internal)?;
    Ok(Json(models).into_response())
}

async fn config_file(
    State(state): State<Arc<AppState>>,
    Path((team, project)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_fleet(&team, &project)?;
    let config = state
        .models
        .config_stream(&id.team, &id.project)
        .await
        .map_err(ApiError::internal)?;
    Ok(binary_response(crate::service::Archive {
        data: config,
        name: "models.config".to_string(),
    }))
}

async fn reload(
    State(state): State<Arc<AppState>>,
    Path((team, project)): Path<(String, String)>,
    Query(query): Query<ReloadQuery>,
) -> Result<Response, ApiError> {
    let id = parse_fleet(&team, &project)?;
    state
        .models
        .reload_models(&id.team, &id.project, query.skipshortconfig.unwrap_or(false))
        .await
        .map_err(map_reload_error)?;
    Ok(Json(serde_json::json!([])).into_response())
}

fn map_reload_error(err: ServiceError) -> ApiError {
    match err {
        ServiceError::Serving(ServingError::ReloadFailed { .. }) => ApiError::temporary(err),
        other => ApiError::internal(other),
    }
}

async fn upload_model(
    State(state): State<Arc<AppState>>,
    Path((team, project, name)): Path<(String, String, String)>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    upload(&state, &id, None, multipart).await
}

async fn upload_model_with_label(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, label)): Path<(String, String, String, String)>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let label = validate_label(&label)?;
    upload(&state, &id, Some(label), multipart).await
}

async fn upload(
    state: &AppState,
    id: &ServableId,
    label: Option<String>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let _guard = state.lock.guard_servable(id).map_err(ApiError::temporary)?;

    let (data, supplied_checksum) = read_upload(multipart).await?;
    if !is_checksum_valid(&data, &supplied_checksum) {
        return Err(ApiError::bad_request("invalid checksum"));
    }

    let uploaded = tokio::time::timeout(
        state.upload_timeout,
        state.models.upload_model(id, &data, label.as_deref()),
    )
    .await
    .map_err(|_| ApiError::temporary("upload timed out"))?
    .map_err(ApiError::temporary)?;

    Ok(Json(uploaded).into_response())
}

async fn read_upload(mut multipart: Multipart) -> Result<(Bytes, String), ApiError> {
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
    Ok((data, checksum))
}

async fn revert_model(
    State(state): State<Arc<AppState>>,
    Path((team, project, name)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let _guard = state.lock.guard_servable(&id).map_err(ApiError::temporary)?;

    let changed = state.models.revert(&id).await.map_err(ApiError::temporary)?;
    Ok(Json(changed.message()).into_response())
}

async fn set_model_label_stable(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, version)): Path<(String, String, String, i64)>,
) -> Result<Response, ApiError> {
    set_label(&state, &team, &project, &name, version, STABLE_LABEL.to_string()).await
}

async fn set_model_label(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, version, label)): Path<(String, String, String, i64, String)>,
) -> Result<Response, ApiError> {
    let label = validate_label(&label)?;
    set_label(&state, &team, &project, &name, version, label).await
}

async fn set_label(
    state: &AppState,
    team: &str,
    project: &str,
    name: &str,
    version: i64,
    label: String,
) -> Result<Response, ApiError> {
    let id = parse_servable(team, project, name)?;
    let version = validate_version(version)?;
    let _guard = state.lock.guard_servable(&id).map_err(ApiError::temporary)?;

    let model = ModelId::with_label(id, version, label);
    let changed = state
        .models
        .set_label(&model)
        .await
        .map_err(ApiError::temporary)?;
    Ok(Json(changed.message()).into_response())
}

async fn download_model_by_label(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, label)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let label = validate_label(&label)?;

    let archive = state
        .models
        .archive_by_label(&id, &label)
        .await
        .map_err(ApiError::temporary)?;
    Ok(binary_response(archive))
}

async fn download_model_by_version(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, version)): Path<(String, String, String, i64)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let version = validate_version(version)?;

    let archive = state
        .models
        .archive_by_version(&id, version)
        .await
        .map_err(ApiError::temporary)?;
    Ok(binary_response(archive))
}

async fn delete_model_label(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, label)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let label = validate_label(&label)?;
    let _guard = state.lock.guard_servable(&id).map_err(ApiError::temporary)?;

    state
        .models
        .remove_model_label(&id, &label)
        .await
        .map_err(ApiError::temporary)?;
    Ok(StatusCode::OK.into_response())
}

async fn delete_model_by_label(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, label)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let label = validate_label(&label)?;
    let _guard = state.lock.guard_servable(&id).map_err(ApiError::temporary)?;

    state
        .models
        .remove_by_label(&id, &label)
        .await
        .map_err(ApiError::temporary)?;
    Ok(StatusCode::OK.into_response())
}

async fn delete_model_by_version(
    State(state): State<Arc<AppState>>,
    Path((team, project, name, version)): Path<(String, String, String, i64)>,
) -> Result<Response, ApiError> {
    let id = parse_servable(&team, &project, &name)?;
    let version = validate_version(version)?;
    let _guard = state.lock.guard_servable(&id).map_err(ApiError::temporary)?;

    state
        .models
        .remove_by_version(&id, version)
        .await
        .map_err(ApiError::temporary)?;
    Ok(StatusCode::OK.into_response())
}
