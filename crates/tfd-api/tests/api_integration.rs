//! End-to-end API tests over the full stack: axum router, service
//! orchestration, sqlite metadata, filesystem storage, and the config
//! state machine. Fleet RPC and discovery are faked.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tempfile::TempDir;
use tower::ServiceExt;

use tfd_api::routes;
use tfd_api::server::AppState;
use tfd_api::service::{ModelService, ModuleService};
use tfd_core::{Lock, ServableId};
use tfd_discovery::{Discoverer, Result as DiscoveryResult};
use tfd_metadata::SqliteMetadata;
use tfd_serving::{
    ModelServerConfig, ModelStatusResponse, Reloader, ServableConfig, ServingClient,
};
use tfd_storage::{FsStorage, FsStorageConfig};

struct FakeDiscovery;

#[async_trait]
impl Discoverer for FakeDiscovery {
    async fn discover(&self, _id: &ServableId) -> DiscoveryResult<Vec<String>> {
        Ok(Vec::new())
    }
}

struct FakeServingClient;

#[async_trait]
impl ServingClient for FakeServingClient {
    async fn reload_config(
        &self,
        _endpoint: &str,
        _config: &ModelServerConfig,
    ) -> tfd_serving::Result<()> {
        Ok(())
    }

    async fn model_status(
        &self,
        _endpoint: &str,
        _name: &str,
        version: i64,
    ) -> tfd_serving::Result<ModelStatusResponse> {
        Ok(ModelStatusResponse {
            model_version_status: vec![tfd_serving::client::ModelVersionStatus {
                version,
                state: tfd_serving::STATE_AVAILABLE.into(),
            }],
        })
    }
}

struct Harness {
    router: Router,
    state: Arc<AppState>,
    _base: TempDir,
}

fn harness() -> Harness {
    let base = TempDir::new().expect("storage base");
    let storage =
        Arc::new(FsStorage::new(FsStorageConfig::under_base(base.path())).expect("storage"));
    let metadata = Arc::new(SqliteMetadata::open_in_memory().expect("metadata"));
    let servable_config = Arc::new(ServableConfig::new(storage.clone(), "canary"));
    let lock = Arc::new(Lock::new());

    let reloader = Arc::new(Reloader::new(
        Arc::new(FakeDiscovery),
        metadata.clone(),
        servable_config.clone(),
        Arc::new(FakeServingClient),
        lock.clone(),
        Duration::from_secs(300),
        900,
        false,
    ));

    let models = Arc::new(ModelService::new(
        metadata.clone(),
        storage.clone(),
        servable_config,
        reloader,
    ));
    let modules = Arc::new(ModuleService::new(metadata, storage));

    let state = Arc::new(AppState {
        models,
        modules,
        lock,
        upload_timeout: Duration::from_secs(30),
        version: "test".to_string(),
    });

    Harness {
        router: routes::router(state.clone()),
        state,
        _base: base,
    }
}

fn valid_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in [
        ("saved_model.pb", b"graph".as_slice()),
        ("variables/variables.data-00000-of-00001", b"weights"),
        ("variables/variables.index", b"idx"),
        ("README.md", b"# model"),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents)
            .expect("append entry");
    }
    builder.into_inner().expect("finish archive")
}

fn broken_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let contents = b"graph".as_slice();
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "saved_model.pb", contents)
        .expect("append entry");
    builder.into_inner().expect("finish archive")
}

fn multipart_body(archive: &[u8], hash: Option<&str>) -> (String, Vec<u8>) {
    let boundary = "tfd-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"archive_data\"; \
             filename=\"model_archive.tar\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(archive);
    body.extend_from_slice(b"\r\n");
    if let Some(hash) = hash {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"archive_hash\"\r\n\r\n{hash}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

async fn upload(router: &Router, path: &str, archive: &[u8], hash: Option<&str>) -> (StatusCode, serde_json::Value) {
    let (content_type, body) = multipart_body(archive, hash);
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .expect("build upload request");

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("route upload request");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

async fn request_json(router: &Router, method: &str, path: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .expect("build request");
    let response = router.clone().oneshot(request).await.expect("route request");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

async fn request_raw(router: &Router, method: &str, path: &str) -> (StatusCode, Vec<u8>, Option<String>) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .expect("build request");
    let response = router.clone().oneshot(request).await.expect("route request");
    let status = response.status();
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    (status, bytes.to_vec(), disposition)
}

#[tokio::test]
async fn ping_reports_name_and_version() {
    let harness = harness();
    let (status, body) = request_json(&harness.router, "GET", "/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "tfdeploy:test");
    assert_eq!(body["version"], "test");
}

#[tokio::test]
async fn first_upload_creates_version_one_with_default_label() {
    let harness = harness();

    let (status, body) =
        upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["team"], "t");
    assert_eq!(body["project"], "p");
    assert_eq!(body["name"], "m");
    assert_eq!(body["version"], 1);
    assert_eq!(body["label"], "");

    let (status, list) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;
    assert_eq!(status, StatusCode::OK);
    let rows = list.as_array().expect("list array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["version"], 1);
    assert_eq!(rows[0]["label"], "canary");
    assert_eq!(rows[0]["status"], "ready");
}

#[tokio::test]
async fn labelling_to_stable_updates_config_blob() {
    let harness = harness();
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;

    let (status, _) = request_json(
        &harness.router,
        "PUT",
        "/v1/models/t/p/names/m/versions/1/labels/stable",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, config_bytes, _) =
        request_raw(&harness.router, "GET", "/v1/models/t/p/config").await;
    assert_eq!(status, StatusCode::OK);
    let config: serde_json::Value = serde_json::from_slice(&config_bytes).expect("config json");
    let labels = &config["model_config_list"]["config"][0]["version_labels"];
    assert_eq!(labels["canary"], 1);
    assert_eq!(labels["stable"], 1);
}

#[tokio::test]
async fn promoting_a_new_stable_records_last_stable() {
    let harness = harness();
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    request_json(
        &harness.router,
        "PUT",
        "/v1/models/t/p/names/m/versions/1/labels/stable",
    )
    .await;

    let (status, body) =
        upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 2);

    let (status, _) = request_json(
        &harness.router,
        "PUT",
        "/v1/models/t/p/names/m/versions/2/labels/stable",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, list) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;
    let rows = list.as_array().expect("list array");
    let has = |version: i64, label: &str| {
        rows.iter()
            .any(|row| row["version"] == version && row["label"] == label)
    };
    assert!(has(2, "stable"));
    assert!(has(1, "last_stable"));

    let (_, config_bytes, _) = request_raw(&harness.router, "GET", "/v1/models/t/p/config").await;
    let config: serde_json::Value = serde_json::from_slice(&config_bytes).expect("config json");
    assert_eq!(
        config["model_config_list"]["config"][0]["version_labels"]["stable"],
        2
    );
}

#[tokio::test]
async fn revert_restores_previous_stable_and_drops_last_stable() {
    let harness = harness();
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    request_json(
        &harness.router,
        "PUT",
        "/v1/models/t/p/names/m/versions/1/labels/stable",
    )
    .await;
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    request_json(
        &harness.router,
        "PUT",
        "/v1/models/t/p/names/m/versions/2/labels/stable",
    )
    .await;

    let (status, _) =
        request_json(&harness.router, "PUT", "/v1/models/t/p/names/m/revert").await;
    assert_eq!(status, StatusCode::OK);

    let (_, config_bytes, _) = request_raw(&harness.router, "GET", "/v1/models/t/p/config").await;
    let config: serde_json::Value = serde_json::from_slice(&config_bytes).expect("config json");
    assert_eq!(
        config["model_config_list"]["config"][0]["version_labels"]["stable"],
        1
    );

    let (_, list) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;
    let rows = list.as_array().expect("list array");
    assert!(!rows.iter().any(|row| row["label"] == "last_stable"));
}

#[tokio::test]
async fn removing_the_stable_version_is_refused() {
    let harness = harness();
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    request_json(
        &harness.router,
        "PUT",
        "/v1/models/t/p/names/m/versions/1/labels/stable",
    )
    .await;

    let (_, before) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;

    let (status, body) = request_json(
        &harness.router,
        "DELETE",
        "/v1/models/t/p/names/m/versions/1",
    )
    .await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(body["error_details"]["error_code"], "307");

    // no state change
    let (_, after) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn contended_lock_answers_temporary_redirect() {
    let harness = harness();
    let id = ServableId::new("t", "p", "m").unwrap();
    harness.state.lock.lock_servable(&id).unwrap();

    let (status, body) =
        upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(body["error_details"]["error_code"], "307");

    harness.state.lock.unlock_servable(&id);
    let (status, _) =
        upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn checksum_mismatch_rejects_upload_without_state_changes() {
    let harness = harness();

    let (status, _) = upload(
        &harness.router,
        "/v1/models/t/p/names/m",
        &valid_archive(),
        Some("deadbeef"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, list) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;
    assert_eq!(list.as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn matching_checksum_is_accepted() {
    let harness = harness();
    let archive = valid_archive();
    let hash = {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(&archive))
    };

    let (status, body) = upload(
        &harness.router,
        "/v1/models/t/p/names/m",
        &archive,
        Some(&hash),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
}

#[tokio::test]
async fn malformed_archive_leaves_no_partial_state() {
    let harness = harness();

    let (status, _) =
        upload(&harness.router, "/v1/models/t/p/names/m", &broken_archive(), None).await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);

    let (_, list) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;
    assert_eq!(list.as_array().map(Vec::len), Some(0));

    // a later valid upload still lands on version 1
    let (status, body) =
        upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
}

#[tokio::test]
async fn upload_with_explicit_label_uses_it() {
    let harness = harness();

    let (status, _) = upload(
        &harness.router,
        "/v1/models/t/p/names/m/labels/preview",
        &valid_archive(),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, list) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;
    let rows = list.as_array().expect("list array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["label"], "preview");
}

#[tokio::test]
async fn download_by_version_serves_a_tar_attachment() {
    let harness = harness();
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;

    let (status, data, disposition) = request_raw(
        &harness.router,
        "GET",
        "/v1/models/t/p/names/m/versions/1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!data.is_empty());
    let disposition = disposition.expect("content-disposition header");
    assert!(disposition.starts_with("attachment; filename=model_t-p-m-1_"));
    assert!(disposition.ends_with(".tar"));

    // the tar round-trips the committed tree
    let mut names = Vec::new();
    let mut archive = tar::Archive::new(data.as_slice());
    for entry in archive.entries().expect("tar entries") {
        let entry = entry.expect("tar entry");
        names.push(entry.path().expect("path").display().to_string());
    }
    assert!(names.iter().any(|n| n.ends_with("saved_model.pb")));
    assert!(names.iter().any(|n| n.ends_with("variables/variables.index")));
}

#[tokio::test]
async fn delete_label_keeps_the_version() {
    let harness = harness();
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    request_json(
        &harness.router,
        "PUT",
        "/v1/models/t/p/names/m/versions/1/labels/extra",
    )
    .await;

    let (status, _) = request_json(
        &harness.router,
        "DELETE",
        "/v1/models/t/p/names/m/labels/extra",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, list) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;
    let rows = list.as_array().expect("list array");
    assert!(!rows.iter().any(|row| row["label"] == "extra"));
    // the anchor row for version 1 is visible again
    assert!(rows
        .iter()
        .any(|row| row["version"] == 1 && row["label"] == ""));
}

#[tokio::test]
async fn remove_by_version_deletes_rows_and_files() {
    let harness = harness();
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;
    upload(&harness.router, "/v1/models/t/p/names/m", &valid_archive(), None).await;

    let (status, _) = request_json(
        &harness.router,
        "DELETE",
        "/v1/models/t/p/names/m/versions/1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, list) = request_json(&harness.router, "GET", "/v1/models/t/p/list").await;
    let rows = list.as_array().expect("list array");
    assert!(rows.iter().all(|row| row["version"] != 1));

    let (status, _, _) = request_raw(
        &harness.router,
        "GET",
        "/v1/models/t/p/names/m/versions/1",
    )
    .await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
}

#[tokio::test]
async fn invalid_path_parameters_answer_bad_request() {
    let harness = harness();

    let (status, _) = upload(
        &harness.router,
        "/v1/models/te-am/p/names/m",
        &valid_archive(),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request_json(
        &harness.router,
        "PUT",
        "/v1/models/t/p/names/m/versions/1000/labels/stable",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn module_lifecycle_upload_list_download_delete() {
    let harness = harness();

    let (status, body) = upload(
        &harness.router,
        "/v1/modules/t/p/names/emb",
        &broken_archive(),
        None,
    )
    .await;
    // modules carry no layout contract
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);

    let (_, list) = request_json(&harness.router, "GET", "/v1/modules/t/p/list").await;
    assert_eq!(list.as_array().map(Vec::len), Some(1));

    let (status, data, disposition) = request_raw(
        &harness.router,
        "GET",
        "/v1/modules/t/p/names/emb/versions/1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!data.is_empty());
    assert!(disposition.expect("disposition").contains("module_t-p-emb-1_"));

    let (status, _) = request_json(
        &harness.router,
        "DELETE",
        "/v1/modules/t/p/names/emb/versions/1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, list) = request_json(&harness.router, "GET", "/v1/modules/t/p/list").await;
    assert_eq!(list.as_array().map(Vec::len), Some(0));
}
