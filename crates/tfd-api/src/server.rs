//! Server wiring: collaborators, shared state, and the listen loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Json, Router};
use serde::Serialize;

use tfd_core::Lock;
use tfd_discovery::{Discoverer, DnsDiscovery, PlaintextDiscovery, Source};
use tfd_metadata::SqliteMetadata;
use tfd_serving::{HttpServingClient, Reloader, ServableConfig};
use tfd_storage::FsStorage;

use crate::config::Config;
use crate::routes;
use crate::service::{ModelService, ModuleService};
use crate::VERSION;

/// `/ping` response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct PingResponse {
    /// Service name with version.
    pub name: String,
    /// Bare version.
    pub version: String,
}

/// Liveness endpoint handler.
pub async fn ping(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PingResponse {
        name: format!("tfdeploy:{}", state.version),
        version: state.version.clone(),
    })
}

/// Shared application state for request handlers.
pub struct AppState {
    /// Model orchestration service.
    pub models: Arc<ModelService>,
    /// Module orchestration service.
    pub modules: Arc<ModuleService>,
    /// Per-servable lock table.
    pub lock: Arc<Lock>,
    /// Total timeout applied to one upload request.
    pub upload_timeout: Duration,
    /// Version reported by `/ping`.
    pub version: String,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("upload_timeout", &self.upload_timeout)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// The tfdeploy controller server.
pub struct Server {
    config: Config,
}

impl Server {
    /// Creates a server from a validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Wires collaborators, starts the reconcile loop, and serves HTTP
    /// until the process exits.
    ///
    /// # Errors
    ///
    /// Returns an error when a collaborator cannot be constructed or the
    /// listener cannot bind.
    pub async fn serve(self) -> anyhow::Result<()> {
        let (state, reloader) = build_state(&self.config)?;

        tokio::spawn(reloader.run());

        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.app.listen_host, self.config.app.listen_port
        )
        .parse()?;
        let router = routes::router(state);

        tracing::info!(addr = %addr, version = VERSION, "starting tfdeploy");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// Builds the shared state and the reconciler from configuration.
///
/// # Errors
///
/// Returns an error when storage, metadata, or discovery cannot be
/// constructed.
pub fn build_state(config: &Config) -> anyhow::Result<(Arc<AppState>, Arc<Reloader>)> {
    let storage = Arc::new(FsStorage::new(config.storage.to_storage_config()?)?);
    let metadata = Arc::new(SqliteMetadata::open(
        &config.metadata.sqldb.driver,
        &config.metadata.sqldb.dsn,
    )?);

    let discovery: Arc<dyn Discoverer> = match Source::parse(&config.app.discovery)? {
        Source::Dns => Arc::new(DnsDiscovery::new(
            config.discovery.dns.service_suffix.clone(),
            config.discovery.dns.default_instance_port,
        )?),
        Source::Plaintext => Arc::new(PlaintextDiscovery::new(
            config.discovery.plaintext.hosts_path.clone(),
        )),
    };

    let servable_config = Arc::new(ServableConfig::new(
        storage.clone(),
        config.app.default_model_label.clone(),
    ));
    let client = Arc::new(HttpServingClient::default());
    let lock = Arc::new(Lock::new());

    let reloader = Arc::new(Reloader::new(
        discovery,
        metadata.clone(),
        servable_config.clone(),
        client,
        lock.clone(),
        Duration::from_secs(config.app.reload_interval_in_sec),
        config.app.max_auto_reload_duration_in_sec,
        config.app.allow_labels_for_unavailable_models,
    ));

    let models = Arc::new(ModelService::new(
        metadata.clone(),
        storage.clone(),
        servable_config,
        reloader.clone(),
    ));
    let modules = Arc::new(ModuleService::new(metadata, storage));

    let state = Arc::new(AppState {
        models,
        modules,
        lock,
        upload_timeout: Duration::from_secs(config.app.upload_timeout_in_sec),
        version: VERSION.to_string(),
    });
    Ok((state, reloader))
}
