//! RPC client for serving instances.
//!
//! Each push carries the full config blob; the instance replies with a
//! status message whose non-empty error string counts as a failure
//! alongside transport errors. Every call opens a fresh connection so a
//! bounced instance never serves a stale keepalive socket.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ModelServerConfig;
use crate::{Result, ServingError};

/// Version state reported by an instance for a loaded model.
pub const STATE_AVAILABLE: &str = "AVAILABLE";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request pushing the full config blob to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadConfigRequest {
    /// The blob to load.
    pub config: ModelServerConfig,
}

/// Status message embedded in instance replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Numeric status code; zero on success.
    #[serde(default)]
    pub error_code: i32,
    /// Non-empty on failure.
    #[serde(default)]
    pub error_message: String,
}

/// Reply to a config push.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReloadConfigResponse {
    /// Outcome of the reload.
    #[serde(default)]
    pub status: InstanceStatus,
}

/// Request for the state of one model version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatusRequest {
    /// Model name.
    pub name: String,
    /// Version to inspect.
    pub version: i64,
}

/// State of one loaded version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersionStatus {
    /// The version the state refers to.
    #[serde(default)]
    pub version: i64,
    /// Lifecycle state, `AVAILABLE` when servable.
    pub state: String,
}

/// Reply to a model status request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelStatusResponse {
    /// Per-version states; the first entry answers the request.
    #[serde(default)]
    pub model_version_status: Vec<ModelVersionStatus>,
}

impl ModelStatusResponse {
    /// True when the first reported version state is `AVAILABLE`.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.model_version_status
            .first()
            .is_some_and(|status| status.state == STATE_AVAILABLE)
    }
}

/// RPC operations against one serving instance.
#[async_trait]
pub trait ServingClient: Send + Sync {
    /// Pushes the full config blob to `endpoint`.
    async fn reload_config(&self, endpoint: &str, config: &ModelServerConfig) -> Result<()>;
    /// Queries the state of `(name, version)` on `endpoint`.
    async fn model_status(
        &self,
        endpoint: &str,
        name: &str,
        version: i64,
    ) -> Result<ModelStatusResponse>;
}

/// HTTP JSON client for serving instances.
#[derive(Debug, Clone)]
pub struct HttpServingClient {
    client: reqwest::Client,
}

impl HttpServingClient {
    /// Creates a client with the given per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // fresh connection per push; a reconverging fleet must not
            // be reached through stale keepalive sockets
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    fn rpc_error(endpoint: &str, message: impl Into<String>) -> ServingError {
        ServingError::Rpc {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }
}

impl Default for HttpServingClient {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl ServingClient for HttpServingClient {
    async fn reload_config(&self, endpoint: &str, config: &ModelServerConfig) -> Result<()> {
        let url = format!("http://{endpoint}/v1/reload-config");
        let request = ReloadConfigRequest {
            config: config.clone(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::rpc_error(endpoint, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::rpc_error(
                endpoint,
                format!("reload-config returned {}", response.status()),
            ));
        }

        let reply: ReloadConfigResponse = response
            .json()
            .await
            .map_err(|e| Self::rpc_error(endpoint, format!("invalid reload response: {e}")))?;

        if !reply.status.error_message.is_empty() {
            return Err(Self::rpc_error(
                endpoint,
                format!(
                    "response status is invalid status: {}",
                    reply.status.error_message
                ),
            ));
        }
        Ok(())
    }

    async fn model_status(
        &self,
        endpoint: &str,
        name: &str,
        version: i64,
    ) -> Result<ModelStatusResponse> {
        let url = format!("http://{endpoint}/v1/model-status");
        let request = ModelStatusRequest {
            name: name.to_string(),
            version,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::rpc_error(endpoint, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::rpc_error(
                endpoint,
                format!("model-status returned {}", response.status()),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| Self::rpc_error(endpoint, format!("invalid status response: {e}")))
    }
}
