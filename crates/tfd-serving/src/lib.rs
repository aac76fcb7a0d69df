//! Serving config state machine and fleet reconciliation.
//!
//! The per-`(team, project)` config blob is the canonical intent of the
//! controller. [`ServableConfig`] owns read-modify-write access to it;
//! [`Reloader`] pushes it to discovered serving instances with a
//! two-phase protocol, detects drift, and reconciles periodically.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod client;
pub mod config;
pub mod reloader;
pub mod servable_config;

use async_trait::async_trait;

pub use client::{HttpServingClient, ModelStatusResponse, ServingClient, STATE_AVAILABLE};
pub use config::{ModelConfig, ModelServerConfig};
pub use reloader::{Reloader, ServableInstances, ServableLister, AUTO_RELOAD_LOCK_ID};
pub use servable_config::ServableConfig;

use tfd_storage::{FsStorage, StorageError};

/// The result type used by serving operations.
pub type Result<T> = std::result::Result<T, ServingError>;

/// Errors raised by the serving subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ServingError {
    /// The named model has no entry in the config blob.
    #[error("name not found")]
    UpdateLabel,

    /// The entry has no label map, or the label resolves to nothing.
    #[error("version not found")]
    VersionNotFound,

    /// The `stable` label still points at the version being removed.
    #[error("model has stable label")]
    StableLabelProtects,

    /// A push to one or more serving instances failed.
    #[error("reload failed: {}", errors.join("; "))]
    ReloadFailed {
        /// Per-endpoint error strings.
        errors: Vec<String>,
    },

    /// An RPC to a single serving instance failed.
    #[error("{endpoint}: {message}")]
    Rpc {
        /// The `ip:port` endpoint.
        endpoint: String,
        /// Transport or status failure description.
        message: String,
    },

    /// The blob could not be encoded or decoded.
    #[error("config serialization error: {0}")]
    Serialization(String),

    /// The backing config storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Instance discovery failed.
    #[error(transparent)]
    Discovery(#[from] tfd_discovery::DiscoveryError),

    /// The metadata index failed.
    #[error("metadata error: {0}")]
    Metadata(String),
}

/// Read/write access to the per-`(team, project)` config blob.
///
/// `read_config` returns `None` when no blob exists yet, so callers can
/// fall back to an empty config.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Reads the blob, `None` when absent.
    async fn read_config(&self, team: &str, project: &str) -> Result<Option<Vec<u8>>>;
    /// Writes the blob.
    async fn save_config(&self, team: &str, project: &str, data: &[u8]) -> Result<()>;
}

#[async_trait]
impl ConfigStore for FsStorage {
    async fn read_config(&self, team: &str, project: &str) -> Result<Option<Vec<u8>>> {
        match FsStorage::read_config(self, team, project) {
            Ok(data) => Ok(Some(data)),
            Err(StorageError::ConfigDoesNotExist) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_config(&self, team: &str, project: &str, data: &[u8]) -> Result<()> {
        FsStorage::save_config(self, team, project, data)?;
        Ok(())
    }
}
