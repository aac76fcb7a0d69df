//! Serving instance discovery.
//!
//! Resolves a `(team, project)` servable to the set of `ip:port` endpoints
//! currently running its serving instances. Two sources exist: DNS
//! (SRV records with an A/AAAA fallback) and a plaintext hosts file.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod dns;
pub mod plaintext;

use async_trait::async_trait;

use tfd_core::ServableId;

pub use dns::DnsDiscovery;
pub use plaintext::PlaintextDiscovery;

/// The result type used by discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors raised while resolving serving instances.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Neither SRV nor host lookup produced any endpoint.
    #[error("instance not found")]
    InstanceNotFound,

    /// A hosts file line carried a malformed `ip:port` endpoint.
    #[error("instance's address is invalid line {line}, address {address}")]
    InvalidInstanceAddress {
        /// 1-based line number in the hosts file.
        line: usize,
        /// The offending token.
        address: String,
    },

    /// A hosts file line did not start with a valid instance name.
    #[error("instance name is invalid")]
    InvalidInstanceName,

    /// A hosts file line was empty where a record was expected.
    #[error("instance name is empty")]
    InstanceNameIsEmpty,

    /// A hosts file record carried no endpoints after the instance name.
    #[error("not found instance's address")]
    NotFoundInstanceAddress,

    /// The configured discovery source name is not recognised.
    #[error("package discovery is unknown: {0}")]
    UnknownSource(String),

    /// The resolver failed.
    #[error("resolve error: {0}")]
    Resolve(String),

    /// Reading the hosts file failed.
    #[error("hosts file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves a servable to its serving instance endpoints.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Returns the `ip:port` endpoints serving the given servable.
    async fn discover(&self, id: &ServableId) -> Result<Vec<String>>;
}

/// Recognised discovery source names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// DNS SRV / A records.
    Dns,
    /// Plaintext hosts file.
    Plaintext,
}

impl Source {
    /// Parses a source name from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::UnknownSource`] for anything other than
    /// `dns` or `plaintext`.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "dns" => Ok(Self::Dns),
            "plaintext" => Ok(Self::Plaintext),
            other => Err(DiscoveryError::UnknownSource(other.to_string())),
        }
    }

    /// Returns the configuration name of this source.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Plaintext => "plaintext",
        }
    }
}
