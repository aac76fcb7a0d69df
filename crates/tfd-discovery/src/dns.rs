//! DNS-backed discovery.
//!
//! First queries the SRV record `_{instance}._tcp.{suffix}`; every SRV
//! target is expanded to addresses with the SRV port. When SRV yields
//! nothing, falls back to an A/AAAA lookup of `{instance}{suffix}` with
//! the configured default port.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;

use tfd_core::ServableId;

use crate::{Discoverer, DiscoveryError, Result};

/// Discovery via DNS SRV records with an A/AAAA fallback.
pub struct DnsDiscovery {
    service_suffix: String,
    default_instance_port: u16,
    resolver: TokioAsyncResolver,
}

impl std::fmt::Debug for DnsDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsDiscovery")
            .field("service_suffix", &self.service_suffix)
            .field("default_instance_port", &self.default_instance_port)
            .finish_non_exhaustive()
    }
}

impl DnsDiscovery {
    /// Creates a resolver from the system configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Resolve`] when the OS resolver
    /// configuration cannot be read.
    pub fn new(service_suffix: impl Into<String>, default_instance_port: u16) -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| DiscoveryError::Resolve(e.to_string()))?;
        Ok(Self {
            service_suffix: service_suffix.into(),
            default_instance_port,
            resolver,
        })
    }

    async fn lookup_srv(&self, service: &str) -> Result<Vec<String>> {
        let query = format!("_{service}._tcp.{}", self.service_suffix);
        let srv = self
            .resolver
            .srv_lookup(query)
            .await
            .map_err(|e| DiscoveryError::Resolve(e.to_string()))?;

        let records: Vec<_> = srv.iter().collect();
        if records.is_empty() {
            return Err(DiscoveryError::InstanceNotFound);
        }

        let mut instances = Vec::new();
        for record in records {
            let target = record.target().to_utf8();
            let expanded = self.lookup_host(&target, record.port()).await?;
            instances.extend(expanded);
        }
        Ok(instances)
    }

    async fn lookup_host(&self, host: &str, port: u16) -> Result<Vec<String>> {
        let addrs = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| DiscoveryError::Resolve(e.to_string()))?;

        let instances: Vec<String> = addrs.iter().map(|ip| format!("{ip}:{port}")).collect();
        if instances.is_empty() {
            return Err(DiscoveryError::InstanceNotFound);
        }
        Ok(instances)
    }
}

#[async_trait]
impl Discoverer for DnsDiscovery {
    async fn discover(&self, id: &ServableId) -> Result<Vec<String>> {
        match self.lookup_srv(&id.instance_name()).await {
            Ok(instances) => return Ok(instances),
            Err(err) => tracing::debug!(instance = %id.instance_name(), error = %err, "SRV lookup failed"),
        }

        let host = id.instance_host(&self.service_suffix);
        match self.lookup_host(&host, self.default_instance_port).await {
            Ok(instances) => Ok(instances),
            Err(err) => {
                tracing::debug!(host = %host, error = %err, "host lookup failed");
                Err(DiscoveryError::InstanceNotFound)
            }
        }
    }
}
