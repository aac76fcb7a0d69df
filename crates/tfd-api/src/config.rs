//! Controller configuration.
//!
//! Resolution order: defaults ← environment (`TFD_*`) ← CLI flags ← YAML
//! file, each layer overriding the previous when it sets a value. The
//! YAML file path itself comes from `--config_file` or `TFD_CONFIG_FILE`.

use std::net::IpAddr;
use std::path::Path;

use clap::Parser;
use serde::Deserialize;

use tfd_storage::FsStorageConfig;

/// The result type used during configuration resolution.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration errors; any of these terminates startup non-zero.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// An environment variable could not be parsed.
    #[error("invalid environment value for {name}: {message}")]
    Env {
        /// Variable name.
        name: &'static str,
        /// Parse failure description.
        message: String,
    },

    /// The YAML config file could not be read or parsed.
    #[error("config file error: {0}")]
    File(String),
}

/// Command-line flags. Every flag has a matching `TFD_*` environment
/// variable; flags override the environment.
#[derive(Debug, Default, Parser)]
#[command(name = "tfd", version, about = "Deployment controller for model-serving fleets")]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long = "config_file")]
    pub config_file: Option<String>,
    /// Listen host.
    #[arg(long = "listen_host")]
    pub listen_host: Option<String>,
    /// Listen port.
    #[arg(long = "listen_port")]
    pub listen_port: Option<u16>,
    /// Seconds between periodic fleet reconciliations.
    #[arg(long = "reload_interval_in_sec")]
    pub reload_interval_in_sec: Option<u64>,
    /// Maximum seconds one auto-reload pass may hold the reconcile lock.
    #[arg(long = "max_auto_reload_duration_in_sec")]
    pub max_auto_reload_duration_in_sec: Option<u64>,
    /// Seconds after which an upload request is interrupted.
    #[arg(long = "upload_timeout_in_sec")]
    pub upload_timeout_in_sec: Option<u64>,
    /// Label applied to uploads that name none.
    #[arg(long = "default_model_label")]
    pub default_model_label: Option<String>,
    /// Assume instances accept labels for versions they have not loaded.
    #[arg(long = "tfs_allows_labels_for_unavailable_models")]
    pub allow_labels_for_unavailable_models: Option<bool>,
    /// Discovery source (dns or plaintext).
    #[arg(long = "discovery")]
    pub discovery: Option<String>,
    /// Hosts file for plaintext discovery.
    #[arg(long = "discovery_plaintext_hosts_path")]
    pub discovery_plaintext_hosts_path: Option<String>,
    /// DNS service suffix, with or without a leading dot.
    #[arg(long = "discovery_dns_service_suffix")]
    pub discovery_dns_service_suffix: Option<String>,
    /// Instance port used when SRV records are unavailable.
    #[arg(long = "discovery_dns_default_instance_port")]
    pub discovery_dns_default_instance_port: Option<u16>,
    /// Storage backend (filesystem).
    #[arg(long = "storage")]
    pub storage: Option<String>,
    /// Base path for the storage trees.
    #[arg(long = "storage_filesystem_base_path")]
    pub storage_filesystem_base_path: Option<String>,
    /// Metadata backend (sqldb).
    #[arg(long = "metadata")]
    pub metadata: Option<String>,
    /// SQL driver (sqlite3).
    #[arg(long = "metadata_sqldb_driver")]
    pub metadata_sqldb_driver: Option<String>,
    /// Data source name.
    #[arg(long = "metadata_sqldb_dsn")]
    pub metadata_sqldb_dsn: Option<String>,
}

/// Resolved controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application-level settings.
    pub app: AppConfig,
    /// Discovery settings.
    pub discovery: DiscoveryConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Metadata settings.
    pub metadata: MetadataConfig,
}

/// Application-level settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Listen host.
    pub listen_host: String,
    /// Listen port.
    pub listen_port: u16,
    /// Seconds between periodic reconciliations.
    pub reload_interval_in_sec: u64,
    /// Maximum seconds one auto-reload pass may run.
    pub max_auto_reload_duration_in_sec: u64,
    /// Seconds after which an upload is interrupted.
    pub upload_timeout_in_sec: u64,
    /// Label applied to uploads that name none.
    pub default_model_label: String,
    /// Assume instances accept labels for unavailable versions.
    pub allow_labels_for_unavailable_models: bool,
    /// Discovery source name.
    pub discovery: String,
    /// Storage backend name.
    pub storage: String,
    /// Metadata backend name.
    pub metadata: String,
}

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Plaintext source settings.
    pub plaintext: PlaintextConfig,
    /// DNS source settings.
    pub dns: DnsConfig,
}

/// Plaintext discovery settings.
#[derive(Debug, Clone)]
pub struct PlaintextConfig {
    /// Hosts file path.
    pub hosts_path: String,
}

/// DNS discovery settings.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Service suffix appended to instance names.
    pub service_suffix: String,
    /// Port used when SRV records are unavailable.
    pub default_instance_port: u16,
}

/// Storage settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Filesystem backend settings.
    pub filesystem: FilesystemConfig,
}

/// Filesystem storage settings.
#[derive(Debug, Clone)]
pub struct FilesystemConfig {
    /// Base directory holding the models/modules/incoming trees.
    pub base_path: String,
    /// Octal directory permissions, e.g. `0755`.
    pub directory_permissions: String,
    /// Octal file permissions, e.g. `0644`.
    pub file_permissions: String,
}

/// Metadata settings.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// SQL backend settings.
    pub sqldb: SqlDbConfig,
}

/// SQL metadata settings.
#[derive(Debug, Clone)]
pub struct SqlDbConfig {
    /// Driver name.
    pub driver: String,
    /// Data source name.
    pub dsn: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig {
                listen_host: "0.0.0.0".into(),
                listen_port: 9500,
                reload_interval_in_sec: 300,
                max_auto_reload_duration_in_sec: 900,
                upload_timeout_in_sec: 300,
                default_model_label: "canary".into(),
                allow_labels_for_unavailable_models: false,
                discovery: "dns".into(),
                storage: "filesystem".into(),
                metadata: "sqldb".into(),
            },
            discovery: DiscoveryConfig {
                plaintext: PlaintextConfig {
                    hosts_path: "hosts".into(),
                },
                dns: DnsConfig {
                    service_suffix: String::new(),
                    default_instance_port: 8500,
                },
            },
            storage: StorageConfig {
                filesystem: FilesystemConfig {
                    base_path: "/tfdeploy".into(),
                    directory_permissions: "0755".into(),
                    file_permissions: "0644".into(),
                },
            },
            metadata: MetadataConfig {
                sqldb: SqlDbConfig {
                    driver: "sqlite3".into(),
                    dsn: "metadata.db".into(),
                },
            },
        }
    }
}

impl StorageConfig {
    /// Derives the storage tree configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparsable permission bits.
    pub fn to_storage_config(&self) -> Result<FsStorageConfig> {
        let dir_perm = parse_perm(&self.filesystem.directory_permissions)?;
        let file_perm = parse_perm(&self.filesystem.file_permissions)?;

        let mut config = FsStorageConfig::under_base(Path::new(&self.filesystem.base_path));
        config.model.dir_perm = dir_perm;
        config.model.file_perm = file_perm;
        config.module.dir_perm = dir_perm;
        config.module.file_perm = file_perm;
        Ok(config)
    }
}

fn parse_perm(value: &str) -> Result<u32> {
    u32::from_str_radix(value, 8)
        .map_err(|_| ConfigError::Invalid(format!("permissions must be octal, got {value}")))
}

// ============================================================================
// YAML overlay
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FileOverlay {
    application: AppOverlay,
    discovery: DiscoveryOverlay,
    storage: StorageOverlay,
    metadata: MetadataOverlay,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AppOverlay {
    listen_host: Option<String>,
    listen_port: Option<u16>,
    reload_interval_in_sec: Option<u64>,
    max_auto_reload_duration_in_sec: Option<u64>,
    upload_timeout_in_sec: Option<u64>,
    default_model_label: Option<String>,
    #[serde(rename = "tfsAllowsLabelsForUnavailableModels")]
    allow_labels_for_unavailable_models: Option<bool>,
    discovery: Option<String>,
    storage: Option<String>,
    metadata: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DiscoveryOverlay {
    plaintext: PlaintextOverlay,
    dns: DnsOverlay,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PlaintextOverlay {
    hosts_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DnsOverlay {
    service_suffix: Option<String>,
    default_instance_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StorageOverlay {
    filesystem: FilesystemOverlay,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FilesystemOverlay {
    base: BaseOverlay,
    model: TreeOverlay,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BaseOverlay {
    base_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TreeOverlay {
    directory_permissions: Option<String>,
    file_permissions: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MetadataOverlay {
    sqldb: SqlDbOverlay,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SqlDbOverlay {
    driver: Option<String>,
    dsn: Option<String>,
}

// ============================================================================
// Resolution
// ============================================================================

impl Config {
    /// Resolves the full configuration for the given CLI flags.
    ///
    /// # Errors
    ///
    /// Returns the first environment, file, or validation error.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.apply_cli(cli);

        let config_file = cli.config_file.clone().or_else(|| env_string("TFD_CONFIG_FILE"));
        if let Some(path) = config_file {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::File(format!("{path}: {e}")))?;
            config.apply_yaml(&contents)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(host) = env_string("TFD_LISTEN_HOST") {
            self.app.listen_host = host;
        }
        if let Some(port) = env_u16("TFD_LISTEN_PORT")? {
            self.app.listen_port = port;
        }
        if let Some(secs) = env_u64("TFD_RELOAD_INTERVAL_IN_SEC")? {
            self.app.reload_interval_in_sec = secs;
        }
        if let Some(secs) = env_u64("TFD_MAX_AUTO_RELOAD_DURATION_IN_SEC")? {
            self.app.max_auto_reload_duration_in_sec = secs;
        }
        if let Some(secs) = env_u64("TFD_UPLOAD_TIMEOUT_IN_SEC")? {
            self.app.upload_timeout_in_sec = secs;
        }
        if let Some(label) = env_string("TFD_DEFAULT_MODEL_LABEL") {
            self.app.default_model_label = label;
        }
        if let Some(allow) = env_bool("TFD_TFS_ALLOWS_LABELS_FOR_UNAVAILABLE_MODELS")? {
            self.app.allow_labels_for_unavailable_models = allow;
        }
        if let Some(source) = env_string("TFD_DISCOVERY") {
            self.app.discovery = source;
        }
        if let Some(path) = env_string("TFD_DISCOVERY_PLAINTEXT_HOSTS_PATH") {
            self.discovery.plaintext.hosts_path = path;
        }
        if let Some(suffix) = env_string("TFD_DISCOVERY_DNS_SERVICE_SUFFIX") {
            self.discovery.dns.service_suffix = suffix;
        }
        if let Some(port) = env_u16("TFD_DISCOVERY_DNS_DEFAULT_INSTANCE_PORT")? {
            self.discovery.dns.default_instance_port = port;
        }
        if let Some(backend) = env_string("TFD_STORAGE") {
            self.app.storage = backend;
        }
        if let Some(path) = env_string("TFD_STORAGE_FILESYSTEM_BASE_PATH") {
            self.storage.filesystem.base_path = path;
        }
        if let Some(backend) = env_string("TFD_METADATA") {
            self.app.metadata = backend;
        }
        if let Some(driver) = env_string("TFD_METADATA_SQLDB_DRIVER") {
            self.metadata.sqldb.driver = driver;
        }
        if let Some(dsn) = env_string("TFD_METADATA_SQLDB_DSN") {
            self.metadata.sqldb.dsn = dsn;
        }
        Ok(())
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.listen_host {
            self.app.listen_host = host.clone();
        }
        if let Some(port) = cli.listen_port {
            self.app.listen_port = port;
        }
        if let Some(secs) = cli.reload_interval_in_sec {
            self.app.reload_interval_in_sec = secs;
        }
        if let Some(secs) = cli.max_auto_reload_duration_in_sec {
            self.app.max_auto_reload_duration_in_sec = secs;
        }
        if let Some(secs) = cli.upload_timeout_in_sec {
            self.app.upload_timeout_in_sec = secs;
        }
        if let Some(label) = &cli.default_model_label {
            self.app.default_model_label = label.clone();
        }
        if let Some(allow) = cli.allow_labels_for_unavailable_models {
            self.app.allow_labels_for_unavailable_models = allow;
        }
        if let Some(source) = &cli.discovery {
            self.app.discovery = source.clone();
        }
        if let Some(path) = &cli.discovery_plaintext_hosts_path {
            self.discovery.plaintext.hosts_path = path.clone();
        }
        if let Some(suffix) = &cli.discovery_dns_service_suffix {
            self.discovery.dns.service_suffix = suffix.clone();
        }
        if let Some(port) = cli.discovery_dns_default_instance_port {
            self.discovery.dns.default_instance_port = port;
        }
        if let Some(backend) = &cli.storage {
            self.app.storage = backend.clone();
        }
        if let Some(path) = &cli.storage_filesystem_base_path {
            self.storage.filesystem.base_path = path.clone();
        }
        if let Some(backend) = &cli.metadata {
            self.app.metadata = backend.clone();
        }
        if let Some(driver) = &cli.metadata_sqldb_driver {
            self.metadata.sqldb.driver = driver.clone();
        }
        if let Some(dsn) = &cli.metadata_sqldb_dsn {
            self.metadata.sqldb.dsn = dsn.clone();
        }
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let overlay: FileOverlay =
            serde_yaml::from_str(contents).map_err(|e| ConfigError::File(e.to_string()))?;

        let app = overlay.application;
        if let Some(host) = app.listen_host {
            self.app.listen_host = host;
        }
        if let Some(port) = app.listen_port {
            self.app.listen_port = port;
        }
        if let Some(secs) = app.reload_interval_in_sec {
            self.app.reload_interval_in_sec = secs;
        }
        if let Some(secs) = app.max_auto_reload_duration_in_sec {
            self.app.max_auto_reload_duration_in_sec = secs;
        }
        if let Some(secs) = app.upload_timeout_in_sec {
            self.app.upload_timeout_in_sec = secs;
        }
        if let Some(label) = app.default_model_label {
            self.app.default_model_label = label;
        }
        if let Some(allow) = app.allow_labels_for_unavailable_models {
            self.app.allow_labels_for_unavailable_models = allow;
        }
        if let Some(source) = app.discovery {
            self.app.discovery = source;
        }
        if let Some(backend) = app.storage {
            self.app.storage = backend;
        }
        if let Some(backend) = app.metadata {
            self.app.metadata = backend;
        }

        if let Some(path) = overlay.discovery.plaintext.hosts_path {
            self.discovery.plaintext.hosts_path = path;
        }
        if let Some(suffix) = overlay.discovery.dns.service_suffix {
            self.discovery.dns.service_suffix = suffix;
        }
        if let Some(port) = overlay.discovery.dns.default_instance_port {
            self.discovery.dns.default_instance_port = port;
        }

        if let Some(path) = overlay.storage.filesystem.base.base_path {
            self.storage.filesystem.base_path = path;
        }
        if let Some(perm) = overlay.storage.filesystem.model.directory_permissions {
            self.storage.filesystem.directory_permissions = perm;
        }
        if let Some(perm) = overlay.storage.filesystem.model.file_permissions {
            self.storage.filesystem.file_permissions = perm;
        }

        if let Some(driver) = overlay.metadata.sqldb.driver {
            self.metadata.sqldb.driver = driver;
        }
        if let Some(dsn) = overlay.metadata.sqldb.dsn {
            self.metadata.sqldb.dsn = dsn;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.app
            .listen_host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::Invalid("listen_host must be an IP address".into()))?;

        if self.app.reload_interval_in_sec < 1 {
            return Err(ConfigError::Invalid(
                "reload_interval_in_sec must be at least 1".into(),
            ));
        }
        if self.app.max_auto_reload_duration_in_sec < 900 {
            return Err(ConfigError::Invalid(
                "max_auto_reload_duration_in_sec must be at least 900".into(),
            ));
        }
        if self.app.upload_timeout_in_sec < 1 {
            return Err(ConfigError::Invalid(
                "upload_timeout_in_sec must be at least 1".into(),
            ));
        }
        if self.app.default_model_label.is_empty() || self.app.default_model_label.len() > 32 {
            return Err(ConfigError::Invalid(
                "default_model_label must be between 1 and 32 characters".into(),
            ));
        }
        if !matches!(self.app.discovery.as_str(), "dns" | "plaintext") {
            return Err(ConfigError::Invalid(format!(
                "unsupported discovery source: {}",
                self.app.discovery
            )));
        }
        if self.app.storage != "filesystem" {
            return Err(ConfigError::Invalid(format!(
                "unsupported storage backend: {}",
                self.app.storage
            )));
        }
        if self.app.metadata != "sqldb" {
            return Err(ConfigError::Invalid(format!(
                "unsupported metadata backend: {}",
                self.app.metadata
            )));
        }
        if !(1000..=65535).contains(&self.discovery.dns.default_instance_port) {
            return Err(ConfigError::Invalid(
                "discovery_dns_default_instance_port must be between 1000 and 65535".into(),
            ));
        }
        parse_perm(&self.storage.filesystem.directory_permissions)?;
        parse_perm(&self.storage.filesystem.file_permissions)?;
        Ok(())
    }
}

// ============================================================================
// Environment helpers
// ============================================================================

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &'static str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>().map(Some).map_err(|e| ConfigError::Env {
        name,
        message: e.to_string(),
    })
}

fn env_u64(name: &'static str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>().map(Some).map_err(|e| ConfigError::Env {
        name,
        message: e.to_string(),
    })
}

fn env_bool(name: &'static str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(Some(true)),
        "false" | "0" | "no" | "n" => Ok(Some(false)),
        _ => Err(ConfigError::Env {
            name,
            message: "must be a boolean (true/false/1/0)".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn cli_overrides_defaults() {
        let cli = Cli {
            listen_port: Some(9600),
            default_model_label: Some("preview".into()),
            discovery: Some("plaintext".into()),
            ..Cli::default()
        };

        let mut config = Config::default();
        config.apply_cli(&cli);
        assert_eq!(config.app.listen_port, 9600);
        assert_eq!(config.app.default_model_label, "preview");
        assert_eq!(config.app.discovery, "plaintext");
        // untouched fields keep their defaults
        assert_eq!(config.app.reload_interval_in_sec, 300);
    }

    #[test]
    fn yaml_overrides_cli_values() {
        let cli = Cli {
            listen_port: Some(9600),
            ..Cli::default()
        };
        let mut config = Config::default();
        config.apply_cli(&cli);

        config
            .apply_yaml(
                "application:\n  listenPort: 9700\n  defaultModelLabel: preview\n\
                 metadata:\n  sqldb:\n    dsn: /var/lib/tfd/metadata.db\n",
            )
            .unwrap();

        assert_eq!(config.app.listen_port, 9700);
        assert_eq!(config.app.default_model_label, "preview");
        assert_eq!(config.metadata.sqldb.dsn, "/var/lib/tfd/metadata.db");
    }

    #[test]
    fn yaml_accepts_nested_storage_and_flags() {
        let mut config = Config::default();
        config
            .apply_yaml(
                "application:\n  tfsAllowsLabelsForUnavailableModels: true\n\
                 storage:\n  filesystem:\n    base:\n      basePath: /srv/tfd\n\
                 discovery:\n  dns:\n    defaultInstancePort: 9000\n",
            )
            .unwrap();

        assert!(config.app.allow_labels_for_unavailable_models);
        assert_eq!(config.storage.filesystem.base_path, "/srv/tfd");
        assert_eq!(config.discovery.dns.default_instance_port, 9000);
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.app.max_auto_reload_duration_in_sec = 60;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.app.discovery = "consul".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.dns.default_instance_port = 80;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.app.listen_host = "localhost".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn permissions_parse_as_octal() {
        assert_eq!(parse_perm("0755").unwrap(), 0o755);
        assert_eq!(parse_perm("644").unwrap(), 0o644);
        assert!(parse_perm("rwxr-xr-x").is_err());

        let storage = StorageConfig {
            filesystem: FilesystemConfig {
                base_path: "/srv/tfd".into(),
                directory_permissions: "0750".into(),
                file_permissions: "0640".into(),
            },
        };
        let fs = storage.to_storage_config().unwrap();
        assert_eq!(fs.model.dir_perm, 0o750);
        assert_eq!(fs.module.file_perm, 0o640);
        assert!(fs.model.base_path.ends_with("models"));
        assert!(fs.module.incoming_path.ends_with("incoming/modules"));
    }
}
