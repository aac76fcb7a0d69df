//! Mutexed read-modify-write access to the config blob.
//!
//! Every mutating call re-reads the blob, mutates it, and writes it back
//! while holding the internal mutex, so in-process writers cannot
//! interleave. Cross-operation ordering for one servable is provided by
//! the caller's per-servable lock.

use std::sync::Arc;

use tokio::sync::Mutex;

use tfd_core::{ModelId, STABLE_LABEL};

use crate::config::{
    ModelConfig, ModelServerConfig, ModelVersionPolicy, SpecificVersions, MODEL_PLATFORM,
};
use crate::{ConfigStore, Result, ServingError};

/// Accessor for the per-`(team, project)` config blob.
pub struct ServableConfig {
    storage: Arc<dyn ConfigStore>,
    default_label: String,
    guard: Mutex<()>,
}

impl std::fmt::Debug for ServableConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServableConfig")
            .field("default_label", &self.default_label)
            .finish_non_exhaustive()
    }
}

impl ServableConfig {
    /// Creates an accessor over the given config storage.
    #[must_use]
    pub fn new(storage: Arc<dyn ConfigStore>, default_label: impl Into<String>) -> Self {
        Self {
            storage,
            default_label: default_label.into(),
            guard: Mutex::new(()),
        }
    }

    /// Returns the label applied when an upload names none.
    #[must_use]
    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    async fn read(&self, team: &str, project: &str) -> Result<Option<ModelServerConfig>> {
        let data = self.storage.read_config(team, project).await?;
        match data {
            None => Ok(None),
            Some(bytes) => Ok(Some(ModelServerConfig::from_bytes(Some(&bytes))?)),
        }
    }

    async fn write(&self, team: &str, project: &str, config: &ModelServerConfig) -> Result<()> {
        self.storage
            .save_config(team, project, &config.to_bytes()?)
            .await
    }

    /// Reads the blob, `None` when no config exists yet.
    ///
    /// # Errors
    ///
    /// Returns storage or serialization errors.
    pub async fn try_config(&self, team: &str, project: &str) -> Result<Option<ModelServerConfig>> {
        let _guard = self.guard.lock().await;
        self.read(team, project).await
    }

    /// Reads the blob, falling back to the empty config when absent.
    ///
    /// # Errors
    ///
    /// Returns storage or serialization errors.
    pub async fn config(&self, team: &str, project: &str) -> Result<ModelServerConfig> {
        Ok(self.try_config(team, project).await?.unwrap_or_default())
    }

    /// Reads the blob with every label map cleared.
    ///
    /// # Errors
    ///
    /// Returns storage or serialization errors.
    pub async fn config_without_labels(
        &self,
        team: &str,
        project: &str,
    ) -> Result<ModelServerConfig> {
        Ok(self.config(team, project).await?.without_labels())
    }

    /// Renders the blob's text form for human inspection.
    ///
    /// # Errors
    ///
    /// Returns storage or serialization errors.
    pub async fn config_file_stream(&self, team: &str, project: &str) -> Result<Vec<u8>> {
        self.config(team, project).await?.to_text()
    }

    /// Adds an uploaded version to the blob.
    ///
    /// An existing entry gets the version appended and, when it already
    /// carries labels, the (possibly defaulted) label repointed. A new
    /// entry is created with `versions = [1]` and the label carrying the
    /// true version; see the module docs of [`crate::config`].
    ///
    /// # Errors
    ///
    /// Returns [`ServingError::VersionNotFound`] when an existing entry
    /// has an empty label map, or storage errors.
    pub async fn add_model(&self, model: &ModelId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let team = &model.id.team;
        let project = &model.id.project;
        let mut config = self.read(team, project).await?.unwrap_or_default();

        let label = if model.label.is_empty() {
            self.default_label.clone()
        } else {
            model.label.clone()
        };

        if let Some(entry) = config.entry_mut(&model.id.name) {
            entry
                .model_version_policy
                .specific
                .versions
                .push(model.version);

            if entry.version_labels.is_empty() {
                return Err(ServingError::VersionNotFound);
            }
            entry.version_labels.insert(label, model.version);

            return self.write(team, project, &config).await;
        }

        config.model_config_list.config.push(ModelConfig {
            name: model.id.name.clone(),
            base_path: ModelConfig::base_path_for(&model.id),
            model_platform: MODEL_PLATFORM.into(),
            model_version_policy: ModelVersionPolicy {
                specific: SpecificVersions { versions: vec![1] },
            },
            version_labels: [(label, model.version)].into_iter().collect(),
        });

        self.write(team, project, &config).await
    }

    /// Points `model.label` at `model.version`, returning the version it
    /// aliased before (0 when none).
    ///
    /// # Errors
    ///
    /// Returns [`ServingError::UpdateLabel`] when the name has no entry,
    /// or storage errors.
    pub async fn update_label(&self, model: &ModelId) -> Result<i64> {
        let _guard = self.guard.lock().await;
        let team = &model.id.team;
        let project = &model.id.project;
        let mut config = self.read(team, project).await?.unwrap_or_default();

        let Some(entry) = config.entry_mut(&model.id.name) else {
            return Err(ServingError::UpdateLabel);
        };

        let previous = entry
            .version_labels
            .insert(model.label.clone(), model.version)
            .unwrap_or(0);

        self.write(team, project, &config).await?;
        Ok(previous)
    }

    /// Drops a version from the blob, stripping labels that alias it.
    ///
    /// A version still aliased by `stable` is protected. An absent
    /// version is a silent no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ServingError::StableLabelProtects`] for the protected
    /// case, [`ServingError::VersionNotFound`] when the entry has no
    /// label map, or storage errors.
    pub async fn remove_model(&self, model: &ModelId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let team = &model.id.team;
        let project = &model.id.project;
        let mut config = self.read(team, project).await?.unwrap_or_default();

        let Some(entry) = config.entry_mut(&model.id.name) else {
            return Ok(());
        };

        if entry.version_labels.is_empty() {
            return Err(ServingError::VersionNotFound);
        }
        if entry.version_labels.get(STABLE_LABEL) == Some(&model.version) {
            return Err(ServingError::StableLabelProtects);
        }

        let versions = &mut entry.model_version_policy.specific.versions;
        let before = versions.len();
        versions.retain(|&v| v != model.version);

        if versions.len() == before {
            tracing::debug!(
                model = %model.id,
                version = model.version,
                "remove_model exit without any changes"
            );
            return Ok(());
        }

        entry
            .version_labels
            .retain(|_, &mut version| version != model.version);

        self.write(team, project, &config).await
    }

    /// Drops a label from the blob; the version set is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ServingError::VersionNotFound`] when the label (or the
    /// entry's label map) is missing, [`ServingError::StableLabelProtects`]
    /// when the aliased version is still `stable`, or storage errors.
    pub async fn remove_model_label(&self, model: &ModelId) -> Result<()> {
        let _guard = self.guard.lock().await;
        let team = &model.id.team;
        let project = &model.id.project;
        let mut config = self.read(team, project).await?.unwrap_or_default();

        let Some(entry) = config.entry_mut(&model.id.name) else {
            return Ok(());
        };

        if entry.version_labels.is_empty() {
            return Err(ServingError::VersionNotFound);
        }
        let Some(&aliased) = entry.version_labels.get(&model.label) else {
            return Err(ServingError::VersionNotFound);
        };
        if entry.version_labels.get(STABLE_LABEL) == Some(&aliased) {
            return Err(ServingError::StableLabelProtects);
        }

        entry.version_labels.remove(&model.label);
        self.write(team, project, &config).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::{ConfigStore, Result};

    /// In-memory config store for unit tests.
    #[derive(Default)]
    pub(crate) struct MemoryConfigStore {
        blobs: StdMutex<HashMap<(String, String), Vec<u8>>>,
    }

    #[async_trait]
    impl ConfigStore for MemoryConfigStore {
        async fn read_config(&self, team: &str, project: &str) -> Result<Option<Vec<u8>>> {
            Ok(self
                .blobs
                .lock()
                .unwrap()
                .get(&(team.to_string(), project.to_string()))
                .cloned())
        }

        async fn save_config(&self, team: &str, project: &str, data: &[u8]) -> Result<()> {
            self.blobs
                .lock()
                .unwrap()
                .insert((team.to_string(), project.to_string()), data.to_vec());
            Ok(())
        }
    }
}
