//! Model lifecycle orchestration.

use std::sync::Arc;

use tfd_core::{LabelChanged, ModelId, ServableId, LAST_STABLE_LABEL, STABLE_LABEL};
use tfd_metadata::{ModelMetadata, ModelRecord, QueryFilter, Status};
use tfd_serving::{Reloader, ServableConfig};
use tfd_storage::FsStorage;

use super::{clean_list, Archive, Result, ServiceError};

/// Orchestrates model uploads, labels, removal, and reloads.
pub struct ModelService {
    metadata: Arc<dyn ModelMetadata>,
    storage: Arc<FsStorage>,
    servable_config: Arc<ServableConfig>,
    reloader: Arc<Reloader>,
}

impl std::fmt::Debug for ModelService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelService").finish_non_exhaustive()
    }
}

impl ModelService {
    /// Creates the service over its collaborators.
    #[must_use]
    pub fn new(
        metadata: Arc<dyn ModelMetadata>,
        storage: Arc<FsStorage>,
        servable_config: Arc<ServableConfig>,
        reloader: Arc<Reloader>,
    ) -> Self {
        Self {
            metadata,
            storage,
            servable_config,
            reloader,
        }
    }

    fn archive_prefix() -> &'static str {
        "model"
    }

    /// Commits an uploaded archive as the servable's next version.
    ///
    /// The storage pipeline validates and installs the archive; the
    /// metadata row is created `Pending`, promoted to `Ready` once the
    /// config blob and labelled alias row are committed. A failed
    /// metadata insert compensates by removing the installed version.
    ///
    /// # Errors
    ///
    /// Returns the first failing stage's error; state changes made
    /// before the failure are rolled back where possible.
    pub async fn upload_model(
        &self,
        id: &ServableId,
        archive: &[u8],
        label: Option<&str>,
    ) -> Result<ModelId> {
        let version = self.metadata.next_version(&QueryFilter::servable(id))?;

        self.storage.save_model_archive(id, version, archive)?;

        let anchor = ModelId::new(id.clone(), version);
        let meta_id = match self.metadata.add(&anchor, Status::Pending) {
            Ok(meta_id) => meta_id,
            Err(err) => {
                if let Err(remove_err) = self.storage.remove_model(id, version) {
                    tracing::error!(
                        model = %id,
                        version,
                        error = %remove_err,
                        "failed to compensate storage after metadata insert failure"
                    );
                }
                return Err(err.into());
            }
        };

        let label = match label {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => self.servable_config.default_label().to_string(),
        };
        let labelled = ModelId::with_label(id.clone(), version, label);

        self.servable_config.add_model(&labelled).await?;
        self.metadata.update_status(meta_id, Status::Ready)?;
        self.metadata.change_label(&labelled, Status::Ready)?;

        Ok(anchor)
    }

    /// Points a label at a version.
    ///
    /// Promoting to `stable` additionally records the previously stable
    /// version under `last_stable` for the revert protocol.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ModelNotFound`] when the anchor row is
    /// missing, or the underlying config/metadata error.
    pub async fn set_label(&self, model: &ModelId) -> Result<LabelChanged> {
        let filter = QueryFilter::servable(&model.id).with_version(model.version);
        if self.metadata.get(&filter)?.is_none() {
            return Err(ServiceError::ModelNotFound);
        }

        let previous = self.servable_config.update_label(model).await?;
        self.metadata.change_label(model, Status::Ready)?;

        if model.label == STABLE_LABEL && previous != 0 {
            let last_stable =
                ModelId::with_label(model.id.clone(), previous, LAST_STABLE_LABEL);
            self.metadata.change_label(&last_stable, Status::Ready)?;
        }

        Ok(LabelChanged {
            id: model.id.clone(),
            label: model.label.clone(),
            previous_version: previous,
            new_version: model.version,
        })
    }

    /// Swaps `stable` back to the `last_stable` version.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::StableModelNotFound`] or
    /// [`ServiceError::LastStableModelNotFound`] when either slot is
    /// empty, or the underlying error.
    pub async fn revert(&self, id: &ServableId) -> Result<LabelChanged> {
        let stable_filter = QueryFilter::servable(id).with_label(STABLE_LABEL);
        let current_stable = self
            .metadata
            .get(&stable_filter)?
            .ok_or(ServiceError::StableModelNotFound)?;

        let last_stable_filter = QueryFilter::servable(id).with_label(LAST_STABLE_LABEL);
        let last_stable = self
            .metadata
            .get(&last_stable_filter)?
            .ok_or(ServiceError::LastStableModelNotFound)?;

        let model = ModelId::with_label(id.clone(), last_stable.model.version, STABLE_LABEL);
        self.servable_config.update_label(&model).await?;
        self.metadata.delete(last_stable.id)?;
        self.metadata.change_label(&model, Status::Ready)?;

        Ok(LabelChanged {
            id: id.clone(),
            label: STABLE_LABEL.to_string(),
            previous_version: current_stable.model.version,
            new_version: model.version,
        })
    }

    /// Removes the version aliased by `label`.
    ///
    /// # Errors
    ///
    /// See [`ModelService::remove_model`].
    pub async fn remove_by_label(&self, id: &ServableId, label: &str) -> Result<()> {
        let filter = QueryFilter::servable(id).with_label(label);
        self.remove_model(id, &filter).await
    }

    /// Removes a version by number.
    ///
    /// # Errors
    ///
    /// See [`ModelService::remove_model`].
    pub async fn remove_by_version(&self, id: &ServableId, version: i64) -> Result<()> {
        let filter = QueryFilter::servable(id).with_version(version);
        self.remove_model(id, &filter).await
    }

    /// Shared removal path: drop from config, push a labels-only reload
    /// so instances unload the version, remove the files, delete every
    /// matching metadata row.
    async fn remove_model(&self, id: &ServableId, filter: &QueryFilter) -> Result<()> {
        let records = self.metadata.list(filter)?;
        if records.is_empty() {
            return Err(ServiceError::ModelNotFound);
        }

        let mut version = -1;
        for record in &records {
            if version < 0 {
                version = record.model.version;
            } else if version != record.model.version {
                tracing::warn!(
                    model = %id.instance_name(),
                    "got different versions [{} and {}] for model",
                    version,
                    record.model.version
                );
            }
        }

        let target = ModelId::new(id.clone(), version);
        self.servable_config.remove_model(&target).await?;
        self.reloader.reload_models(&id.team, &id.project, true).await?;
        self.storage.remove_model(id, version)?;

        for record in &records {
            self.metadata.delete(record.id)?;
        }
        Ok(())
    }

    /// Removes a label alias; the version and its files remain.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ModelNotFound`] when no labelled row
    /// exists, or the underlying error.
    pub async fn remove_model_label(&self, id: &ServableId, label: &str) -> Result<()> {
        let filter = QueryFilter::servable(id).with_label(label);
        let record = self
            .metadata
            .get(&filter)?
            .ok_or(ServiceError::ModelNotFound)?;

        let target = ModelId::with_label(id.clone(), record.model.version, record.model.label);
        self.servable_config.remove_model_label(&target).await?;
        self.metadata.remove_label(&target)?;
        Ok(())
    }

    /// Packages the version aliased by `label` for download.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ModelNotFound`] when no row matches.
    pub async fn archive_by_label(&self, id: &ServableId, label: &str) -> Result<Archive> {
        let filter = QueryFilter::servable(id).with_label(label);
        let record = self
            .metadata
            .get(&filter)?
            .ok_or(ServiceError::ModelNotFound)?;

        let data = self.storage.read_model(id, record.model.version)?;
        Ok(Archive {
            data,
            name: id.archive_name(Self::archive_prefix(), record.model.version),
        })
    }

    /// Packages a version for download.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ModelNotFound`] when no row matches.
    pub async fn archive_by_version(&self, id: &ServableId, version: i64) -> Result<Archive> {
        let filter = QueryFilter::servable(id).with_version(version);
        if self.metadata.get(&filter)?.is_none() {
            return Err(ServiceError::ModelNotFound);
        }

        let data = self.storage.read_model(id, version)?;
        Ok(Archive {
            data,
            name: id.archive_name(Self::archive_prefix(), version),
        })
    }

    /// Lists models matching the filter, anchor rows cleaned.
    ///
    /// # Errors
    ///
    /// Returns metadata errors.
    pub fn list_models(&self, filter: &QueryFilter) -> Result<Vec<ModelRecord>> {
        Ok(clean_list(self.metadata.list(filter)?))
    }

    /// Lists a project's models.
    ///
    /// # Errors
    ///
    /// Returns metadata errors.
    pub fn list_models_by_project(&self, team: &str, project: &str) -> Result<Vec<ModelRecord>> {
        let filter = QueryFilter::new().with_team(team).with_project(project);
        self.list_models(&filter)
    }

    /// Lists one servable's models.
    ///
    /// # Errors
    ///
    /// Returns metadata errors.
    pub fn list_models_by_name(&self, id: &ServableId) -> Result<Vec<ModelRecord>> {
        self.list_models(&QueryFilter::servable(id))
    }

    /// Streams the config blob's text form.
    ///
    /// # Errors
    ///
    /// Returns config storage errors.
    pub async fn config_stream(&self, team: &str, project: &str) -> Result<Vec<u8>> {
        Ok(self.servable_config.config_file_stream(team, project).await?)
    }

    /// Explicitly reloads a fleet.
    ///
    /// # Errors
    ///
    /// Returns [`tfd_serving::ServingError::ReloadFailed`] when any
    /// endpoint did not converge.
    pub async fn reload_models(
        &self,
        team: &str,
        project: &str,
        skip_short_config: bool,
    ) -> Result<()> {
        Ok(self
            .reloader
            .reload_models(team, project, skip_short_config)
            .await?)
    }
}
