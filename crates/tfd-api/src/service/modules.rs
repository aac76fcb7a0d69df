//! Module lifecycle orchestration.
//!
//! Modules follow the model upload pattern without labels, statuses, or
//! config blob participation.

use std::sync::Arc;

use tfd_core::{ModuleId, ServableId};
use tfd_metadata::{ModuleMetadata, ModuleRecord, QueryFilter};
use tfd_storage::FsStorage;

use super::{Archive, Result, ServiceError};

/// Orchestrates module uploads, listings, and removal.
pub struct ModuleService {
    metadata: Arc<dyn ModuleMetadata>,
    storage: Arc<FsStorage>,
}

impl std::fmt::Debug for ModuleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleService").finish_non_exhaustive()
    }
}

impl ModuleService {
    /// Creates the service over its collaborators.
    #[must_use]
    pub fn new(metadata: Arc<dyn ModuleMetadata>, storage: Arc<FsStorage>) -> Self {
        Self { metadata, storage }
    }

    fn archive_prefix() -> &'static str {
        "module"
    }

    /// Commits an uploaded archive as the module's next version.
    ///
    /// # Errors
    ///
    /// Returns the failing stage's error; a failed metadata insert
    /// compensates by removing the installed version.
    pub async fn upload_module(&self, id: &ServableId, archive: &[u8]) -> Result<ModuleId> {
        let version = self.metadata.next_version(&QueryFilter::servable(id))?;

        self.storage.save_module_archive(id, version, archive)?;

        let module = ModuleId {
            id: id.clone(),
            version,
        };
        if let Err(err) = self.metadata.add(&module) {
            if let Err(remove_err) = self.storage.remove_module(id, version) {
                tracing::error!(
                    module = %id,
                    version,
                    error = %remove_err,
                    "failed to compensate storage after metadata insert failure"
                );
            }
            return Err(err.into());
        }

        Ok(module)
    }

    /// Lists modules matching the filter.
    ///
    /// # Errors
    ///
    /// Returns metadata errors.
    pub fn list_modules(&self, filter: &QueryFilter) -> Result<Vec<ModuleRecord>> {
        Ok(self.metadata.list(filter)?)
    }

    /// Lists a project's modules.
    ///
    /// # Errors
    ///
    /// Returns metadata errors.
    pub fn list_modules_by_project(&self, team: &str, project: &str) -> Result<Vec<ModuleRecord>> {
        let filter = QueryFilter::new().with_team(team).with_project(project);
        self.list_modules(&filter)
    }

    /// Lists one module's versions.
    ///
    /// # Errors
    ///
    /// Returns metadata errors.
    pub fn list_modules_by_name(&self, id: &ServableId) -> Result<Vec<ModuleRecord>> {
        self.list_modules(&QueryFilter::servable(id))
    }

    /// Packages a version for download.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ModuleNotFound`] when no row matches.
    pub async fn archive_by_version(&self, id: &ServableId, version: i64) -> Result<Archive> {
        let filter = QueryFilter::servable(id).with_version(version);
        if self.metadata.get(&filter)?.is_none() {
            return Err(ServiceError::ModuleNotFound);
        }

        let data = self.storage.read_module(id, version)?;
        Ok(Archive {
            data,
            name: id.archive_name(Self::archive_prefix(), version),
        })
    }

    /// Removes a version: files first, then the metadata row.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ModuleNotFound`] when no row matches.
    pub async fn remove_by_version(&self, id: &ServableId, version: i64) -> Result<()> {
        let filter = QueryFilter::servable(id).with_version(version);
        let record = self
            .metadata
            .get(&filter)?
            .ok_or(ServiceError::ModuleNotFound)?;

        self.storage.remove_module(id, version)?;
        self.metadata.delete(record.id)?;
        Ok(())
    }
}
