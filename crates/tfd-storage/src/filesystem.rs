//! Filesystem-backed servable storage.
//!
//! Layout:
//!
//! ```text
//! {base}/models/{team}/{project}/models.config
//! {base}/models/{team}/{project}/{name}/{version}/…
//! {base}/incoming/models/{team}-{project}-{name}-{unix}/model_archive.tar
//! ```
//!
//! with a parallel `modules` subtree (no config blob).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use tfd_core::ServableId;

use crate::archive::{pack_dir, unpack_next_to, walk};
use crate::layout::is_model_layout_valid;
use crate::{Result, StorageError};

const EMPTY_CONFIG_CONTENT: &[u8] = b"{\"model_config_list\":{\"config\":[]}}\n";

/// Filesystem configuration for the model tree.
#[derive(Debug, Clone)]
pub struct ModelTreeConfig {
    /// Archive filename inside a staging directory.
    pub archive_name: String,
    /// Root of the versioned model tree.
    pub base_path: PathBuf,
    /// Per-(team, project) config blob filename.
    pub config_name: String,
    /// Filename of the seeded empty config.
    pub empty_config_name: String,
    /// Root of the staging tree for incoming archives.
    pub incoming_path: PathBuf,
    /// Mode bits for created directories.
    pub dir_perm: u32,
    /// Mode bits for created files.
    pub file_perm: u32,
}

/// Filesystem configuration for the module tree.
#[derive(Debug, Clone)]
pub struct ModuleTreeConfig {
    /// Archive filename inside a staging directory.
    pub archive_name: String,
    /// Root of the versioned module tree.
    pub base_path: PathBuf,
    /// Root of the staging tree for incoming archives.
    pub incoming_path: PathBuf,
    /// Mode bits for created directories.
    pub dir_perm: u32,
    /// Mode bits for created files.
    pub file_perm: u32,
}

/// Full filesystem storage configuration.
#[derive(Debug, Clone)]
pub struct FsStorageConfig {
    /// Model tree settings.
    pub model: ModelTreeConfig,
    /// Module tree settings.
    pub module: ModuleTreeConfig,
}

impl FsStorageConfig {
    /// Derives the conventional tree layout below a single base directory.
    #[must_use]
    pub fn under_base(base: &Path) -> Self {
        Self {
            model: ModelTreeConfig {
                archive_name: "model_archive.tar".into(),
                base_path: base.join("models"),
                config_name: "models.config".into(),
                empty_config_name: "empty.config".into(),
                incoming_path: base.join("incoming").join("models"),
                dir_perm: 0o755,
                file_perm: 0o644,
            },
            module: ModuleTreeConfig {
                archive_name: "module_archive.tar".into(),
                base_path: base.join("modules"),
                incoming_path: base.join("incoming").join("modules"),
                dir_perm: 0o755,
                file_perm: 0o644,
            },
        }
    }
}

/// Filesystem storage for models and modules.
#[derive(Debug)]
pub struct FsStorage {
    model: ModelTreeConfig,
    module: ModuleTreeConfig,
}

impl FsStorage {
    /// Creates the storage trees and seeds the empty config when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when a tree cannot be created or the empty config
    /// cannot be written.
    pub fn new(config: FsStorageConfig) -> Result<Self> {
        for dir in [
            &config.model.base_path,
            &config.model.incoming_path,
            &config.module.base_path,
            &config.module.incoming_path,
        ] {
            fs::create_dir_all(dir)
                .map_err(|e| StorageError::io(format!("create tree {}", dir.display()), e))?;
        }

        let empty_config = config.model.base_path.join(&config.model.empty_config_name);
        if !empty_config.exists() {
            fs::write(&empty_config, EMPTY_CONFIG_CONTENT)
                .map_err(|e| StorageError::io("seed empty config", e))?;
        }

        Ok(Self {
            model: config.model,
            module: config.module,
        })
    }

    fn model_name_dir(&self, id: &ServableId) -> PathBuf {
        self.model
            .base_path
            .join(&id.team)
            .join(&id.project)
            .join(&id.name)
    }

    fn model_version_dir(&self, id: &ServableId, version: i64) -> PathBuf {
        self.model_name_dir(id).join(version.to_string())
    }

    fn module_version_dir(&self, id: &ServableId, version: i64) -> PathBuf {
        self.module
            .base_path
            .join(&id.team)
            .join(&id.project)
            .join(&id.name)
            .join(version.to_string())
    }

    fn config_path(&self, team: &str, project: &str) -> PathBuf {
        self.model
            .base_path
            .join(team)
            .join(project)
            .join(&self.model.config_name)
    }

    fn staging_dir_name(id: &ServableId) -> String {
        format!(
            "{}-{}-{}-{}",
            id.team,
            id.project,
            id.name,
            Utc::now().timestamp()
        )
    }

    fn save_incoming(
        incoming_path: &Path,
        archive_name: &str,
        id: &ServableId,
        data: &[u8],
    ) -> Result<PathBuf> {
        let staging_dir = incoming_path.join(Self::staging_dir_name(id));
        // never overwrite an in-flight staging directory
        fs::create_dir(&staging_dir)
            .map_err(|e| StorageError::io(format!("create staging {}", staging_dir.display()), e))?;

        let archive_path = staging_dir.join(archive_name);
        fs::write(&archive_path, data)
            .map_err(|e| StorageError::io(format!("write {}", archive_path.display()), e))?;
        Ok(archive_path)
    }

    fn commit_rename(staging_dir: &Path, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::io(format!("mkdir {}", parent.display()), e))?;
        }
        if let Err(err) = fs::rename(staging_dir, destination) {
            let _ = fs::remove_dir_all(destination);
            return Err(StorageError::io(
                format!("rename staging into {}", destination.display()),
                err,
            ));
        }
        Ok(())
    }

    /// Writes an incoming model archive to a fresh staging directory.
    ///
    /// Returns the path to the staged archive file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error; an existing staging directory is never
    /// overwritten.
    pub fn save_incoming_model_archive(&self, id: &ServableId, data: &[u8]) -> Result<PathBuf> {
        Self::save_incoming(&self.model.incoming_path, &self.model.archive_name, id, data)
    }

    /// Returns all entries below `path`, relative to it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the walk fails.
    pub fn directory_layout(&self, path: &Path) -> Result<Vec<String>> {
        let entries = walk(path)?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.strip_prefix(path).ok())
            .map(|rel| rel.display().to_string())
            .collect())
    }

    /// Commits a staged model archive as `{base}/{team}/{project}/{name}/{version}`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ModelAlreadyExists`] when the destination
    /// exists; on rename failure the destination is removed so no partial
    /// state survives.
    pub fn save_model(&self, archive_path: &Path, id: &ServableId, version: i64) -> Result<()> {
        let destination = self.model_version_dir(id, version);
        if destination.exists() {
            return Err(StorageError::ModelAlreadyExists);
        }

        let staging_dir = archive_path.parent().ok_or_else(|| {
            StorageError::io(
                "staged archive has no parent",
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad staging path"),
            )
        })?;
        Self::commit_rename(staging_dir, &destination)?;

        let committed_archive = destination.join(&self.model.archive_name);
        fs::remove_file(&committed_archive).map_err(|e| {
            StorageError::io(format!("remove {}", committed_archive.display()), e)
        })?;
        Ok(())
    }

    /// Runs the full upload pipeline: stage, extract, validate, commit.
    ///
    /// On any failure the staging directory is removed before returning,
    /// so a malformed archive never appears as a valid version.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidLayout`] for a bad archive tree,
    /// [`StorageError::ModelAlreadyExists`] for a duplicate version, or an
    /// I/O error.
    pub fn save_model_archive(&self, id: &ServableId, version: i64, data: &[u8]) -> Result<()> {
        let archive_path = self.save_incoming_model_archive(id, data)?;
        let staging_dir = archive_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let committed = self.extract_validate_commit(&archive_path, &staging_dir, id, version);
        if committed.is_err() {
            if let Err(cleanup) = fs::remove_dir_all(&staging_dir) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(
                        staging = %staging_dir.display(),
                        error = %cleanup,
                        "failed to clean up staging directory"
                    );
                }
            }
        }
        committed
    }

    fn extract_validate_commit(
        &self,
        archive_path: &Path,
        staging_dir: &Path,
        id: &ServableId,
        version: i64,
    ) -> Result<()> {
        unpack_next_to(archive_path, self.model.dir_perm, self.model.file_perm)?;

        let layout = self.directory_layout(staging_dir)?;
        if !is_model_layout_valid(&layout) {
            return Err(StorageError::InvalidLayout);
        }

        self.save_model(archive_path, id, version)
    }

    /// Packages a committed model version as a tar stream.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the version directory is missing.
    pub fn read_model(&self, id: &ServableId, version: i64) -> Result<Vec<u8>> {
        pack_dir(&self.model_version_dir(id, version))
    }

    /// Packages every committed version of a model as one tar stream.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the model directory is missing.
    pub fn read_all_models(&self, id: &ServableId) -> Result<Vec<u8>> {
        pack_dir(&self.model_name_dir(id))
    }

    /// Removes a model version directory. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an I/O error other than "not found".
    pub fn remove_model(&self, id: &ServableId, version: i64) -> Result<()> {
        remove_dir_idempotent(&self.model_version_dir(id, version))
    }

    /// Reads the config blob for `(team, project)`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConfigDoesNotExist`] when no blob has been
    /// written yet, distinct from other I/O failures.
    pub fn read_config(&self, team: &str, project: &str) -> Result<Vec<u8>> {
        let path = self.config_path(team, project);
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ConfigDoesNotExist)
            }
            Err(err) => Err(StorageError::io(format!("read {}", path.display()), err)),
        }
    }

    /// Writes the config blob for `(team, project)`.
    ///
    /// The project directory must already exist (it is created by the
    /// first committed upload).
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the project directory is missing or the
    /// write fails.
    pub fn save_config(&self, team: &str, project: &str, data: &[u8]) -> Result<()> {
        let project_dir = self.model.base_path.join(team).join(project);
        fs::metadata(&project_dir)
            .map_err(|e| StorageError::io(format!("stat {}", project_dir.display()), e))?;

        let path = self.config_path(team, project);
        fs::write(&path, data)
            .map_err(|e| StorageError::io(format!("write {}", path.display()), e))?;
        crate::archive::set_mode(&path, self.model.file_perm);
        Ok(())
    }

    /// Writes an incoming module archive to a fresh staging directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error; an existing staging directory is never
    /// overwritten.
    pub fn save_incoming_module_archive(&self, id: &ServableId, data: &[u8]) -> Result<PathBuf> {
        Self::save_incoming(
            &self.module.incoming_path,
            &self.module.archive_name,
            id,
            data,
        )
    }

    /// Runs the module upload pipeline: stage, extract, commit.
    ///
    /// Modules carry no layout contract, so extraction is followed
    /// directly by the commit rename.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ModuleAlreadyExists`] for a duplicate
    /// version or an I/O error; staging is cleaned up on failure.
    pub fn save_module_archive(&self, id: &ServableId, version: i64, data: &[u8]) -> Result<()> {
        let archive_path = self.save_incoming_module_archive(id, data)?;
        let staging_dir = archive_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let committed = (|| {
            unpack_next_to(&archive_path, self.module.dir_perm, self.module.file_perm)?;

            let destination = self.module_version_dir(id, version);
            if destination.exists() {
                return Err(StorageError::ModuleAlreadyExists);
            }
            Self::commit_rename(&staging_dir, &destination)?;

            let committed_archive = destination.join(&self.module.archive_name);
            fs::remove_file(&committed_archive).map_err(|e| {
                StorageError::io(format!("remove {}", committed_archive.display()), e)
            })
        })();

        if committed.is_err() {
            let _ = fs::remove_dir_all(&staging_dir);
        }
        committed
    }

    /// Packages a committed module version as a tar stream.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the version directory is missing.
    pub fn read_module(&self, id: &ServableId, version: i64) -> Result<Vec<u8>> {
        pack_dir(&self.module_version_dir(id, version))
    }

    /// Removes a module version directory. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an I/O error other than "not found".
    pub fn remove_module(&self, id: &ServableId, version: i64) -> Result<()> {
        remove_dir_idempotent(&self.module_version_dir(id, version))
    }
}

fn remove_dir_idempotent(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StorageError::io(format!("remove {}", path.display()), err)),
    }
}
