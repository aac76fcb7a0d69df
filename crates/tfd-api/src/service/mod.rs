//! Orchestration of metadata, storage, config state, and reconciliation.

pub mod models;
pub mod modules;

use tfd_metadata::{MetadataError, ModelRecord};
use tfd_serving::ServingError;
use tfd_storage::StorageError;

pub use models::ModelService;
pub use modules::ModuleService;

/// The result type used by the service layer.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced by service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// No metadata row matched the request.
    #[error("model not found")]
    ModelNotFound,

    /// Revert requires a current `stable` row.
    #[error("model with label 'stable' not found")]
    StableModelNotFound,

    /// Revert requires a `last_stable` row.
    #[error("model with label 'last_stable' not found")]
    LastStableModelNotFound,

    /// No module row matched the request.
    #[error("module not found")]
    ModuleNotFound,

    /// The metadata index failed.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// The filesystem storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The config state machine or a fleet push failed.
    #[error(transparent)]
    Serving(#[from] ServingError),
}

/// A packaged archive ready for download.
#[derive(Debug, Clone)]
pub struct Archive {
    /// Tar stream of the version directory.
    pub data: Vec<u8>,
    /// Suggested download filename.
    pub name: String,
}

/// Drops anchor rows shadowed by a labelled twin.
///
/// The anchor row exists for uniqueness; the user-visible listing shows
/// the labelled alias instead.
#[must_use]
pub fn clean_list(models: Vec<ModelRecord>) -> Vec<ModelRecord> {
    let key = |record: &ModelRecord| {
        format!(
            "{}-{}-{}-{}",
            record.model.id.team, record.model.id.project, record.model.id.name, record.model.version
        )
    };

    let labelled: std::collections::HashSet<String> = models
        .iter()
        .filter(|record| !record.model.label.is_empty())
        .map(key)
        .collect();

    models
        .into_iter()
        .filter(|record| !(record.model.label.is_empty() && labelled.contains(&key(record))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfd_core::{ModelId, ServableId};
    use tfd_metadata::Status;

    fn record(version: i64, label: &str) -> ModelRecord {
        ModelRecord {
            id: version,
            model: ModelId::with_label(
                ServableId::new("t", "p", "m").unwrap(),
                version,
                label,
            ),
            status: Status::Ready,
            created: 0,
            updated: 0,
        }
    }

    #[test]
    fn clean_list_hides_shadowed_anchor_rows() {
        let cleaned = clean_list(vec![record(1, ""), record(1, "canary"), record(2, "")]);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].model.label, "canary");
        // version 2 has no labelled twin, so its anchor survives
        assert_eq!(cleaned[1].model.version, 2);
        assert_eq!(cleaned[1].model.label, "");
    }

    #[test]
    fn clean_list_keeps_multiple_labels_for_one_version() {
        let cleaned = clean_list(vec![
            record(1, ""),
            record(1, "canary"),
            record(1, "stable"),
        ]);
        assert_eq!(cleaned.len(), 2);
        assert!(cleaned.iter().all(|r| !r.model.label.is_empty()));
    }
}
