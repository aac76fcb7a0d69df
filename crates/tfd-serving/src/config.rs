//! The per-`(team, project)` serving config blob.
//!
//! Schema mirrors the model-server config the serving instances consume:
//! an ordered list of model entries, each with the version set to load
//! and the label aliases pointing into that set. The blob is stored as
//! JSON bytes; the text form served for human inspection is the
//! pretty-printed rendering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tfd_core::{ModelId, ServableId};

use crate::{Result, ServingError};

/// Platform tag stamped on every model entry.
pub const MODEL_PLATFORM: &str = "tensorflow";

/// The full config blob for one `(team, project)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelServerConfig {
    /// The ordered model entry list.
    #[serde(default)]
    pub model_config_list: ModelConfigList,
}

/// Ordered list of model entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfigList {
    /// One entry per model name.
    #[serde(default)]
    pub config: Vec<ModelConfig>,
}

/// One model entry in the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name within the project.
    pub name: String,
    /// Path where serving instances resolve the model files.
    pub base_path: String,
    /// Serving platform tag.
    pub model_platform: String,
    /// The set of versions instances should load.
    pub model_version_policy: ModelVersionPolicy,
    /// Label → version aliases. Every value must be a member of the
    /// version set.
    #[serde(default)]
    pub version_labels: BTreeMap<String, i64>,
}

/// Version policy wrapper; only the `specific` choice is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersionPolicy {
    /// Explicit version list.
    pub specific: SpecificVersions,
}

/// Explicitly enumerated versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificVersions {
    /// Versions to load, in insertion order.
    #[serde(default)]
    pub versions: Vec<i64>,
}

impl ModelServerConfig {
    /// Decodes a blob; an absent blob decodes to the empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ServingError::Serialization`] for malformed bytes.
    pub fn from_bytes(data: Option<&[u8]>) -> Result<Self> {
        match data {
            None => Ok(Self::default()),
            Some(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| ServingError::Serialization(e.to_string())),
        }
    }

    /// Encodes the blob for storage.
    ///
    /// # Errors
    ///
    /// Returns [`ServingError::Serialization`] when encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ServingError::Serialization(e.to_string()))
    }

    /// Renders the human-readable text form.
    ///
    /// # Errors
    ///
    /// Returns [`ServingError::Serialization`] when encoding fails.
    pub fn to_text(&self) -> Result<Vec<u8>> {
        let mut text = serde_json::to_vec_pretty(self)
            .map_err(|e| ServingError::Serialization(e.to_string()))?;
        text.push(b'\n');
        Ok(text)
    }

    /// Returns the entry for `name`, if present.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&ModelConfig> {
        self.model_config_list.config.iter().find(|c| c.name == name)
    }

    /// Returns the mutable entry for `name`, if present.
    pub fn entry_mut(&mut self, name: &str) -> Option<&mut ModelConfig> {
        self.model_config_list
            .config
            .iter_mut()
            .find(|c| c.name == name)
    }

    /// Returns a copy with every entry's label map cleared.
    ///
    /// Used as the first push of the two-phase reload: instances refuse
    /// labels that reference versions they have not yet loaded.
    #[must_use]
    pub fn without_labels(&self) -> Self {
        let mut stripped = self.clone();
        for entry in &mut stripped.model_config_list.config {
            entry.version_labels.clear();
        }
        stripped
    }

    /// Flattens the blob to `(name, version)` pairs for a fleet.
    #[must_use]
    pub fn models(&self, team: &str, project: &str) -> Vec<ModelId> {
        let mut result = Vec::new();
        for entry in &self.model_config_list.config {
            for &version in &entry.model_version_policy.specific.versions {
                result.push(ModelId::new(
                    ServableId {
                        team: team.to_string(),
                        project: project.to_string(),
                        name: entry.name.clone(),
                    },
                    version,
                ));
            }
        }
        result
    }
}

impl ModelConfig {
    /// Returns the conventional base path for a servable.
    #[must_use]
    pub fn base_path_for(id: &ServableId) -> String {
        format!("/models/{}/{}/{}", id.team, id.project, id.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelServerConfig {
        let mut config = ModelServerConfig::default();
        config.model_config_list.config.push(ModelConfig {
            name: "ranker".into(),
            base_path: "/models/team/proj/ranker".into(),
            model_platform: MODEL_PLATFORM.into(),
            model_version_policy: ModelVersionPolicy {
                specific: SpecificVersions {
                    versions: vec![1, 2],
                },
            },
            version_labels: BTreeMap::from([("canary".into(), 2), ("stable".into(), 1)]),
        });
        config
    }

    #[test]
    fn bytes_round_trip() {
        let config = sample();
        let bytes = config.to_bytes().unwrap();
        let decoded = ModelServerConfig::from_bytes(Some(&bytes)).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn absent_blob_decodes_to_empty_config() {
        let config = ModelServerConfig::from_bytes(None).unwrap();
        assert!(config.model_config_list.config.is_empty());
    }

    #[test]
    fn without_labels_clears_every_entry() {
        let stripped = sample().without_labels();
        assert!(stripped.model_config_list.config[0].version_labels.is_empty());
        // version set is untouched
        assert_eq!(
            stripped.model_config_list.config[0]
                .model_version_policy
                .specific
                .versions,
            vec![1, 2]
        );
    }

    #[test]
    fn models_flattens_entries_and_versions() {
        let models = sample().models("team", "proj");
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id.name, "ranker");
        assert_eq!(models[0].version, 1);
        assert_eq!(models[1].version, 2);
    }

    #[test]
    fn base_path_follows_convention() {
        let id = ServableId::new("team", "proj", "ranker").unwrap();
        assert_eq!(ModelConfig::base_path_for(&id), "/models/team/proj/ranker");
    }
}
