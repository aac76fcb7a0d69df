//! Servable identifiers.
//!
//! A *servable* is a deployable artifact addressed by `(team, project,
//! name)`. Models additionally carry a version and an optional label,
//! modules only a version.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{MAX_NAME_LEN, MAX_PROJECT_LEN, MAX_TEAM_LEN};

/// Identifies a servable by `(team, project, name)`.
///
/// Each segment is non-empty alphanumeric ASCII, at most 32 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServableId {
    /// Owning team.
    pub team: String,
    /// Project within the team.
    pub project: String,
    /// Servable name. May be empty when the identifier addresses a whole
    /// `(team, project)` fleet.
    pub name: String,
}

impl ServableId {
    /// Creates a validated servable identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] when any segment is empty, too long,
    /// or contains a non-alphanumeric character.
    pub fn new(
        team: impl Into<String>,
        project: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let id = Self {
            team: team.into(),
            project: project.into(),
            name: name.into(),
        };
        validate_segment("team", &id.team, MAX_TEAM_LEN)?;
        validate_segment("project", &id.project, MAX_PROJECT_LEN)?;
        if !id.name.is_empty() {
            validate_segment("name", &id.name, MAX_NAME_LEN)?;
        }
        Ok(id)
    }

    /// Creates a fleet-level identifier with an empty name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] when team or project fail validation.
    pub fn fleet(team: impl Into<String>, project: impl Into<String>) -> Result<Self> {
        Self::new(team, project, String::new())
    }

    /// Returns the serving instance name, `tfs-{team}-{project}`.
    #[must_use]
    pub fn instance_name(&self) -> String {
        format!("tfs-{}-{}", self.team, self.project)
    }

    /// Returns the DNS host for the instance, appending `suffix` when set.
    #[must_use]
    pub fn instance_host(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            self.instance_name()
        } else if suffix.starts_with('.') {
            format!("{}{suffix}", self.instance_name())
        } else {
            format!("{}.{suffix}", self.instance_name())
        }
    }

    /// Returns the download filename for an archived version,
    /// `{prefix}_{team}-{project}-{name}-{version}_{unix}.tar`.
    #[must_use]
    pub fn archive_name(&self, prefix: &str, version: i64) -> String {
        format!(
            "{prefix}_{}-{}-{}-{version}_{}.tar",
            self.team,
            self.project,
            self.name,
            Utc::now().timestamp()
        )
    }
}

impl std::fmt::Display for ServableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.team, self.project, self.name)
    }
}

fn validate_segment(field: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_id(format!("{field} must not be empty")));
    }
    if value.len() > max {
        return Err(Error::invalid_id(format!(
            "{field} must be at most {max} characters"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::invalid_id(format!(
            "{field} must match [A-Za-z0-9]+"
        )));
    }
    Ok(())
}

/// A model version, optionally aliased by a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelId {
    /// The servable this version belongs to.
    #[serde(flatten)]
    pub id: ServableId,
    /// Version number, starting at 1.
    pub version: i64,
    /// Symbolic label, empty for the anchor row.
    #[serde(default)]
    pub label: String,
}

impl ModelId {
    /// Creates a model identifier without a label.
    #[must_use]
    pub fn new(id: ServableId, version: i64) -> Self {
        Self {
            id,
            version,
            label: String::new(),
        }
    }

    /// Creates a model identifier carrying a label.
    #[must_use]
    pub fn with_label(id: ServableId, version: i64, label: impl Into<String>) -> Self {
        Self {
            id,
            version,
            label: label.into(),
        }
    }
}

/// A module version. Modules carry no labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleId {
    /// The servable this version belongs to.
    #[serde(flatten)]
    pub id: ServableId,
    /// Version number, starting at 1.
    pub version: i64,
}

/// Outcome of a label transition, reported back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelChanged {
    /// The servable whose label moved.
    #[serde(flatten)]
    pub id: ServableId,
    /// The label that moved.
    pub label: String,
    /// The version the label pointed at before, 0 when it was unset.
    pub previous_version: i64,
    /// The version the label points at now.
    pub new_version: i64,
}

impl LabelChanged {
    /// Renders the human-readable transition message served by the API.
    #[must_use]
    pub fn message(&self) -> String {
        if self.previous_version == 0 {
            format!(
                "model[{}-{}-{}] label '{}' version set to [{}]",
                self.id.team, self.id.project, self.id.name, self.label, self.new_version
            )
        } else {
            format!(
                "model[{}-{}-{}] label '{}' changed from version [{}] to [{}]",
                self.id.team,
                self.id.project,
                self.id.name,
                self.label,
                self.previous_version,
                self.new_version
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servable_id_validates_segments() {
        assert!(ServableId::new("team", "proj", "model1").is_ok());
        assert!(ServableId::new("", "proj", "m").is_err());
        assert!(ServableId::new("te-am", "proj", "m").is_err());
        assert!(ServableId::new("a".repeat(33), "proj", "m").is_err());
        // name may be empty for fleet-level identifiers
        assert!(ServableId::fleet("team", "proj").is_ok());
    }

    #[test]
    fn instance_name_follows_convention() {
        let id = ServableId::new("alpha", "search", "ranker").unwrap();
        assert_eq!(id.instance_name(), "tfs-alpha-search");
        assert_eq!(id.instance_host(""), "tfs-alpha-search");
        assert_eq!(id.instance_host("svc.local"), "tfs-alpha-search.svc.local");
        assert_eq!(id.instance_host(".svc.local"), "tfs-alpha-search.svc.local");
    }

    #[test]
    fn archive_name_embeds_identity_and_version() {
        let id = ServableId::new("alpha", "search", "ranker").unwrap();
        let name = id.archive_name("model", 3);
        assert!(name.starts_with("model_alpha-search-ranker-3_"));
        assert!(name.ends_with(".tar"));
    }

    #[test]
    fn model_id_serializes_flat() {
        let id = ModelId::new(ServableId::new("t", "p", "m").unwrap(), 1);
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["team"], "t");
        assert_eq!(json["version"], 1);
        assert_eq!(json["label"], "");
    }

    #[test]
    fn label_changed_message_variants() {
        let id = ServableId::new("t", "p", "m").unwrap();
        let set = LabelChanged {
            id: id.clone(),
            label: "stable".into(),
            previous_version: 0,
            new_version: 2,
        };
        assert_eq!(set.message(), "model[t-p-m] label 'stable' version set to [2]");

        let moved = LabelChanged {
            id,
            label: "stable".into(),
            previous_version: 1,
            new_version: 2,
        };
        assert_eq!(
            moved.message(),
            "model[t-p-m] label 'stable' changed from version [1] to [2]"
        );
    }
}
