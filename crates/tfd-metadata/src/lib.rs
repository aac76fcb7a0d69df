//! Durable index of model and module records.
//!
//! Metadata is the audit/query side of the controller: the config blob
//! (see `tfd-serving`) is the canonical intent pushed to instances, while
//! this index answers listings, version allocation, and label lookups.
//!
//! Uniqueness rules:
//! - `(team, project, name, version, label)` is unique;
//! - `(team, project, name, label)` is unique when the label is non-empty;
//! - every version has an "anchor" row with an empty label, and labelled
//!   rows alias the same version.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod sqlite;

use serde::{Deserialize, Serialize};

use tfd_core::{ModelId, ModuleId, ServableId};

pub use sqlite::SqliteMetadata;

/// First version assigned to a brand-new servable.
pub const START_VERSION: i64 = 1;

/// The result type used by metadata operations.
pub type Result<T> = std::result::Result<T, MetadataError>;

/// Errors raised by the metadata index.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// A status name or numeric id outside the lifecycle enumeration.
    #[error("invalid status")]
    InvalidStatus,

    /// Version arithmetic overflowed.
    #[error("invalid version")]
    InvalidVersion,

    /// An update touched no rows.
    #[error("update model error")]
    UpdateFailed,

    /// A delete touched no rows.
    #[error("delete error")]
    DeleteFailed,

    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,

    /// The configured metadata driver is not supported.
    #[error("unsupported metadata backend: {0}")]
    UnsupportedDriver(String),

    /// The underlying database failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Model lifecycle status.
///
/// The wire representation is the lowercase name; the stored
/// representation is the numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Actively serving under a promoted label.
    Running,
    /// Committed and eligible for serving.
    Ready,
    /// Upload in flight; not yet committed to the config.
    Pending,
}

impl Status {
    /// Returns the numeric id stored in the database.
    #[must_use]
    pub fn as_id(self) -> u8 {
        match self {
            Self::Running => 1,
            Self::Ready => 2,
            Self::Pending => 3,
        }
    }

    /// Maps a stored numeric id back to a status.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::InvalidStatus`] for ids outside 1..=3.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Self::Running),
            2 => Ok(Self::Ready),
            3 => Ok(Self::Pending),
            _ => Err(MetadataError::InvalidStatus),
        }
    }

    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Pending => "pending",
        }
    }

    /// Parses a wire name.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::InvalidStatus`] for unknown names.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "running" => Ok(Self::Running),
            "ready" => Ok(Self::Ready),
            "pending" => Ok(Self::Pending),
            _ => Err(MetadataError::InvalidStatus),
        }
    }
}

/// A model metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Surrogate row id.
    pub id: i64,
    /// Model identity (team/project/name/version/label).
    #[serde(flatten)]
    pub model: ModelId,
    /// Lifecycle status.
    pub status: Status,
    /// Creation time, unix seconds.
    pub created: i64,
    /// Last update time, unix seconds.
    pub updated: i64,
}

/// A module metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Surrogate row id.
    pub id: i64,
    /// Module identity (team/project/name/version).
    #[serde(flatten)]
    pub module: ModuleId,
    /// Creation time, unix seconds.
    pub created: i64,
    /// Last update time, unix seconds.
    pub updated: i64,
}

/// Field filter for metadata queries.
///
/// Unset fields do not constrain the query. `label` distinguishes "any
/// label" (`None`) from "exactly this label" (`Some`), where the empty
/// string selects anchor rows.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Team to match.
    pub team: Option<String>,
    /// Project to match.
    pub project: Option<String>,
    /// Servable name to match.
    pub name: Option<String>,
    /// Exact version to match.
    pub version: Option<i64>,
    /// Exact label to match; the empty string selects anchor rows.
    pub label: Option<String>,
    /// Lifecycle status to match.
    pub status: Option<Status>,
}

impl QueryFilter {
    /// Creates an unconstrained filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a filter matching a servable's team/project/name.
    ///
    /// An empty name segment is left unconstrained, so fleet-level
    /// identifiers filter by `(team, project)` only.
    #[must_use]
    pub fn servable(id: &ServableId) -> Self {
        let mut filter = Self::new().with_team(&id.team).with_project(&id.project);
        if !id.name.is_empty() {
            filter = filter.with_name(&id.name);
        }
        filter
    }

    /// Constrains the team.
    #[must_use]
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Constrains the project.
    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Constrains the servable name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Constrains the version.
    #[must_use]
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Constrains the label. The empty string selects anchor rows.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Constrains the status.
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Renders the filter as a `WHERE` clause with bound values.
    ///
    /// Returns an empty clause when no field is set.
    #[must_use]
    pub fn to_where_clause(&self) -> (String, Vec<rusqlite::types::Value>) {
        let mut fields = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(team) = &self.team {
            fields.push("team = ?");
            values.push(team.clone().into());
        }
        if let Some(project) = &self.project {
            fields.push("project = ?");
            values.push(project.clone().into());
        }
        if let Some(name) = &self.name {
            fields.push("name = ?");
            values.push(name.clone().into());
        }
        if let Some(version) = self.version {
            fields.push("version = ?");
            values.push(version.into());
        }
        if let Some(label) = &self.label {
            fields.push("label = ?");
            values.push(label.clone().into());
        }
        if let Some(status) = self.status {
            fields.push("status = ?");
            values.push(i64::from(status.as_id()).into());
        }

        if fields.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", fields.join(" AND ")), values)
        }
    }
}

/// Model metadata operations required by the service layer.
pub trait ModelMetadata: Send + Sync {
    /// Returns the first record matching the filter, if any.
    fn get(&self, filter: &QueryFilter) -> Result<Option<ModelRecord>>;
    /// Returns every record matching the filter.
    fn list(&self, filter: &QueryFilter) -> Result<Vec<ModelRecord>>;
    /// Inserts a record and returns its surrogate id.
    fn add(&self, model: &ModelId, status: Status) -> Result<i64>;
    /// Deletes a record by surrogate id.
    fn delete(&self, id: i64) -> Result<()>;
    /// Moves a record to the given status.
    fn update_status(&self, id: i64, status: Status) -> Result<()>;
    /// Returns the next free version for the filtered rows.
    fn next_version(&self, filter: &QueryFilter) -> Result<i64>;
    /// Returns the distinct `(team, project)` pairs with any record.
    fn list_unique_team_project(&self) -> Result<Vec<ServableId>>;
    /// Deletes the labelled row aliasing the model's label.
    fn remove_label(&self, model: &ModelId) -> Result<()>;
    /// Atomically repoints a label: deletes any row holding it, inserts
    /// the new labelled row.
    fn change_label(&self, model: &ModelId, status: Status) -> Result<()>;
    /// True when any row for the servable is still `Pending`.
    fn is_status_pending(&self, id: &ServableId) -> Result<bool>;
}

/// Module metadata operations required by the service layer.
pub trait ModuleMetadata: Send + Sync {
    /// Returns the first record matching the filter, if any.
    fn get(&self, filter: &QueryFilter) -> Result<Option<ModuleRecord>>;
    /// Returns every record matching the filter.
    fn list(&self, filter: &QueryFilter) -> Result<Vec<ModuleRecord>>;
    /// Inserts a record and returns its surrogate id.
    fn add(&self, module: &ModuleId) -> Result<i64>;
    /// Deletes a record by surrogate id.
    fn delete(&self, id: i64) -> Result<()>;
    /// Returns the next free version for the filtered rows.
    fn next_version(&self, filter: &QueryFilter) -> Result<i64>;
}

/// Increments a version, guarding against overflow.
///
/// # Errors
///
/// Returns [`MetadataError::InvalidVersion`] when the increment wraps.
pub fn next_version(version: i64) -> Result<i64> {
    version
        .checked_add(1)
        .filter(|next| *next > version)
        .ok_or(MetadataError::InvalidVersion)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_ids_and_names() {
        for status in [Status::Running, Status::Ready, Status::Pending] {
            assert_eq!(Status::from_id(status.as_id()).unwrap(), status);
            assert_eq!(Status::parse(status.as_str()).unwrap(), status);
        }
        assert!(Status::from_id(0).is_err());
        assert!(Status::parse("stopped").is_err());
    }

    #[test]
    fn status_serializes_as_lowercase_name() {
        assert_eq!(serde_json::to_value(Status::Ready).unwrap(), "ready");
    }

    #[test]
    fn filter_builds_where_clause_in_field_order() {
        let filter = QueryFilter::new()
            .with_team("t")
            .with_project("p")
            .with_version(2)
            .with_label("");
        let (clause, values) = filter.to_where_clause();
        assert_eq!(
            clause,
            " WHERE team = ? AND project = ? AND version = ? AND label = ?"
        );
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn empty_filter_builds_no_clause() {
        let (clause, values) = QueryFilter::new().to_where_clause();
        assert!(clause.is_empty());
        assert!(values.is_empty());
    }

    #[test]
    fn next_version_guards_overflow() {
        assert_eq!(next_version(1).unwrap(), 2);
        assert!(matches!(
            next_version(i64::MAX),
            Err(MetadataError::InvalidVersion)
        ));
    }
}
