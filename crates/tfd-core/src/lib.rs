//! Core types shared across all tfdeploy components.
//!
//! This crate defines the servable identifiers, the shared error type,
//! the process-wide lock table, and logging initialization. Every other
//! crate in the workspace builds on these.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;

pub use error::{Error, Result};
pub use id::{LabelChanged, ModelId, ModuleId, ServableId};
pub use lock::Lock;

/// Reserved label promoted by the two-slot revert protocol.
pub const STABLE_LABEL: &str = "stable";

/// Reserved label holding the previously stable version.
pub const LAST_STABLE_LABEL: &str = "last_stable";

/// Maximum length of the team segment of a [`ServableId`].
pub const MAX_TEAM_LEN: usize = 32;

/// Maximum length of the project segment of a [`ServableId`].
pub const MAX_PROJECT_LEN: usize = 32;

/// Maximum length of the name segment of a [`ServableId`].
pub const MAX_NAME_LEN: usize = 32;
