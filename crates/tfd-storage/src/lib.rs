//! Filesystem storage for model/module archives and config blobs.
//!
//! Uploads are committed through a staging pipeline so a partially
//! received or malformed archive never appears as a valid version:
//! the archive is written to a uniquely named staging directory under the
//! `incoming` tree, extracted in place, validated against the expected
//! directory layout, and finally renamed into the versioned tree.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod archive;
pub mod filesystem;
pub mod layout;

pub use filesystem::{FsStorage, FsStorageConfig, ModelTreeConfig, ModuleTreeConfig};
pub use layout::{validate_layout, MODEL_LAYOUT_PATTERNS};

/// The result type used by storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by the storage subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The destination model version directory already exists.
    #[error("model already exists")]
    ModelAlreadyExists,

    /// The destination module version directory already exists.
    #[error("module already exists")]
    ModuleAlreadyExists,

    /// No config blob has been written for the `(team, project)` yet.
    ///
    /// Distinct from I/O failures: callers fall back to an empty config.
    #[error("config does not exist")]
    ConfigDoesNotExist,

    /// The extracted archive does not match the required directory layout.
    #[error("directory layout is invalid")]
    InvalidLayout,

    /// A filesystem operation failed.
    #[error("storage i/o error: {message}")]
    Io {
        /// What was being done when the failure occurred.
        message: String,
        /// The underlying cause.
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}
