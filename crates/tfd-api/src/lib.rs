//! HTTP API surface and orchestration service for tfdeploy.
//!
//! The API layer is thin: it validates request shape, holds the
//! per-servable lock across mutations, and maps service errors to HTTP
//! statuses. The service layer orchestrates metadata, storage, the
//! config state machine, and the reconciler.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod checksum;
pub mod config;
pub mod error;
pub mod routes;
pub mod server;
pub mod service;

pub use config::Config;
pub use error::ApiError;
pub use server::{AppState, Server};

/// Crate version reported by `/ping`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
