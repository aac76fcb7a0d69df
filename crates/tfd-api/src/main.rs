//! `tfd` binary entrypoint.
//!
//! Resolves configuration (defaults ← environment ← CLI ← YAML file)
//! and starts the controller. Configuration failures exit non-zero;
//! `--help` exits zero.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;
use clap::Parser;

use tfd_api::config::Cli;
use tfd_api::{Config, Server};
use tfd_core::observability::{init_logging, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(&cli)?;

    init_logging(LogFormat::Json);

    Server::new(config).serve().await
}
