//! Subcommands of the `alert-dispatch` binary.

pub mod check;
pub mod replay;
pub mod ui;

use anyhow::{Context, Result};
use dispatch::DispatchConfig;
use std::path::Path;

/// Configuration from `path`, or defaults plus environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<DispatchConfig> {
    match path {
        Some(path) => DispatchConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => DispatchConfig::from_env().context("loading configuration from environment"),
    }
}
