//! CLI subcommands

pub mod config;
pub mod download;

use std::path::Path;

use anyhow::{bail, Context as _, Result};
use shiplink_core::config::Config;
use tracing::debug;

/// Loads the configuration for a command that needs a usable one.
///
/// A missing file means defaults; a file that fails to parse or validate is
/// an error.
pub fn load_checked_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?
    } else {
        debug!(config_path = %path.display(), "No configuration file, using defaults");
        Config::default()
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        bail!(
            "Invalid configuration in {}: {}",
            path.display(),
            messages.join("; ")
        );
    }
    Ok(config)
}
