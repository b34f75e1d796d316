//! CLI-facing configuration resolution.
//!
//! `pathmux_core::config::PathmuxConfig` already performs the YAML load and
//! the `MTX_` environment overlay; this module's only job is to
//! pick the config file path and layer the handful of CLI overrides on top,
//! without duplicating its schema.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pathmux_core::config::PathmuxConfig;

use crate::Args;

/// Default config file path, checked relative to the current directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("pathmux.yml")
}

/// Loads the configuration named by `args.config` if it exists on disk,
/// otherwise falls back to defaults (still subject to the `MTX_` environment
/// overlay), then applies the remaining CLI overrides.
pub fn load(args: &Args) -> Result<PathmuxConfig> {
    let path: &Path = &args.config;
    let mut config = if path.exists() {
        PathmuxConfig::load(path).with_context(|| format!("loading {}", path.display()))?
    } else {
        let mut config = PathmuxConfig::default();
        config
            .apply_env_overrides(std::env::vars())
            .context("applying MTX_ environment overlay")?;
        config
            .validate()
            .context("validating default configuration")?;
        config
    };

    if let Some(level) = args.log_level {
        config.log_level = level.into();
    }
    if let Some(ref addr) = args.api_address {
        config.api_address = addr.clone();
    }

    config.validate().context("validating final configuration")?;
    Ok(config)
}
