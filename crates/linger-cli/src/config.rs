//! Client configuration, the `[client]` section of `~/.linger/config.toml`.
//!
//! The server reads `[server]` and `[sessions]` from the same file. CLI flags
//! always override config file values.

use anyhow::{Context, Result};
use linger_client::DEFAULT_URL;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Top-level config file structure (client view).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the linger server.
    #[serde(default = "default_url")]
    pub url: String,

    /// Start `linger-server` in the background when it is not reachable.
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,

    /// Session group used when `--group` is not given.
    #[serde(default = "default_group")]
    pub group: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            auto_start: default_auto_start(),
            group: default_group(),
        }
    }
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_auto_start() -> bool {
    true
}

fn default_group() -> String {
    linger_core::DEFAULT_GROUP.to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
