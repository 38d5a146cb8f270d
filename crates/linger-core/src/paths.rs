//! On-disk layout of the state directory.
//!
//! ```text
//! $LINGER_HOME (default ~/.linger)
//! ├── config.toml
//! ├── sessions.json        ordered registry entries
//! └── logs/<name>.<id>.log append-only output per session
//! ```

use std::path::{Path, PathBuf};

/// Environment variable that overrides the state directory.
pub const HOME_ENV: &str = "LINGER_HOME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$LINGER_HOME`, else `~/.linger`, else `/tmp/.linger`.
    pub fn default_location() -> Self {
        if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::new(PathBuf::from(dir));
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::new(home.join(".linger"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Log file for a session; deterministic in the name, disambiguated by id.
    pub fn log_file(&self, name: &str, id: &str) -> PathBuf {
        self.log_dir().join(format!("{}.{id}.log", sanitize_name(name)))
    }
}

/// Map a session name to something safe to use as a file name component.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed.chars().take(64).collect()
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
