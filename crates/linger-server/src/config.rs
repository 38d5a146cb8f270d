//! Server configuration: TOML file + CLI overrides.

use crate::session::SessionConfig;
use linger_core::paths::expand_tilde;
use linger_core::{LingerError, LingerResult, StatePaths};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    /// State directory; defaults to `$LINGER_HOME` or `~/.linger`.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Seconds of inactivity before a session is swept. 0 disables.
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: u64,
    #[serde(default = "default_scrollback")]
    pub scrollback: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_observer_queue")]
    pub observer_queue: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            state_dir: None,
            idle_timeout: 0,
            sweep_interval: default_sweep_interval(),
            kill_timeout: default_kill_timeout(),
            scrollback: default_scrollback(),
            max_sessions: default_max_sessions(),
            observer_queue: default_observer_queue(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7681
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_kill_timeout() -> u64 {
    5
}
fn default_scrollback() -> usize {
    10_000
}
fn default_max_sessions() -> usize {
    64
}
fn default_observer_queue() -> usize {
    256
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub state_dir: Option<String>,
    pub idle_timeout: Option<u64>,
    pub max_sessions: Option<usize>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub sweep_interval: Duration,
    pub sessions: SessionConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides. A missing file
    /// means defaults.
    pub fn load(config_path: &Path, cli: Overrides) -> LingerResult<Self> {
        let expanded = expand_tilde(&config_path.to_string_lossy());
        let file = if expanded.exists() {
            info!(path = %expanded.display(), "loading config file");
            let content = std::fs::read_to_string(&expanded)?;
            parse(&content)?
        } else {
            info!(path = %expanded.display(), "config file not found, using defaults");
            ConfigFile::default()
        };
        Ok(Self::resolve(file, cli))
    }

    fn resolve(file: ConfigFile, cli: Overrides) -> Self {
        let state = match cli.state_dir.or(file.sessions.state_dir) {
            Some(dir) => StatePaths::new(expand_tilde(&dir)),
            None => StatePaths::default_location(),
        };
        let idle_secs = cli.idle_timeout.unwrap_or(file.sessions.idle_timeout);

        let mut sessions = SessionConfig::new(state);
        sessions.scrollback_lines = file.sessions.scrollback.max(1);
        sessions.max_sessions = cli.max_sessions.unwrap_or(file.sessions.max_sessions);
        sessions.idle_timeout = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));
        sessions.kill_timeout = Duration::from_secs(file.sessions.kill_timeout);
        sessions.observer_queue = file.sessions.observer_queue.max(1);

        Self {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            sweep_interval: Duration::from_secs(file.sessions.sweep_interval.max(1)),
            sessions,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse(content: &str) -> LingerResult<ConfigFile> {
    toml::from_str(content).map_err(|e| LingerError::Other(format!("config parse error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_file_uses_defaults() {
        let file = parse("").unwrap();
        let config = ServerConfig::resolve(
            file,
            Overrides {
                state_dir: Some("/state".into()),
                ..Default::default()
            },
        );
        assert_eq!(config.bind_addr(), "127.0.0.1:7681");
        assert_eq!(config.sessions.paths.root(), Path::new("/state"));
        assert!(config.sessions.idle_timeout.is_none());
        assert_eq!(config.sessions.max_sessions, 64);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse(
            r#"
            [server]
            port = 9000

            [sessions]
            state_dir = "/from-file"
            idle_timeout = 600
            max_sessions = 8
            kill_timeout = 1
            "#,
        )
        .unwrap();
        let config = ServerConfig::resolve(
            file,
            Overrides {
                port: Some(9100),
                idle_timeout: Some(30),
                ..Default::default()
            },
        );
        assert_eq!(config.port, 9100);
        assert_eq!(config.sessions.paths.root(), Path::new("/from-file"));
        assert_eq!(config.sessions.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.sessions.max_sessions, 8);
        assert_eq!(config.sessions.kill_timeout, Duration::from_secs(1));
    }

    #[test]
    fn load_reads_file_and_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let cli = Overrides {
            state_dir: Some(dir.path().to_string_lossy().into_owned()),
            ..Default::default()
        };

        let config = ServerConfig::load(&path, cli.clone()).unwrap();
        assert_eq!(config.port, 7681);

        std::fs::write(&path, "[server]\nhost = \"0.0.0.0\"\n").unwrap();
        assert_eq!(ServerConfig::load(&path, cli.clone()).unwrap().host, "0.0.0.0");

        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(ServerConfig::load(&path, cli).is_err());
    }
}
