//! Persisted session records.
//!
//! A `Session` is the registry's view of one named process: who it is, where
//! its log lives, and the last status anyone observed. The status is a hint;
//! liveness is always re-derived with a [`LivenessProbe`](crate::liveness::LivenessProbe).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Last-known lifecycle state of a session's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
    Killed,
    Unknown,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Exited => "exited",
            SessionStatus::Killed => "killed",
            SessionStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the process's standard streams are attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    /// Pseudo-terminal: raw keystrokes and native resize.
    #[default]
    Pty,
    /// Plain pipes: line-oriented input, resize is logical only.
    Pipes,
}

/// A registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique id (the remote API's `ptyID`).
    pub id: String,
    /// Human-chosen name. Not unique; the most recent entry wins.
    pub name: String,
    /// Logical group (the remote API's `sid`).
    #[serde(default = "default_group")]
    pub group: String,
    pub pid: u32,
    pub command: Vec<String>,
    pub log_file_path: PathBuf,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds, bumped on output and input.
    pub last_activity: u64,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub mode: SpawnMode,
}

/// A session annotated with liveness computed at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    #[serde(flatten)]
    pub session: Session,
    pub alive: bool,
}

impl Session {
    /// Display form of the command line.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// Milliseconds since the last recorded activity.
    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity)
    }
}

pub const DEFAULT_GROUP: &str = "default";

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a random session id (hex-encoded, 8 bytes = 16 hex chars).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_json_is_camel_case() {
        let session = Session {
            id: "abc".into(),
            name: "build".into(),
            group: DEFAULT_GROUP.into(),
            pid: 42,
            command: vec!["make".into(), "all".into()],
            log_file_path: PathBuf::from("/tmp/build.abc.log"),
            created_at: 1,
            last_activity: 2,
            status: SessionStatus::Running,
            exit_code: None,
            cols: 80,
            rows: 24,
            mode: SpawnMode::Pty,
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["logFilePath"], "/tmp/build.abc.log");
        assert_eq!(json["lastActivity"], 2);
        assert_eq!(json["status"], "running");
        assert!(json.get("exitCode").is_none());
    }

    #[test]
    fn older_records_fill_defaults() {
        let json = r#"{"id":"x","name":"a","pid":1,"command":["sh"],
            "logFilePath":"/l","createdAt":0,"lastActivity":0,"status":"exited"}"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.group, DEFAULT_GROUP);
        assert_eq!((session.cols, session.rows), (80, 24));
        assert_eq!(session.mode, SpawnMode::Pty);
    }

    #[test]
    fn session_ids_are_hex() {
        let id = generate_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
