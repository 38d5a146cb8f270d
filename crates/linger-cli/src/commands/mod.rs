//! CLI subcommand implementations.

pub mod attach;
pub mod create;
pub mod kill;
pub mod list;

use anyhow::{Context as _, Result};
use linger_client::LingerClient;
use linger_core::{LingerError, SessionEntry, StatePaths};

use crate::daemon;

/// Everything a subcommand needs to reach sessions.
pub struct Context {
    pub client: LingerClient,
    pub paths: StatePaths,
    pub group: String,
    pub auto_start: bool,
}

impl Context {
    pub async fn ensure_server(&self) -> Result<()> {
        daemon::ensure_server(&self.client, &self.paths, self.auto_start).await
    }

    /// Find a session of the current group by name (most recent wins) or id.
    pub async fn resolve(&self, name: &str) -> Result<SessionEntry> {
        let entries = self
            .client
            .list(&self.group)
            .await
            .context("failed to list sessions")?;
        pick(entries, name).ok_or_else(|| LingerError::NotFound(name.to_string()).into())
    }
}

/// Name lookup over listed entries, falling back to an exact id match.
fn pick(entries: Vec<SessionEntry>, name: &str) -> Option<SessionEntry> {
    let sessions: Vec<_> = entries.iter().map(|e| e.session.clone()).collect();
    let id = linger_core::resolve(&sessions, name)
        .map(|s| s.id.clone())
        .unwrap_or_else(|| name.to_string());
    entries.into_iter().find(|e| e.session.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use linger_core::{Session, SessionStatus, SpawnMode};

    fn entry(id: &str, name: &str, pid: u32) -> SessionEntry {
        SessionEntry {
            session: Session {
                id: id.into(),
                name: name.into(),
                group: "default".into(),
                pid,
                command: vec!["sh".into()],
                log_file_path: format!("/tmp/{name}.{id}.log").into(),
                created_at: 0,
                last_activity: 0,
                status: SessionStatus::Running,
                exit_code: None,
                cols: 80,
                rows: 24,
                mode: SpawnMode::Pty,
            },
            alive: true,
        }
    }

    #[test]
    fn most_recent_name_wins() {
        let entries = vec![entry("a1", "A", 1), entry("b1", "B", 5), entry("a2", "A", 2)];
        assert_eq!(pick(entries, "A").unwrap().session.pid, 2);
    }

    #[test]
    fn falls_back_to_id() {
        let entries = vec![entry("a1", "A", 1), entry("a2", "A", 2)];
        assert_eq!(pick(entries.clone(), "a1").unwrap().session.pid, 1);
        assert!(pick(entries, "zzz").is_none());
    }
}
