//! Durable session registry store.
//!
//! The registry is one JSON file holding an ordered array of [`Session`]
//! entries. Every mutation re-reads the file, applies the change and rewrites
//! the whole list through a temp file and rename, so a crash never leaves a
//! half-written registry behind. A missing or empty file means no sessions.
//!
//! Writers in different processes are not coordinated; within one process,
//! mutations are serialized so a create is visible to the next list.
//!
//! Activity timestamps change on every chunk of output, far too often to
//! rewrite the file each time. They are held in an in-memory overlay that is
//! applied to every read and folded into the next rewrite or [`Registry::flush`].

use crate::error::{LingerError, LingerResult};
use crate::session::Session;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Resolve a name against loaded entries: the most recently appended entry
/// with that name wins.
///
/// Duplicate names are kept on disk. Last-wins mirrors observed behaviour of
/// earlier tooling rather than a deliberate contract.
pub fn resolve<'a>(entries: &'a [Session], name: &str) -> Option<&'a Session> {
    entries.iter().rev().find(|s| s.name == name)
}

pub struct Registry {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    activity: Mutex<HashMap<String, u64>>,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
            activity: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries in registration order.
    pub async fn load(&self) -> LingerResult<Vec<Session>> {
        let mut entries = read_entries(&self.path).await?;
        self.apply_activity(&mut entries);
        Ok(entries)
    }

    /// Look up a name using [`resolve`].
    pub async fn find(&self, name: &str) -> LingerResult<Option<Session>> {
        let entries = self.load().await?;
        Ok(resolve(&entries, name).cloned())
    }

    /// Look up an entry by id.
    pub async fn get(&self, id: &str) -> LingerResult<Option<Session>> {
        let entries = self.load().await?;
        Ok(entries.into_iter().find(|s| s.id == id))
    }

    /// Read-modify-write the full entry list.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Session>) -> R) -> LingerResult<R> {
        let _guard = self.write_lock.lock().await;
        let mut entries = read_entries(&self.path).await?;
        let applied = self.apply_activity(&mut entries);
        let result = f(&mut entries);
        write_entries(&self.path, &entries).await?;

        // Drop overlay values that made it to disk; newer touches stay.
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, at) in applied {
            if activity.get(&id) == Some(&at) {
                activity.remove(&id);
            }
        }
        Ok(result)
    }

    /// Register a new entry at the end of the list.
    pub async fn append(&self, session: Session) -> LingerResult<()> {
        let id = session.id.clone();
        let name = session.name.clone();
        self.mutate(move |entries| {
            if entries.iter().any(|s| s.id == session.id) {
                return Err(LingerError::Registry(format!("duplicate id {}", session.id)));
            }
            entries.push(session);
            Ok(())
        })
        .await??;
        info!(session_id = %id, name = %name, "session registered");
        Ok(())
    }

    /// Apply `f` to the entry with `id`. Returns `false` if there is none.
    pub async fn update(&self, id: &str, f: impl FnOnce(&mut Session)) -> LingerResult<bool> {
        self.mutate(|entries| match entries.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        })
        .await
    }

    /// Delete the entry with `id`, returning it.
    pub async fn remove_id(&self, id: &str) -> LingerResult<Option<Session>> {
        let removed = self
            .mutate(|entries| {
                let pos = entries.iter().position(|s| s.id == id)?;
                Some(entries.remove(pos))
            })
            .await?;
        if removed.is_some() {
            self.activity
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id);
            info!(session_id = %id, "session unregistered");
        }
        Ok(removed)
    }

    /// Record activity for `id` without touching the file.
    pub fn touch(&self, id: &str, at_ms: u64) {
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = activity.entry(id.to_string()).or_insert(at_ms);
        if *slot < at_ms {
            *slot = at_ms;
        }
    }

    /// Persist pending activity timestamps.
    pub async fn flush(&self) -> LingerResult<()> {
        let pending = !self
            .activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        if pending {
            self.mutate(|_| ()).await?;
            debug!("registry activity flushed");
        }
        Ok(())
    }

    fn apply_activity(&self, entries: &mut [Session]) -> Vec<(String, u64)> {
        let activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        let mut applied = Vec::new();
        for session in entries.iter_mut() {
            if let Some(&at) = activity.get(&session.id) {
                if at > session.last_activity {
                    session.last_activity = at;
                }
                applied.push((session.id.clone(), at));
            }
        }
        applied
    }
}

async fn read_entries(path: &Path) -> LingerResult<Vec<Session>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content)
        .map_err(|e| LingerError::Registry(format!("{}: {e}", path.display())))
}

async fn write_entries(path: &Path, entries: &[Session]) -> LingerResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionStatus, SpawnMode, DEFAULT_GROUP};
    use tempfile::TempDir;

    fn entry(id: &str, name: &str, pid: u32) -> Session {
        Session {
            id: id.into(),
            name: name.into(),
            group: DEFAULT_GROUP.into(),
            pid,
            command: vec!["sleep".into(), "60".into()],
            log_file_path: PathBuf::from(format!("/logs/{name}.{id}.log")),
            created_at: 1_000,
            last_activity: 1_000,
            status: SessionStatus::Running,
            exit_code: None,
            cols: 80,
            rows: 24,
            mode: SpawnMode::Pty,
        }
    }

    #[test]
    fn resolve_prefers_last_entry() {
        let entries = vec![entry("1", "A", 1), entry("2", "B", 7), entry("3", "A", 2)];
        assert_eq!(resolve(&entries, "A").map(|s| s.pid), Some(2));
        assert_eq!(resolve(&entries, "B").map(|s| s.pid), Some(7));
        assert!(resolve(&entries, "C").is_none());
    }

    #[tokio::test]
    async fn missing_and_empty_files_mean_no_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        let registry = Registry::open(&path);
        assert!(registry.load().await.unwrap().is_empty());

        tokio::fs::write(&path, "  \n").await.unwrap();
        assert!(registry.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        let err = Registry::open(&path).load().await.unwrap_err();
        assert!(matches!(err, LingerError::Registry(_)));
    }

    #[tokio::test]
    async fn append_keeps_duplicates_in_order() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path().join("state/sessions.json"));
        registry.append(entry("1", "A", 1)).await.unwrap();
        registry.append(entry("2", "B", 5)).await.unwrap();
        registry.append(entry("3", "A", 2)).await.unwrap();

        let loaded = registry.load().await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(registry.find("A").await.unwrap().unwrap().pid, 2);

        // A second handle on the same file sees the same state.
        let other = Registry::open(registry.path());
        assert_eq!(other.load().await.unwrap(), loaded);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path().join("sessions.json"));
        registry.append(entry("1", "A", 1)).await.unwrap();
        assert!(registry.append(entry("1", "B", 2)).await.is_err());
    }

    #[tokio::test]
    async fn update_and_remove_by_id() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path().join("sessions.json"));
        registry.append(entry("1", "A", 1)).await.unwrap();
        registry.append(entry("2", "A", 2)).await.unwrap();

        let updated = registry
            .update("1", |s| {
                s.status = SessionStatus::Exited;
                s.exit_code = Some(3);
            })
            .await
            .unwrap();
        assert!(updated);
        assert!(!registry.update("missing", |_| {}).await.unwrap());

        let first = registry.get("1").await.unwrap().unwrap();
        assert_eq!(first.status, SessionStatus::Exited);
        assert_eq!(first.exit_code, Some(3));

        let removed = registry.remove_id("2").await.unwrap().unwrap();
        assert_eq!(removed.pid, 2);
        assert_eq!(registry.find("A").await.unwrap().unwrap().id, "1");
        assert!(registry.remove_id("2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touches_overlay_reads_and_flush_persists() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path().join("sessions.json"));
        registry.append(entry("1", "A", 1)).await.unwrap();

        registry.touch("1", 5_000);
        registry.touch("1", 4_000);
        assert_eq!(registry.get("1").await.unwrap().unwrap().last_activity, 5_000);

        let fresh = Registry::open(registry.path());
        assert_eq!(fresh.get("1").await.unwrap().unwrap().last_activity, 1_000);

        registry.flush().await.unwrap();
        assert_eq!(fresh.get("1").await.unwrap().unwrap().last_activity, 5_000);
    }
}
