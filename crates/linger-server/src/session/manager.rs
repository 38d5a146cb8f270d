//! Session lifecycle management.
//!
//! The manager ties the durable registry to the sessions this process hosts.
//! A hosted session owns a supervisor, a broadcaster (with the terminal
//! buffer) and an output pump task. Every registry entry, hosted or not, is
//! answered from the registry file with liveness re-derived on each read.

use super::attach::InputHandle;
use super::broadcast::Broadcaster;
use super::pty::{ExitReason, ProcessEvent, SpawnOptions, Supervisor};
use super::terminal::{Snapshot, TerminalBuffer};
use linger_core::liveness::{terminate_pid, LivenessProbe};
use linger_core::{
    generate_session_id, log, now_ms, resolve, LingerError, LingerResult, LogSink, Registry,
    Session, SessionEntry, SessionStatus, SpawnMode, StatePaths, DEFAULT_GROUP,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables of a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub paths: StatePaths,
    /// Lines of history kept per hosted session.
    pub scrollback_lines: usize,
    /// Live hosted sessions allowed at once.
    pub max_sessions: usize,
    /// Sessions idle for longer are swept. `None` disables sweeping.
    pub idle_timeout: Option<Duration>,
    /// How long `kill` waits after SIGTERM before SIGKILL.
    pub kill_timeout: Duration,
    /// Per-observer queue length, in chunks.
    pub observer_queue: usize,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl SessionConfig {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            scrollback_lines: 10_000,
            max_sessions: 64,
            idle_timeout: None,
            kill_timeout: Duration::from_secs(5),
            observer_queue: 256,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Defaults to the session id.
    pub name: Option<String>,
    /// Defaults to [`DEFAULT_GROUP`].
    pub group: Option<String>,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub mode: SpawnMode,
}

/// A session whose process this manager supervises.
pub struct HostedSession {
    pub id: String,
    pub group: String,
    pub(crate) supervisor: Supervisor,
    pub(crate) broadcaster: Broadcaster,
    kill_requested: AtomicBool,
    exit: watch::Receiver<Option<ExitReason>>,
}

impl HostedSession {
    pub fn pid(&self) -> u32 {
        self.supervisor.pid()
    }

    /// True once the pump has logged all output and recorded the exit.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.broadcaster.observer_count()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.broadcaster.with_terminal(|t| t.snapshot())
    }

    /// Resize the process's terminal and the terminal buffer. Returns `false`
    /// if the process has exited.
    pub fn resize(&self, cols: u16, rows: u16) -> LingerResult<bool> {
        if cols == 0 || rows == 0 {
            return Err(LingerError::InvalidRequest(format!("invalid size {cols}x{rows}")));
        }
        if self.has_exited() {
            return Ok(false);
        }
        let outcome = match self.supervisor.resize(cols, rows) {
            Ok(outcome) => outcome,
            // Exited between the check and the resize.
            Err(LingerError::AlreadyExited(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.broadcaster.with_terminal(|t| t.resize(cols, rows));
        debug!(session_id = %self.id, cols, rows, ?outcome, "session resized");
        Ok(true)
    }

    /// Wait up to `timeout` for the pump to record the exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitReason> {
        let mut rx = self.exit.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|r| r.is_some())).await;
        match waited {
            Ok(Ok(reason)) => *reason,
            _ => None,
        }
    }

    /// Terminate with escalation. Returns `false` if already exited.
    async fn kill(&self, timeout: Duration) -> bool {
        if self.supervisor.has_exited() {
            return false;
        }
        self.kill_requested.store(true, Ordering::SeqCst);
        self.supervisor.terminate();
        if self.wait_exit(timeout).await.is_none() {
            self.supervisor.force_kill();
            if self.wait_exit(timeout).await.is_none() {
                warn!(session_id = %self.id, pid = self.pid(), "process survived SIGKILL");
            }
        }
        true
    }
}

/// Manages every session in the registry and hosts the ones it created.
pub struct SessionManager {
    config: SessionConfig,
    registry: Arc<Registry>,
    probe: Arc<dyn LivenessProbe>,
    hosted: Arc<RwLock<HashMap<String, Arc<HostedSession>>>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, probe: Arc<dyn LivenessProbe>) -> Self {
        let registry = Arc::new(Registry::open(config.paths.registry_file()));
        Self {
            config,
            registry,
            probe,
            hosted: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Mark `running` entries whose process is gone as `unknown`. Run once
    /// at startup, before this manager hosts anything.
    pub async fn reconcile(&self) -> LingerResult<usize> {
        let probe = self.probe.clone();
        let stale = self
            .registry
            .mutate(|entries| {
                let mut stale = 0;
                for s in entries.iter_mut() {
                    if s.status == SessionStatus::Running && !probe.is_alive(s.pid, &s.command) {
                        s.status = SessionStatus::Unknown;
                        stale += 1;
                    }
                }
                stale
            })
            .await?;
        if stale > 0 {
            info!(count = stale, "marked stale sessions as unknown");
        }
        Ok(stale)
    }

    /// Spawn a process and register it.
    pub async fn create(&self, mut opts: CreateOptions) -> LingerResult<Session> {
        if opts.command.first().map_or(true, |c| c.is_empty()) {
            return Err(LingerError::InvalidRequest("command must not be empty".into()));
        }
        let cols = opts.cols.unwrap_or(self.config.default_cols);
        let rows = opts.rows.unwrap_or(self.config.default_rows);
        if cols == 0 || rows == 0 {
            return Err(LingerError::InvalidRequest(format!("invalid size {cols}x{rows}")));
        }
        let live = self.count().await;
        if live >= self.config.max_sessions {
            return Err(LingerError::InvalidRequest(format!(
                "max sessions ({}) reached",
                self.config.max_sessions
            )));
        }

        opts.cols = Some(cols);
        opts.rows = Some(rows);

        let id = generate_session_id();
        let name = opts.name.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| id.clone());
        let log_file_path = self.config.paths.log_file(&name, &id);
        self.launch(opts, id, name, log_file_path).await
    }

    /// Spawn the process of a validated create and start hosting it.
    async fn launch(
        &self,
        opts: CreateOptions,
        id: String,
        name: String,
        log_file_path: PathBuf,
    ) -> LingerResult<Session> {
        let cols = opts.cols.unwrap_or(self.config.default_cols);
        let rows = opts.rows.unwrap_or(self.config.default_rows);
        let group = opts.group.filter(|g| !g.is_empty()).unwrap_or_else(|| DEFAULT_GROUP.to_string());
        let sink = LogSink::create(&log_file_path).await?;

        let (supervisor, events) = Supervisor::spawn(SpawnOptions {
            command: opts.command.clone(),
            cwd: opts.cwd,
            env: opts.env,
            cols,
            rows,
            mode: opts.mode,
        })?;

        let now = now_ms();
        let session = Session {
            id: id.clone(),
            name,
            group: group.clone(),
            pid: supervisor.pid(),
            command: opts.command,
            log_file_path,
            created_at: now,
            last_activity: now,
            status: SessionStatus::Running,
            exit_code: None,
            cols,
            rows,
            mode: opts.mode,
        };
        if let Err(e) = self.registry.append(session.clone()).await {
            supervisor.force_kill();
            return Err(e);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let hosted = Arc::new(HostedSession {
            id: id.clone(),
            group,
            supervisor,
            broadcaster: Broadcaster::new(TerminalBuffer::new(
                cols,
                rows,
                self.config.scrollback_lines,
            )),
            kill_requested: AtomicBool::new(false),
            exit: exit_rx,
        });
        self.hosted.write().await.insert(id.clone(), hosted.clone());
        let registry = self.registry.clone();
        let hosted_map = self.hosted.clone();
        tokio::spawn(async move {
            let id = hosted.id.clone();
            pump(registry, hosted, sink, events, exit_tx).await;
            // Finished sessions are answered from the registry and their log.
            hosted_map.write().await.remove(&id);
        });

        info!(
            session_id = %id,
            name = %session.name,
            pid = session.pid,
            command = %session.command_line(),
            "session created"
        );
        Ok(session)
    }

    /// Every registry entry with fresh liveness, in registration order.
    pub async fn list(&self) -> LingerResult<Vec<SessionEntry>> {
        let entries = self.registry.load().await?;
        let mut out = Vec::with_capacity(entries.len());
        for session in entries {
            let alive = self.is_alive(&session).await;
            out.push(SessionEntry { session, alive });
        }
        Ok(out)
    }

    pub async fn list_group(&self, group: &str) -> LingerResult<Vec<SessionEntry>> {
        let mut entries = self.list().await?;
        entries.retain(|e| e.session.group == group);
        Ok(entries)
    }

    /// Resolve a name; the most recent entry with that name wins.
    pub async fn find(&self, name: &str) -> LingerResult<SessionEntry> {
        let entries = self.registry.load().await?;
        let session = resolve(&entries, name)
            .cloned()
            .ok_or_else(|| LingerError::NotFound(name.to_string()))?;
        let alive = self.is_alive(&session).await;
        Ok(SessionEntry { session, alive })
    }

    /// Look up an entry by group and id.
    pub async fn get(&self, group: &str, id: &str) -> LingerResult<SessionEntry> {
        let session = self
            .registry
            .get(id)
            .await?
            .filter(|s| s.group == group)
            .ok_or_else(|| LingerError::NotFound(id.to_string()))?;
        let alive = self.is_alive(&session).await;
        Ok(SessionEntry { session, alive })
    }

    /// Hosted session with this id, if this manager supervises it.
    pub async fn hosted(&self, id: &str) -> Option<Arc<HostedSession>> {
        self.hosted.read().await.get(id).cloned()
    }

    async fn hosted_in(&self, group: &str, id: &str) -> Option<Arc<HostedSession>> {
        self.hosted(id).await.filter(|h| h.group == group)
    }

    /// Hosted sessions are alive until their pump records the exit. Others
    /// are alive only if the registry doesn't record an exit and the probe
    /// agrees.
    pub async fn is_alive(&self, session: &Session) -> bool {
        if let Some(hosted) = self.hosted(&session.id).await {
            return !hosted.has_exited() && session.status == SessionStatus::Running;
        }
        match session.status {
            SessionStatus::Exited | SessionStatus::Killed => false,
            SessionStatus::Running | SessionStatus::Unknown => {
                self.probe.is_alive(session.pid, &session.command)
            }
        }
    }

    /// Send input. `Ok(false)` when the process has exited or is not hosted
    /// here.
    pub async fn write(&self, group: &str, id: &str, data: &[u8]) -> LingerResult<bool> {
        match self.hosted_in(group, id).await {
            Some(hosted) => Ok(self.input_handle(hosted).write(data).await),
            None => {
                self.get(group, id).await?;
                Ok(false)
            }
        }
    }

    /// Resize. `Ok(false)` when the process has exited or is not hosted here.
    pub async fn resize(&self, group: &str, id: &str, cols: u16, rows: u16) -> LingerResult<bool> {
        if cols == 0 || rows == 0 {
            return Err(LingerError::InvalidRequest(format!("invalid size {cols}x{rows}")));
        }
        match self.hosted_in(group, id).await {
            Some(hosted) => {
                let resized = self.input_handle(hosted).resize(cols, rows)?;
                if resized {
                    self.registry
                        .update(id, |s| {
                            s.cols = cols;
                            s.rows = rows;
                        })
                        .await?;
                }
                Ok(resized)
            }
            None => {
                self.get(group, id).await?;
                Ok(false)
            }
        }
    }

    /// Snapshot of a session's screen. Sessions not hosted here (finished
    /// ones included) are rebuilt from their log.
    pub async fn snapshot(&self, group: &str, id: &str) -> LingerResult<Snapshot> {
        if let Some(hosted) = self.hosted_in(group, id).await.filter(|h| !h.has_exited()) {
            return Ok(hosted.snapshot());
        }
        let entry = self.get(group, id).await?;
        let session = entry.session;
        let raw = log::read_from(&session.log_file_path, 0).await?;
        let mut terminal =
            TerminalBuffer::from_log(&raw, session.cols, session.rows, self.config.scrollback_lines);
        Ok(terminal.snapshot())
    }

    pub(crate) fn input_handle(&self, hosted: Arc<HostedSession>) -> InputHandle {
        InputHandle::new(hosted, self.registry.clone())
    }

    /// Wait up to `timeout` for a session's exit to be recorded. Returns the
    /// entry once it is no longer running.
    pub async fn wait_exit(&self, id: &str, timeout: Duration) -> LingerResult<Option<Session>> {
        if let Some(hosted) = self.hosted(id).await {
            if hosted.wait_exit(timeout).await.is_none() {
                return Ok(None);
            }
        }
        let session = self
            .registry
            .get(id)
            .await?
            .ok_or_else(|| LingerError::NotFound(id.to_string()))?;
        Ok((session.status != SessionStatus::Running).then_some(session))
    }

    /// Kill the session `name` resolves to. The entry stays in the registry.
    pub async fn kill(&self, name: &str) -> LingerResult<bool> {
        let entry = self.find(name).await?;
        self.kill_id(&entry.session.group, &entry.session.id).await
    }

    /// Terminate, wait up to `kill_timeout`, escalate to SIGKILL, and mark the
    /// entry `killed`. Returns `false` if the process was already dead.
    pub async fn kill_id(&self, group: &str, id: &str) -> LingerResult<bool> {
        if let Some(hosted) = self.hosted_in(group, id).await {
            let killed = hosted.kill(self.config.kill_timeout).await;
            if killed {
                info!(session_id = %id, "session killed");
            }
            return Ok(killed);
        }

        let entry = self.get(group, id).await?;
        if !entry.alive {
            return Ok(false);
        }
        let session = entry.session;
        let gone = terminate_pid(
            self.probe.as_ref(),
            session.pid,
            &session.command,
            self.config.kill_timeout,
        )
        .await;
        if !gone {
            warn!(session_id = %id, pid = session.pid, "process survived kill");
        }
        self.registry
            .update(id, |s| s.status = SessionStatus::Killed)
            .await?;
        info!(session_id = %id, pid = session.pid, "unhosted session killed");
        Ok(true)
    }

    /// Kill every live session of a group. Returns how many were killed.
    pub async fn kill_group(&self, group: &str) -> LingerResult<usize> {
        let mut killed = 0;
        for entry in self.list_group(group).await? {
            if entry.alive && self.kill_id(group, &entry.session.id).await? {
                killed += 1;
            }
        }
        Ok(killed)
    }

    /// Kill (if alive) and delete the session `name` resolves to.
    pub async fn remove(&self, name: &str) -> LingerResult<Session> {
        let entry = self.find(name).await?;
        self.remove_id(&entry.session.group, &entry.session.id).await
    }

    /// Kill (if alive) and delete an entry. The log file is kept.
    pub async fn remove_id(&self, group: &str, id: &str) -> LingerResult<Session> {
        self.kill_id(group, id).await?;
        self.hosted.write().await.remove(id);
        let removed = self
            .registry
            .remove_id(id)
            .await?
            .ok_or_else(|| LingerError::NotFound(id.to_string()))?;
        info!(session_id = %id, name = %removed.name, "session removed");
        Ok(removed)
    }

    /// Remove entries idle for longer than the idle timeout. Live ones are
    /// killed first. Returns the removed ids.
    pub async fn sweep(&self, now: u64) -> LingerResult<Vec<String>> {
        let Some(threshold) = self.config.idle_timeout else {
            return Ok(Vec::new());
        };
        let threshold = threshold.as_millis() as u64;
        let mut removed = Vec::new();
        for session in self.registry.load().await? {
            let idle = session.idle_ms(now);
            if idle <= threshold {
                continue;
            }
            warn!(session_id = %session.id, name = %session.name, idle_secs = idle / 1000, "session expired (idle)");
            match self.remove_id(&session.group, &session.id).await {
                Ok(_) | Err(LingerError::NotFound(_)) => removed.push(session.id),
                Err(e) => warn!(session_id = %session.id, "sweep failed: {e}"),
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "sweep removed sessions");
        }
        Ok(removed)
    }

    /// Live hosted sessions.
    pub async fn count(&self) -> usize {
        self.hosted
            .read()
            .await
            .values()
            .filter(|h| !h.has_exited())
            .count()
    }

    /// Persist pending activity timestamps.
    pub async fn flush(&self) -> LingerResult<()> {
        self.registry.flush().await
    }

    /// Kill every hosted session and flush the registry.
    pub async fn shutdown(&self) -> LingerResult<()> {
        let hosted: Vec<_> = self.hosted.read().await.values().cloned().collect();
        for session in hosted {
            if session.kill(self.config.kill_timeout).await {
                info!(session_id = %session.id, "session stopped for shutdown");
            }
        }
        self.flush().await
    }
}

/// Drain a supervisor's events: log first, then terminal buffer and
/// observers, then activity.
///
/// Output that cannot be logged ends the session: the process is killed and
/// the exit is recorded as lost, so history never has silent gaps.
async fn pump(
    registry: Arc<Registry>,
    hosted: Arc<HostedSession>,
    mut sink: LogSink,
    mut events: mpsc::Receiver<ProcessEvent>,
    exit_tx: watch::Sender<Option<ExitReason>>,
) {
    let id = hosted.id.clone();
    let reason = loop {
        match events.recv().await {
            Some(ProcessEvent::Data(chunk)) => {
                if let Err(e) = sink.append(&chunk).await {
                    warn!(session_id = %id, "log append failed, killing process: {e}");
                    hosted.supervisor.force_kill();
                    reap(&mut events).await;
                    break ExitReason::Lost;
                }
                hosted.broadcaster.publish(&chunk);
                registry.touch(&id, now_ms());
            }
            Some(ProcessEvent::Exit(reason)) => break reason,
            None => break ExitReason::Lost,
        }
    };

    let status = if hosted.kill_requested.load(Ordering::SeqCst) {
        SessionStatus::Killed
    } else if reason == ExitReason::Lost {
        SessionStatus::Unknown
    } else {
        SessionStatus::Exited
    };
    let code = reason.code();
    let recorded = registry
        .update(&id, |s| {
            s.status = status;
            s.exit_code = Some(code);
            s.last_activity = s.last_activity.max(now_ms());
        })
        .await;
    if let Err(e) = recorded {
        warn!(session_id = %id, "failed to record exit: {e}");
    }
    if let Err(e) = sink.sync().await {
        debug!(session_id = %id, "log sync failed: {e}");
    }
    hosted.supervisor.release();
    info!(session_id = %id, code, %status, "session ended");
    let _ = exit_tx.send(Some(reason));
    // Observers hear the exit only after it is on record.
    hosted.broadcaster.close(reason);
}

/// Discard events until the supervisor reports the exit.
async fn reap(events: &mut mpsc::Receiver<ProcessEvent>) {
    let drained = tokio::time::timeout(REAP_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let ProcessEvent::Exit(_) = event {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("process not reaped after kill");
    }
}
