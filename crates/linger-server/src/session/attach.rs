//! Attach coordination: turn a session reference into either a live
//! subscription (replay + observer + optional input) or a replay of the
//! stored log when the process is gone or not hosted here.
//!
//! Detaching is dropping the attachment. It never affects the session.

use super::broadcast::Observer;
use super::manager::{HostedSession, SessionManager};
use super::terminal::Snapshot;
use linger_core::{log, now_ms, LingerResult, Registry, Session};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Replay only the last N lines of history.
    pub lines: Option<usize>,
    /// Replay only lines containing this text.
    pub search: Option<String>,
    /// Hand out an [`InputHandle`].
    pub interactive: bool,
}

impl AttachOptions {
    fn wants_lines(&self) -> bool {
        self.lines.is_some() || self.search.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// What a live observer is shown before live output starts.
#[derive(Debug, Clone)]
pub enum Replay {
    Snapshot(Snapshot),
    Lines(Vec<String>),
}

pub struct LiveAttachment {
    pub session: Session,
    pub replay: Replay,
    pub observer: Observer,
    pub input: Option<InputHandle>,
}

pub enum Attachment {
    Live(LiveAttachment),
    /// Stored output only. `process_alive` is set when the process runs but
    /// is supervised elsewhere.
    Replay {
        session: Session,
        lines: Vec<String>,
        process_alive: bool,
    },
}

impl Attachment {
    pub fn is_live(&self) -> bool {
        matches!(self, Attachment::Live(_))
    }

    pub fn session(&self) -> &Session {
        match self {
            Attachment::Live(live) => &live.session,
            Attachment::Replay { session, .. } => session,
        }
    }
}

/// Input path of an interactive observer. Each call counts as activity.
#[derive(Clone)]
pub struct InputHandle {
    hosted: Arc<HostedSession>,
    registry: Arc<Registry>,
}

impl InputHandle {
    pub(crate) fn new(hosted: Arc<HostedSession>, registry: Arc<Registry>) -> Self {
        Self { hosted, registry }
    }

    /// Returns `false` once the process has exited.
    pub async fn write(&self, data: &[u8]) -> bool {
        self.registry.touch(&self.hosted.id, now_ms());
        self.hosted.supervisor.write(data).await
    }

    /// Returns `Ok(false)` once the process has exited.
    pub fn resize(&self, cols: u16, rows: u16) -> LingerResult<bool> {
        self.registry.touch(&self.hosted.id, now_ms());
        self.hosted.resize(cols, rows)
    }
}

impl SessionManager {
    /// Attach to the session `name` resolves to.
    pub async fn attach(&self, name: &str, opts: AttachOptions) -> LingerResult<Attachment> {
        let entry = self.find(name).await?;
        self.attach_session(entry.session, opts).await
    }

    /// Attach by group and id.
    pub async fn attach_id(
        &self,
        group: &str,
        id: &str,
        opts: AttachOptions,
    ) -> LingerResult<Attachment> {
        let entry = self.get(group, id).await?;
        self.attach_session(entry.session, opts).await
    }

    async fn attach_session(&self, session: Session, opts: AttachOptions) -> LingerResult<Attachment> {
        let hosted = self
            .hosted(&session.id)
            .await
            .filter(|h| !h.has_exited());

        let Some(hosted) = hosted else {
            let process_alive = self.is_alive(&session).await;
            let lines =
                log::tail_lines(&session.log_file_path, opts.lines, opts.search.as_deref()).await?;
            debug!(session_id = %session.id, process_alive, lines = lines.len(), "replaying stored output");
            return Ok(Attachment::Replay {
                session,
                lines,
                process_alive,
            });
        };

        let queue = self.config().observer_queue;
        let (replay, observer) = if opts.wants_lines() {
            let (lines, observer) = hosted
                .broadcaster
                .attach(queue, |t| t.select(opts.lines, opts.search.as_deref()));
            (Replay::Lines(lines), observer)
        } else {
            let (snapshot, observer) = hosted.broadcaster.attach(queue, |t| t.snapshot());
            (Replay::Snapshot(snapshot), observer)
        };
        self.registry().touch(&session.id, now_ms());
        let input = opts
            .interactive
            .then(|| self.input_handle(hosted.clone()));
        debug!(session_id = %session.id, observer = observer.id(), interactive = opts.interactive, "attached");
        Ok(Attachment::Live(LiveAttachment {
            session,
            replay,
            observer,
            input,
        }))
    }
}
