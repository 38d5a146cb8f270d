//! Fan-out of a session's live output to any number of observers.
//!
//! The broadcaster owns the session's [`TerminalBuffer`]. Publishing a chunk
//! and attaching an observer both run under one lock, so a new observer's
//! replay (taken from the terminal buffer) and its first live chunk meet
//! exactly: nothing is missed and nothing is delivered twice.
//!
//! Observers get a bounded queue. A publisher never waits on a slow
//! observer; an observer whose queue is full is dropped instead.

use super::pty::ExitReason;
use super::terminal::TerminalBuffer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// What an observer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Data(Vec<u8>),
    /// The process is gone. Always the last event.
    Exit(ExitReason),
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<OutputEvent>,
    /// Set when the observer is dropped for falling behind.
    lagged: Arc<AtomicBool>,
}

struct Inner {
    terminal: TerminalBuffer,
    observers: Vec<Subscriber>,
    exit: Option<ExitReason>,
    published: u64,
    next_id: u64,
}

pub struct Broadcaster {
    inner: Arc<Mutex<Inner>>,
}

impl Broadcaster {
    pub fn new(terminal: TerminalBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                terminal,
                observers: Vec::new(),
                exit: None,
                published: 0,
                next_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed a chunk to the terminal buffer and every observer.
    pub fn publish(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return;
        }
        inner.terminal.write(data);
        inner.published += data.len() as u64;
        inner.observers.retain(|sub| {
            match sub.tx.try_send(OutputEvent::Data(data.to_vec())) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(observer = sub.id, "observer queue full, dropping observer");
                    sub.lagged.store(true, Ordering::SeqCst);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Register an observer after running `replay` against the terminal
    /// buffer, atomically with respect to [`publish`](Self::publish).
    ///
    /// If the session has already exited the observer receives `Exit`
    /// straight away.
    pub fn attach<R>(
        &self,
        queue: usize,
        replay: impl FnOnce(&mut TerminalBuffer) -> R,
    ) -> (R, Observer) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let mut inner = self.lock();
        let result = replay(&mut inner.terminal);
        let id = inner.next_id;
        inner.next_id += 1;
        let lagged = Arc::new(AtomicBool::new(false));
        match inner.exit {
            Some(reason) => {
                let _ = tx.try_send(OutputEvent::Exit(reason));
            }
            None => inner.observers.push(Subscriber {
                id,
                tx,
                lagged: lagged.clone(),
            }),
        }
        debug!(observer = id, offset = inner.published, "observer attached");
        let observer = Observer {
            id,
            rx,
            offset: inner.published,
            finished: false,
            lagged,
            inner: Arc::downgrade(&self.inner),
        };
        (result, observer)
    }

    /// Deliver `Exit` to every observer and refuse further output.
    pub fn close(&self, reason: ExitReason) {
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return;
        }
        inner.exit = Some(reason);
        for sub in inner.observers.drain(..) {
            let _ = sub.tx.try_send(OutputEvent::Exit(reason));
        }
    }

    /// Run `f` with exclusive access to the terminal buffer.
    pub fn with_terminal<R>(&self, f: impl FnOnce(&mut TerminalBuffer) -> R) -> R {
        f(&mut self.lock().terminal)
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Total bytes published.
    pub fn published(&self) -> u64 {
        self.lock().published
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.lock().exit
    }
}

/// A live subscription to a session's output. Dropping it detaches.
pub struct Observer {
    id: u64,
    rx: mpsc::Receiver<OutputEvent>,
    offset: u64,
    finished: bool,
    lagged: Arc<AtomicBool>,
    inner: Weak<Mutex<Inner>>,
}

impl Observer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Output offset: bytes published before this observer attached plus
    /// bytes it has received since.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next event, or `None` once the stream is over.
    ///
    /// An observer dropped for falling behind sees `None` without `Exit`.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(OutputEvent::Data(data)) => {
                self.offset += data.len() as u64;
                Some(OutputEvent::Data(data))
            }
            Some(exit) => {
                self.finished = true;
                Some(exit)
            }
            None => {
                self.finished = true;
                if self.lagged.load(Ordering::SeqCst) {
                    return None;
                }
                // Exit could not be queued behind a full queue.
                let inner = self.inner.upgrade()?;
                let exit = inner.lock().unwrap_or_else(PoisonError::into_inner).exit;
                exit.map(OutputEvent::Exit)
            }
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.observers.retain(|sub| sub.id != self.id);
            debug!(observer = self.id, "observer detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linger_core::text::LineDecoder;

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(TerminalBuffer::new(80, 24, 10_000))
    }

    async fn drain(observer: &mut Observer) -> (Vec<u8>, Option<ExitReason>) {
        let mut data = Vec::new();
        while let Some(event) = observer.recv().await {
            match event {
                OutputEvent::Data(chunk) => data.extend_from_slice(&chunk),
                OutputEvent::Exit(reason) => return (data, Some(reason)),
            }
        }
        (data, None)
    }

    #[tokio::test]
    async fn replay_and_live_meet_exactly() {
        let b = broadcaster();
        b.publish(b"a\n");
        let (replay1, mut first) = b.attach(16, |t| t.lines_since(0).lines);
        b.publish(b"b\n");
        let (replay2, mut second) = b.attach(16, |t| t.lines_since(0).lines);
        b.publish(b"c\n");
        b.close(ExitReason::Exited(0));

        assert_eq!(replay1, vec!["a"]);
        assert_eq!(drain(&mut first).await, (b"b\nc\n".to_vec(), Some(ExitReason::Exited(0))));
        assert_eq!(first.offset(), 6);

        assert_eq!(replay2, vec!["a", "b"]);
        assert_eq!(drain(&mut second).await, (b"c\n".to_vec(), Some(ExitReason::Exited(0))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_observers_see_contiguous_streams() {
        const N: usize = 2_000;
        let b = Arc::new(broadcaster());

        let publisher = {
            let b = b.clone();
            tokio::spawn(async move {
                for i in 0..N {
                    b.publish(format!("{i}\n").as_bytes());
                    if i % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                b.close(ExitReason::Exited(0));
            })
        };

        let mut handles = Vec::new();
        for _ in 0..2 {
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                let (mut lines, mut observer) = b.attach(N + 1, |t| t.lines_since(0).lines);
                let (live, exit) = drain(&mut observer).await;
                lines.extend(LineDecoder::new().feed(&live));
                (lines, exit)
            }));
        }

        publisher.await.unwrap();
        let expected: Vec<String> = (0..N).map(|i| i.to_string()).collect();
        for handle in handles {
            let (lines, exit) = handle.await.unwrap();
            assert_eq!(lines, expected);
            assert_eq!(exit, Some(ExitReason::Exited(0)));
        }
    }

    #[tokio::test]
    async fn full_queue_drops_observer_without_blocking() {
        let b = broadcaster();
        let (_, mut slow) = b.attach(1, |_| ());
        b.publish(b"one");
        b.publish(b"two");
        assert_eq!(b.observer_count(), 0);

        assert_eq!(slow.recv().await, Some(OutputEvent::Data(b"one".to_vec())));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_observer_never_sees_exit() {
        let b = broadcaster();
        let (_, mut slow) = b.attach(1, |_| ());
        let (_, mut fast) = b.attach(4, |_| ());
        b.publish(b"one");
        b.publish(b"two");
        b.close(ExitReason::Exited(0));

        // "two" never reached the slow observer, so its stream ends without Exit.
        assert_eq!(slow.recv().await, Some(OutputEvent::Data(b"one".to_vec())));
        assert_eq!(slow.recv().await, None);
        assert_eq!(slow.recv().await, None);

        assert_eq!(drain(&mut fast).await, (b"onetwo".to_vec(), Some(ExitReason::Exited(0))));
    }

    #[tokio::test]
    async fn attach_after_close_gets_exit() {
        let b = broadcaster();
        b.publish(b"bye\n");
        b.close(ExitReason::Signaled(9));
        b.publish(b"ignored");
        assert_eq!(b.published(), 4);

        let (tail, mut late) = b.attach(4, |t| t.tail(1));
        assert_eq!(tail, vec!["bye"]);
        assert_eq!(late.recv().await, Some(OutputEvent::Exit(ExitReason::Signaled(9))));
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn exit_reaches_observer_with_full_queue() {
        let b = broadcaster();
        let (_, mut observer) = b.attach(1, |_| ());
        b.publish(b"x");
        b.close(ExitReason::Exited(2));

        assert_eq!(observer.recv().await, Some(OutputEvent::Data(b"x".to_vec())));
        assert_eq!(observer.recv().await, Some(OutputEvent::Exit(ExitReason::Exited(2))));
    }

    #[test]
    fn dropping_observer_detaches() {
        let b = broadcaster();
        let (_, first) = b.attach(4, |_| ());
        let (_, _second) = b.attach(4, |_| ());
        assert_eq!(b.observer_count(), 2);
        drop(first);
        assert_eq!(b.observer_count(), 1);
    }
}
