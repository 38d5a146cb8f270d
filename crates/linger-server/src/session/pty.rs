//! Process supervisor: spawns a command on a pseudo-terminal (portable-pty)
//! or on plain pipes (tokio::process) and turns its output into a stream of
//! [`ProcessEvent`]s.
//!
//! The event stream carries any number of `Data` chunks followed by exactly
//! one `Exit`. `Exit` is sent once the process has been reaped and its
//! output drained, or after a short grace period if something else (a
//! background grandchild, say) keeps the output stream open.

use linger_core::{LingerError, LingerResult, SpawnMode};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long to keep reading output after the process has been reaped.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const EVENT_QUEUE: usize = 256;
const INPUT_QUEUE: usize = 64;
const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// argv; must not be empty.
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub mode: SpawnMode,
}

/// Why a process's event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited(i32),
    Signaled(i32),
    /// Output could not be read or the process could not be waited on.
    Lost,
}

impl ExitReason {
    /// Shell-style exit code: the status, `128 + signal`, or `-1`.
    pub fn code(&self) -> i32 {
        match self {
            ExitReason::Exited(code) => *code,
            ExitReason::Signaled(sig) => 128 + sig,
            ExitReason::Lost => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Data(Vec<u8>),
    Exit(ExitReason),
}

/// Result of a resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The process's terminal was resized.
    Applied,
    /// Only the logical size changed (pipes mode, or the process is gone).
    LogicalOnly,
}

#[derive(Debug)]
enum ReaderEnd {
    Eof,
    Failed(std::io::Error),
}

/// Handle on a running (or finished) process.
pub struct Supervisor {
    pid: u32,
    mode: SpawnMode,
    /// Taken by [`release`](Supervisor::release), which ends the writer.
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// PTY master, for resize. `None` in pipes mode and once released.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pid", &self.pid)
            .field("mode", &self.mode)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl Supervisor {
    /// Spawn a process. Must be called from within a tokio runtime.
    pub fn spawn(opts: SpawnOptions) -> LingerResult<(Self, mpsc::Receiver<ProcessEvent>)> {
        if opts.command.is_empty() || opts.command[0].is_empty() {
            return Err(LingerError::InvalidRequest("empty command".into()));
        }
        match opts.mode {
            SpawnMode::Pty => spawn_pty(opts),
            SpawnMode::Pipes => spawn_pipes(opts),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn mode(&self) -> SpawnMode {
        self.mode
    }

    /// Whether `Exit` has been (or is about to be) emitted.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Send bytes to the process's input. Returns `false` once the process
    /// has exited.
    pub async fn write(&self, data: &[u8]) -> bool {
        if self.has_exited() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        let input = self
            .input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match input {
            Some(tx) => tx.send(data.to_vec()).await.is_ok(),
            None => false,
        }
    }

    /// Drop the input channel and PTY master of a finished process, which
    /// ends the writer and closes the master.
    pub fn release(&self) {
        let input = self.input.lock().unwrap_or_else(PoisonError::into_inner).take();
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner).take();
        if input.is_some() || master.is_some() {
            debug!(pid = self.pid, "process resources released");
        }
    }

    /// Resize the process's terminal. Pipes have none, so the resize is
    /// logical only and left to the terminal buffer.
    pub fn resize(&self, cols: u16, rows: u16) -> LingerResult<ResizeOutcome> {
        match self.native_resize(cols, rows) {
            Ok(()) => Ok(ResizeOutcome::Applied),
            Err(LingerError::ResizeUnsupported(_)) => Ok(ResizeOutcome::LogicalOnly),
            Err(e) => Err(e),
        }
    }

    fn native_resize(&self, cols: u16, rows: u16) -> LingerResult<()> {
        if self.mode == SpawnMode::Pipes {
            return Err(LingerError::ResizeUnsupported("pipes mode".into()));
        }
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(master) = master.as_ref().filter(|_| !self.has_exited()) else {
            return Err(LingerError::AlreadyExited(format!("pid {}", self.pid)));
        };
        let size = PtySize {
            rows: rows.max(1),
            cols: cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };
        master
            .resize(size)
            .map_err(|e| LingerError::Other(format!("PTY resize failed: {e}")))?;
        debug!(pid = self.pid, cols, rows, "PTY resized");
        Ok(())
    }

    /// Ask the process to exit (SIGHUP, then SIGTERM).
    pub fn terminate(&self) {
        if self.has_exited() {
            return;
        }
        debug!(pid = self.pid, "terminating process");
        signal_pid(self.pid, Kill::Polite);
    }

    /// SIGKILL.
    pub fn force_kill(&self) {
        if self.has_exited() {
            return;
        }
        warn!(pid = self.pid, "force killing process");
        signal_pid(self.pid, Kill::Force);
    }
}

fn spawn_pty(opts: SpawnOptions) -> LingerResult<(Supervisor, mpsc::Receiver<ProcessEvent>)> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows: opts.rows.max(1),
        cols: opts.cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    };
    let pair = pty_system
        .openpty(size)
        .map_err(|e| LingerError::SpawnFailed(format!("failed to open PTY: {e}")))?;

    let mut cmd = CommandBuilder::new(&opts.command[0]);
    cmd.args(&opts.command[1..]);
    if let Some(cwd) = &opts.cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| LingerError::SpawnFailed(format!("{}: {e}", opts.command[0])))?;
    // Only the child may hold the slave, or the reader never sees EOF.
    drop(pair.slave);

    let Some(pid) = child.process_id() else {
        let _ = child.kill();
        return Err(LingerError::SpawnFailed("spawned process has no pid".into()));
    };

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| LingerError::SpawnFailed(format!("failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| LingerError::SpawnFailed(format!("failed to take PTY writer: {e}")))?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
    let (done_tx, done_rx) = oneshot::channel();

    let data_tx = events_tx.clone();
    std::thread::Builder::new()
        .name(format!("pty-read-{pid}"))
        .spawn(move || {
            let end = read_pty(reader, &data_tx);
            let _ = done_tx.send(end);
        })
        .map_err(|e| LingerError::SpawnFailed(format!("failed to start reader: {e}")))?;

    std::thread::Builder::new()
        .name(format!("pty-write-{pid}"))
        .spawn(move || write_pty(writer, input_rx))
        .map_err(|e| LingerError::SpawnFailed(format!("failed to start writer: {e}")))?;

    let exited = Arc::new(AtomicBool::new(false));
    let wait = tokio::task::spawn_blocking(move || wait_pty_child(child, pid));
    tokio::spawn(monitor(pid, wait, done_rx, events_tx, exited.clone()));

    info!(pid, cols = size.cols, rows = size.rows, command = ?opts.command, "PTY spawned");
    Ok((
        Supervisor {
            pid,
            mode: SpawnMode::Pty,
            input: Mutex::new(Some(input_tx)),
            master: Mutex::new(Some(pair.master)),
            exited,
        },
        events_rx,
    ))
}

fn read_pty(mut reader: Box<dyn Read + Send>, tx: &mpsc::Sender<ProcessEvent>) -> ReaderEnd {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return ReaderEnd::Eof,
            Ok(n) => {
                if tx.blocking_send(ProcessEvent::Data(buf[..n].to_vec())).is_err() {
                    return ReaderEnd::Eof;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports a hung-up PTY master as EIO.
            Err(e) if e.raw_os_error() == Some(5) => return ReaderEnd::Eof,
            Err(e) => return ReaderEnd::Failed(e),
        }
    }
}

fn write_pty(mut writer: Box<dyn Write + Send>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            debug!("PTY write failed: {e}");
            break;
        }
    }
}

#[cfg(unix)]
fn wait_pty_child(_child: Box<dyn portable_pty::Child + Send + Sync>, pid: u32) -> ExitReason {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;

    loop {
        match waitpid(Pid::from_raw(pid as i32), None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitReason::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return ExitReason::Signaled(signal as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(pid, "waitpid failed: {e}");
                return ExitReason::Lost;
            }
        }
    }
}

#[cfg(not(unix))]
fn wait_pty_child(mut child: Box<dyn portable_pty::Child + Send + Sync>, pid: u32) -> ExitReason {
    match child.wait() {
        Ok(status) => ExitReason::Exited(status.exit_code() as i32),
        Err(e) => {
            warn!(pid, "wait failed: {e}");
            ExitReason::Lost
        }
    }
}

fn spawn_pipes(opts: SpawnOptions) -> LingerResult<(Supervisor, mpsc::Receiver<ProcessEvent>)> {
    use std::process::Stdio;

    let mut cmd = tokio::process::Command::new(&opts.command[0]);
    cmd.args(&opts.command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(&opts.env);
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| LingerError::SpawnFailed(format!("{}: {e}", opts.command[0])))?;
    let Some(pid) = child.id() else {
        return Err(LingerError::SpawnFailed("spawned process has no pid".into()));
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
    let (done_tx, done_rx) = oneshot::channel();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let data_tx = events_tx.clone();
    tokio::spawn(async move {
        let (out, err) = tokio::join!(
            read_pipe(stdout, data_tx.clone()),
            read_pipe(stderr, data_tx)
        );
        let end = match (out, err) {
            (ReaderEnd::Failed(e), _) | (_, ReaderEnd::Failed(e)) => ReaderEnd::Failed(e),
            _ => ReaderEnd::Eof,
        };
        let _ = done_tx.send(end);
    });

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if let Err(e) = async {
                    stdin.write_all(&data).await?;
                    stdin.flush().await
                }
                .await
                {
                    debug!(pid, "stdin write failed: {e}");
                    break;
                }
            }
        });
    }

    let exited = Arc::new(AtomicBool::new(false));
    let wait = tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => reason_from_status(status),
            Err(e) => {
                warn!(pid, "wait failed: {e}");
                ExitReason::Lost
            }
        }
    });
    tokio::spawn(monitor(pid, wait, done_rx, events_tx, exited.clone()));

    info!(pid, command = ?opts.command, "process spawned on pipes");
    Ok((
        Supervisor {
            pid,
            mode: SpawnMode::Pipes,
            input: Mutex::new(Some(input_tx)),
            master: Mutex::new(None),
            exited,
        },
        events_rx,
    ))
}

async fn read_pipe<R: AsyncRead + Unpin>(
    stream: Option<R>,
    tx: mpsc::Sender<ProcessEvent>,
) -> ReaderEnd {
    let Some(mut stream) = stream else {
        return ReaderEnd::Eof;
    };
    let mut buf = vec![0u8; READ_CHUNK];
    let mut prev_cr = false;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return ReaderEnd::Eof,
            Ok(n) => {
                let chunk = onlcr(&buf[..n], &mut prev_cr);
                if tx.send(ProcessEvent::Data(chunk)).await.is_err() {
                    return ReaderEnd::Eof;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return ReaderEnd::Failed(e),
        }
    }
}

/// Expand bare `\n` to `\r\n`, as a terminal's output processing would.
fn onlcr(data: &[u8], prev_cr: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &byte in data {
        if byte == b'\n' && !*prev_cr {
            out.push(b'\r');
        }
        out.push(byte);
        *prev_cr = byte == b'\r';
    }
    out
}

fn reason_from_status(status: std::process::ExitStatus) -> ExitReason {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitReason::Signaled(signal);
        }
    }
    match status.code() {
        Some(code) => ExitReason::Exited(code),
        None => ExitReason::Lost,
    }
}

enum First {
    Reaped(ExitReason),
    ReaderDone(ReaderEnd),
}

/// Wait for the process and its output, then emit the single `Exit`.
async fn monitor(
    pid: u32,
    mut wait: tokio::task::JoinHandle<ExitReason>,
    mut done: oneshot::Receiver<ReaderEnd>,
    events: mpsc::Sender<ProcessEvent>,
    exited: Arc<AtomicBool>,
) {
    let first = tokio::select! {
        reaped = &mut wait => First::Reaped(reaped.unwrap_or(ExitReason::Lost)),
        end = &mut done => First::ReaderDone(end.unwrap_or(ReaderEnd::Eof)),
    };

    let reason = match first {
        First::Reaped(reason) => {
            if tokio::time::timeout(DRAIN_GRACE, &mut done).await.is_err() {
                debug!(pid, "output still open after exit, not waiting for it");
            }
            reason
        }
        First::ReaderDone(ReaderEnd::Eof) => wait.await.unwrap_or(ExitReason::Lost),
        First::ReaderDone(ReaderEnd::Failed(e)) => {
            warn!(pid, "output read failed, killing process: {e}");
            signal_pid(pid, Kill::Force);
            let _ = wait.await;
            ExitReason::Lost
        }
    };

    exited.store(true, Ordering::SeqCst);
    info!(pid, code = reason.code(), "process exited");
    let _ = events.send(ProcessEvent::Exit(reason)).await;
}

#[derive(Clone, Copy)]
enum Kill {
    Polite,
    Force,
}

#[cfg(unix)]
fn signal_pid(pid: u32, how: Kill) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    let signals: &[Signal] = match how {
        Kill::Polite => &[Signal::SIGHUP, Signal::SIGTERM],
        Kill::Force => &[Signal::SIGKILL],
    };
    for signal in signals {
        if let Err(e) = kill(target, *signal) {
            debug!(pid, ?signal, "kill failed: {e}");
        }
    }
}

#[cfg(not(unix))]
fn signal_pid(pid: u32, _how: Kill) {
    warn!(pid, "signals are not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(command: &[&str], mode: SpawnMode) -> SpawnOptions {
        SpawnOptions {
            command: command.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: HashMap::new(),
            cols: 80,
            rows: 24,
            mode,
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<ProcessEvent>) -> (Vec<u8>, ExitReason) {
        let mut data = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(ProcessEvent::Data(chunk))) => data.extend_from_slice(&chunk),
                Ok(Some(ProcessEvent::Exit(reason))) => return (data, reason),
                Ok(None) => panic!("event stream ended without Exit"),
                Err(_) => panic!("timed out waiting for process"),
            }
        }
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitReason::Exited(3).code(), 3);
        assert_eq!(ExitReason::Signaled(9).code(), 137);
        assert_eq!(ExitReason::Lost.code(), -1);
    }

    #[test]
    fn onlcr_expands_bare_newlines() {
        let mut prev = false;
        assert_eq!(onlcr(b"a\nb\r\n", &mut prev), b"a\r\nb\r\n");
        assert_eq!(onlcr(b"x\r", &mut prev), b"x\r");
        assert_eq!(onlcr(b"\ny", &mut prev), b"\ny");
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = Supervisor::spawn(opts(&[], SpawnMode::Pipes)).unwrap_err();
        assert!(matches!(err, LingerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let err = Supervisor::spawn(opts(&["/nonexistent/linger-test"], SpawnMode::Pipes)).unwrap_err();
        assert!(matches!(err, LingerError::SpawnFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipes_output_and_exit_code() {
        let (sup, mut rx) =
            Supervisor::spawn(opts(&["sh", "-c", "echo hello; echo oops >&2; exit 3"], SpawnMode::Pipes))
                .unwrap();
        assert!(sup.pid() > 0);
        let (data, reason) = collect(&mut rx).await;
        assert!(contains(&data, b"hello\r\n"));
        assert!(contains(&data, b"oops\r\n"));
        assert_eq!(reason, ExitReason::Exited(3));
        assert!(sup.has_exited());
        assert!(!sup.write(b"late").await);
        assert!(rx.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipes_input_resize_and_terminate() {
        let (sup, mut rx) = Supervisor::spawn(opts(&["cat"], SpawnMode::Pipes)).unwrap();
        assert!(sup.write(b"ping\n").await);

        let mut seen = Vec::new();
        while !contains(&seen, b"ping") {
            match rx.recv().await {
                Some(ProcessEvent::Data(chunk)) => seen.extend_from_slice(&chunk),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(sup.resize(100, 40).unwrap(), ResizeOutcome::LogicalOnly);

        sup.terminate();
        let (_, reason) = collect(&mut rx).await;
        assert!(matches!(reason, ExitReason::Signaled(_)), "{reason:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn release_closes_input() {
        let (sup, mut rx) = Supervisor::spawn(opts(&["cat"], SpawnMode::Pipes)).unwrap();
        sup.release();
        assert!(!sup.write(b"late\n").await);
        let (data, reason) = collect(&mut rx).await;
        assert!(data.is_empty());
        assert_eq!(reason, ExitReason::Exited(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn force_kill_reports_sigkill() {
        let (sup, mut rx) =
            Supervisor::spawn(opts(&["sh", "-c", "exec sleep 30"], SpawnMode::Pipes))
                .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.force_kill();
        let (_, reason) = collect(&mut rx).await;
        assert_eq!(reason, ExitReason::Signaled(9));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pty_runs_command_on_a_terminal() {
        let (sup, mut rx) = Supervisor::spawn(opts(
            &["sh", "-c", "test -t 1 && echo on-a-tty"],
            SpawnMode::Pty,
        ))
        .unwrap();
        let (data, reason) = collect(&mut rx).await;
        assert!(contains(&data, b"on-a-tty"), "{:?}", String::from_utf8_lossy(&data));
        assert_eq!(reason, ExitReason::Exited(0));
        assert!(matches!(
            sup.resize(100, 30),
            Err(LingerError::AlreadyExited(_))
        ));
    }
}
