//! `linger attach NAME`: replay a session's output, then follow it live.
//!
//! On a terminal the attachment is interactive: raw mode, keystrokes and
//! resizes forwarded, Ctrl+] to detach. With `--read-only` (or when stdio is
//! not a terminal) output is only followed and Ctrl+C detaches. Detaching
//! never affects the session.
//!
//! Attaching to a session that is no longer running replays its history and
//! exits with [`NOT_LIVE_STATUS`].

use anyhow::{Context as _, Result};
use crossterm::event::{self, Event, KeyEventKind};
use linger_core::messages::{StreamEvent, StreamQuery};
use linger_core::{LivenessProbe, LogCursor, Session, SystemProbe};
use linger_client::EventStream;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Context;
use crate::terminal::{self as term, RawModeGuard};

const KEY_POLL: Duration = Duration::from_millis(100);
const FOLLOW_INTERVAL: Duration = Duration::from_millis(250);

/// Exit status of `linger attach` when the session was not running.
pub const NOT_LIVE_STATUS: i32 = 3;

pub struct AttachArgs<'a> {
    pub name: &'a str,
    pub lines: Option<usize>,
    pub search: Option<String>,
    pub read_only: bool,
}

/// How an attachment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Exited(i32),
    Detached,
    /// Stream closed without an exit: the process runs outside this server.
    Unhosted,
    /// A followed process is no longer alive.
    Gone,
}

/// Returns whether the session was running when attached.
pub async fn run(ctx: &Context, args: AttachArgs<'_>) -> Result<bool> {
    ctx.ensure_server().await?;
    let entry = ctx.resolve(args.name).await?;
    let id = entry.session.id.clone();
    let interactive = entry.alive && !args.read_only && term::is_interactive();
    info!(session_id = %id, alive = entry.alive, interactive, "attaching");

    if interactive {
        let (cols, rows) = term::get_terminal_size();
        if let Err(e) = ctx.client.resize(&ctx.group, &id, cols, rows).await {
            debug!(error = %e, "initial resize failed");
        }
    }

    let query = StreamQuery {
        lines: args.lines,
        search: args.search,
    };
    let mut stream = ctx
        .client
        .stream(&ctx.group, &id, &query)
        .await
        .with_context(|| format!("failed to attach to '{}'", args.name))?;

    let mut outcome = if interactive {
        interactive_loop(ctx, &id, &mut stream).await?
    } else {
        read_only_loop(&mut stream).await?
    };

    if outcome == Outcome::Unhosted && entry.alive {
        eprintln!("\r\n[{} is not hosted by this server; following its log]", args.name);
        outcome = follow_log(&entry.session).await?;
    }

    eprintln!("\r\n{}", outcome_message(args.name, outcome));
    Ok(entry.alive)
}

/// Process exit status for an attachment.
pub fn exit_status(was_live: bool) -> i32 {
    if was_live {
        0
    } else {
        NOT_LIVE_STATUS
    }
}

fn outcome_message(name: &str, outcome: Outcome) -> String {
    match outcome {
        Outcome::Exited(code) => format!("[{name} exited with code {code}]"),
        Outcome::Detached => format!("[detached from {name}]"),
        Outcome::Unhosted | Outcome::Gone => format!("[{name} is no longer running]"),
    }
}

fn write_out(out: &mut impl Write, data: &[u8]) -> Result<()> {
    out.write_all(data)?;
    out.flush()?;
    Ok(())
}

/// Apply one stream event; returns the outcome once the stream is over.
fn handle_event(out: &mut impl Write, event: Option<StreamEvent>) -> Result<Option<Outcome>> {
    match event {
        Some(StreamEvent::Snapshot(bytes)) | Some(StreamEvent::Data(bytes)) => {
            write_out(out, &bytes)?;
            Ok(None)
        }
        Some(StreamEvent::Exit(code)) => Ok(Some(Outcome::Exited(code))),
        None => Ok(Some(Outcome::Unhosted)),
    }
}

async fn read_only_loop(stream: &mut EventStream) -> Result<Outcome> {
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = stream.next() => {
                if let Some(outcome) = handle_event(&mut stdout, event?)? {
                    return Ok(outcome);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(Outcome::Detached),
        }
    }
}

async fn interactive_loop(ctx: &Context, id: &str, stream: &mut EventStream) -> Result<Outcome> {
    let _guard = RawModeGuard::enter().context("failed to enter raw terminal mode")?;

    let (tx_input, mut rx_input) = mpsc::channel::<Vec<u8>>(64);
    let (tx_resize, mut rx_resize) = mpsc::channel::<(u16, u16)>(8);
    let (tx_detach, mut rx_detach) = mpsc::channel::<()>(1);
    let reader = tokio::task::spawn_blocking(move || read_keys(tx_input, tx_resize, tx_detach));

    let mut stdout = std::io::stdout();
    let outcome = loop {
        tokio::select! {
            event = stream.next() => {
                if let Some(outcome) = handle_event(&mut stdout, event?)? {
                    break outcome;
                }
            }
            Some(bytes) = rx_input.recv() => {
                let text = String::from_utf8_lossy(&bytes);
                if !ctx.client.input(&ctx.group, id, &text).await? {
                    debug!(session_id = %id, "input not delivered, process exited");
                }
            }
            Some((cols, rows)) = rx_resize.recv() => {
                debug!(cols, rows, "terminal resized");
                if let Err(e) = ctx.client.resize(&ctx.group, id, cols, rows).await {
                    warn!(error = %e, "resize failed");
                }
            }
            _ = rx_detach.recv() => break Outcome::Detached,
        }
    };

    // Closing the input channel stops the key reader.
    drop(rx_input);
    if let Err(e) = reader.await {
        debug!(error = %e, "key reader ended abnormally");
    }
    Ok(outcome)
}

/// Blocking crossterm reader. Polls so it notices when the attach loop is done.
fn read_keys(
    tx_input: mpsc::Sender<Vec<u8>>,
    tx_resize: mpsc::Sender<(u16, u16)>,
    tx_detach: mpsc::Sender<()>,
) {
    while !tx_input.is_closed() {
        match event::poll(KEY_POLL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!("crossterm poll error: {e}");
                break;
            }
        }
        match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                if term::is_detach_key(&key) {
                    let _ = tx_detach.blocking_send(());
                    break;
                }
                if let Some(bytes) = term::key_event_to_bytes(&key) {
                    if tx_input.blocking_send(bytes).is_err() {
                        break;
                    }
                }
            }
            Ok(Event::Paste(text)) => {
                if tx_input.blocking_send(text.into_bytes()).is_err() {
                    break;
                }
            }
            Ok(Event::Resize(cols, rows)) => {
                let _ = tx_resize.blocking_send((cols, rows));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("crossterm event error: {e}");
                break;
            }
        }
    }
}

/// Follow a log by byte offset until the process dies or Ctrl+C.
async fn follow_log(session: &Session) -> Result<Outcome> {
    follow_log_with(session, &SystemProbe, &mut std::io::stdout()).await
}

async fn follow_log_with(
    session: &Session,
    probe: &dyn LivenessProbe,
    out: &mut impl Write,
) -> Result<Outcome> {
    let mut cursor = LogCursor::at_end(&session.log_file_path).await?;
    loop {
        // Probe before reading so the final output is not missed.
        let alive = probe.is_alive(session.pid, &session.command);
        let data = cursor.read_new().await?;
        if !data.is_empty() {
            write_out(out, &data)?;
        }
        if !alive {
            return Ok(Outcome::Gone);
        }
        tokio::select! {
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => return Ok(Outcome::Detached),
        }
    }
}
