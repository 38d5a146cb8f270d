//! Session hosting: process supervision, terminal state, output fan-out,
//! attach/detach.

pub mod attach;
pub mod broadcast;
pub mod manager;
pub mod pty;
pub mod terminal;

pub use attach::{AttachOptions, Attachment, InputHandle, LiveAttachment, Replay};
pub use broadcast::{Broadcaster, Observer, OutputEvent};
pub use manager::{CreateOptions, HostedSession, SessionConfig, SessionManager};
pub use pty::{ExitReason, ProcessEvent, ResizeOutcome, SpawnOptions, Supervisor};
pub use terminal::{LinesSince, Snapshot, TerminalBuffer};
