//! linger-core: shared library for persistent process sessions.
//!
//! Provides the session record, the durable registry store, append-only
//! output logs, the liveness probe, plain-text decoding of terminal output,
//! and the wire types of the remote interface.

pub mod error;
pub mod liveness;
pub mod log;
pub mod messages;
pub mod paths;
pub mod registry;
pub mod session;
pub mod text;

// Re-export commonly used items at crate root.
pub use error::{LingerError, LingerResult};
pub use liveness::{LivenessProbe, SystemProbe};
pub use log::{LogCursor, LogSink};
pub use paths::StatePaths;
pub use registry::{resolve, Registry};
pub use session::{
    generate_session_id, now_ms, Session, SessionEntry, SessionStatus, SpawnMode, DEFAULT_GROUP,
};
