//! linger-server: hosts persistent process sessions and serves them over
//! HTTP + SSE.

pub mod api;
pub mod config;
pub mod session;

pub use api::router;
pub use config::{Overrides, ServerConfig};
pub use session::{SessionConfig, SessionManager};
