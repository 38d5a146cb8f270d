//! linger-client: Rust client library for a linger server.
//!
//! # Quick Start
//!
//! ```no_run
//! use linger_client::LingerClient;
//! use linger_core::messages::{CreatePtyRequest, StreamEvent, StreamQuery};
//!
//! # async fn example() -> linger_core::LingerResult<()> {
//! let client = LingerClient::new("http://127.0.0.1:7681");
//! let created = client
//!     .create("default", &CreatePtyRequest {
//!         cmd: vec!["bash".into()],
//!         name: Some("work".into()),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! let mut events = client.stream("default", &created.pty_id, &StreamQuery::default()).await?;
//! client.input("default", &created.pty_id, "echo hello\n").await?;
//! while let Some(event) = events.next().await? {
//!     if let StreamEvent::Exit(code) = event {
//!         println!("exited with {code}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod sse;

pub use client::{EventStream, LingerClient, DEFAULT_URL};
pub use sse::SseDecoder;

// Re-export linger-core error types for convenience.
pub use linger_core::{LingerError, LingerResult};
