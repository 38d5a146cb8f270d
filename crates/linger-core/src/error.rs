use thiserror::Error;

/// Errors produced by the linger session layer.
#[derive(Debug, Error)]
pub enum LingerError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("process already exited: {0}")]
    AlreadyExited(String),

    #[error("resize not supported: {0}")]
    ResizeUnsupported(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for LingerError {
    fn from(e: serde_json::Error) -> Self {
        LingerError::Registry(e.to_string())
    }
}

impl LingerError {
    /// Stable machine-readable code used on the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            LingerError::NotFound(_) => "not_found",
            LingerError::SpawnFailed(_) => "spawn_failed",
            LingerError::AlreadyExited(_) => "already_exited",
            LingerError::ResizeUnsupported(_) => "resize_unsupported",
            LingerError::InvalidRequest(_) => "invalid_request",
            LingerError::Registry(_) => "registry",
            LingerError::Transport(_) => "transport",
            LingerError::Timeout => "timeout",
            LingerError::Io(_) => "io_failure",
            LingerError::Other(_) => "other",
        }
    }
}

pub type LingerResult<T> = Result<T, LingerError>;
