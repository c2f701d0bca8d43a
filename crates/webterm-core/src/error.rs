use thiserror::Error;

/// Errors produced by the webterm runtime and protocol layer.
#[derive(Debug, Error)]
pub enum WebtermError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("process is not running: {0}")]
    ProcessExited(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("limit reached: {0}")]
    LimitReached(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for WebtermError {
    fn from(e: serde_json::Error) -> Self {
        WebtermError::Codec(e.to_string())
    }
}

impl WebtermError {
    /// Whether this error came from writing to a process that is gone.
    pub fn is_write_failure(&self) -> bool {
        matches!(self, WebtermError::Io(_) | WebtermError::ProcessExited(_))
    }
}

pub type WebtermResult<T> = Result<T, WebtermError>;
