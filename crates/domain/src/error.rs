/// Whether a failure may succeed if the caller retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A deployment or programming invariant was violated.  Never retried;
    /// the surrounding pipeline fails the flow.
    Fatal,
    /// Infrastructure flakiness.  Retry policy belongs to the caller.
    Transient,
}

/// Shared error type used across all FlowMesh crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("session {0} does not exist in the checkpoint")]
    SessionMissing(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("flow stack: {0}")]
    FlowStack(String),

    #[error("session {session_id}: illegal status transition {from} -> {to}")]
    IllegalTransition {
        session_id: String,
        from: String,
        to: String,
    },

    #[error("sandbox unavailable: {0}")]
    Sandbox(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Sandbox(_) => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, Error>;
