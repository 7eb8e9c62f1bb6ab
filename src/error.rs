use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TerminalError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Resize failed: {0}")]
    ResizeFailed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid session kind: {0}")]
    InvalidKind(String),
}

impl TerminalError {
    /// Failures the UI should show as a warning while the session keeps running.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WriteFailed(_) | Self::ResizeFailed(_))
    }
}

impl Serialize for TerminalError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TerminalError>;
