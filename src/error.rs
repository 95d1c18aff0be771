use reqwest::StatusCode;

/// Failures of a streamed completion turn.
#[derive(Debug, thiserror::Error)]
pub enum ChatStreamError {
    /// The request could not be sent or the connection dropped.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("API error {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The response body broke mid-stream.
    #[error("stream error: {0}")]
    Stream(String),
}

impl ChatStreamError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ChatStreamError::Status { status, .. } => Some(*status),
            ChatStreamError::Transport(e) => e.status(),
            ChatStreamError::Stream(_) => None,
        }
    }
}
