use driftlog_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server reported the offset is not (yet) in the log. Streaming
    /// consumers treat this as "wait", not "fail".
    #[error("offset {offset} out of range")]
    OffsetOutOfRange { offset: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
