use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cluster join failed: {0}")]
    JoinFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
