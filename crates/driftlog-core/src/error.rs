use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A read asked for an offset the log does not hold.
    #[error("offset {offset} out of range")]
    OffsetOutOfRange { offset: u64 },

    /// An index read went past the last valid entry.
    #[error("read past the end of the index")]
    EndOfIndex,

    /// An index write would exceed the mapped capacity.
    #[error("index is full")]
    IndexFull,

    #[error("{subject} not permitted to {action} on {object}")]
    PermissionDenied {
        subject: String,
        action: String,
        object: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the out-of-range kind, which consume streams absorb by
    /// waiting instead of failing.
    pub fn is_offset_out_of_range(&self) -> bool {
        matches!(self, Error::OffsetOutOfRange { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
