//! # driftlog wire protocol
//!
//! Request/response types shared by the server and client, carried as
//! length-prefixed frames over a byte stream:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────┐
//! │ Length (4 bytes) │ Payload (N bytes)         │
//! │ big-endian u32   │ postcard-serialized value │
//! └──────────────────┴───────────────────────────┘
//! ```
//!
//! Enum variant order is significant for postcard serialization; reordering
//! variants breaks wire compatibility with existing peers.
//!
//! Two requests change the connection's mode instead of yielding a single
//! response: after `ProduceStream` the server answers each subsequent
//! `Produce` frame with an `Offset` frame until `StreamEnd`; after
//! `ConsumeStream` the server owns the connection and streams `Record`
//! frames indefinitely, long-polling past the tail, until the client
//! disconnects.

use bytes::Bytes;
use driftlog_core::Record;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected before the body is read.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Width of the frame length prefix.
pub const LEN_PREFIX_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(usize),

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Announce the subject all later operations are authorized as.
    /// Connections that skip this run as `anonymous`.
    Hello { subject: String },

    /// Append one record; the server assigns and returns its offset.
    Produce {
        #[serde(with = "driftlog_core::serde_utils::bytes_serde")]
        value: Bytes,
    },

    /// Read the record at `offset`.
    Consume { offset: u64 },

    /// Switch the connection into produce-stream mode.
    ProduceStream,

    /// Stream records from `offset` onward, long-polling past the tail.
    ConsumeStream { offset: u64 },

    /// End a produce stream; the server acknowledges and returns to
    /// request/response mode.
    StreamEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ack,

    Offset {
        offset: u64,
    },

    Record {
        record: Record,
    },

    /// The requested offset is not in the log. Carries a localized human
    /// message so streaming clients can distinguish this from a fatal
    /// error and wait.
    OffsetOutOfRange {
        offset: u64,
        locale: String,
        message: String,
    },

    PermissionDenied {
        message: String,
    },

    Error {
        message: String,
    },
}

impl Response {
    pub fn offset_out_of_range(offset: u64) -> Self {
        Response::OffsetOutOfRange {
            offset,
            locale: "en-US".to_string(),
            message: format!("The requested offset is outside the log's range: {offset}"),
        }
    }
}

/// Write one framed message.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = postcard::to_allocvec(msg)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. A clean EOF on the length prefix reports
/// [`ProtocolError::ConnectionClosed`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; LEN_PREFIX_BYTES];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(postcard::from_bytes(&payload)?)
}
