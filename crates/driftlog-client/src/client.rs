use crate::{ClientError, Result};
use bytes::Bytes;
use driftlog_core::Record;
use driftlog_protocol::{read_frame, write_frame, Request, Response};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// A connection to one driftlog server. Requests run in lockstep: each
/// call writes one frame and waits for its response.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "connected");
        Ok(Self { stream })
    }

    /// Announce the subject this connection acts as. Skipping this leaves
    /// the connection anonymous, which a configured server will reject.
    pub async fn hello(&mut self, subject: impl Into<String>) -> Result<()> {
        let request = Request::Hello {
            subject: subject.into(),
        };
        match self.roundtrip(&request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Append one record; returns the offset the server assigned.
    pub async fn produce(&mut self, value: impl Into<Bytes>) -> Result<u64> {
        let request = Request::Produce {
            value: value.into(),
        };
        match self.roundtrip(&request).await? {
            Response::Offset { offset } => Ok(offset),
            other => Err(unexpected(other)),
        }
    }

    /// Read the record at `offset`.
    pub async fn consume(&mut self, offset: u64) -> Result<Record> {
        let request = Request::Consume { offset };
        match self.roundtrip(&request).await? {
            Response::Record { record } => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    /// Append a batch over a produce stream; offsets come back in send
    /// order.
    pub async fn produce_stream(
        &mut self,
        values: impl IntoIterator<Item = Bytes>,
    ) -> Result<Vec<u64>> {
        match self.roundtrip(&Request::ProduceStream).await? {
            Response::Ack => {}
            other => return Err(unexpected(other)),
        }

        let mut offsets = Vec::new();
        for value in values {
            match self.roundtrip(&Request::Produce { value }).await? {
                Response::Offset { offset } => offsets.push(offset),
                other => return Err(unexpected(other)),
            }
        }

        match self.roundtrip(&Request::StreamEnd).await? {
            Response::Ack => Ok(offsets),
            other => Err(unexpected(other)),
        }
    }

    /// Subscribe from `offset` onward. Consumes the client: the stream
    /// owns the connection until it is dropped.
    pub async fn consume_stream(mut self, offset: u64) -> Result<ConsumeStream> {
        write_frame(&mut self.stream, &Request::ConsumeStream { offset }).await?;
        Ok(ConsumeStream {
            stream: self.stream,
        })
    }

    async fn roundtrip(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.stream, request).await?;
        let response: Response = read_frame(&mut self.stream).await?;
        match response {
            Response::OffsetOutOfRange { offset, .. } => {
                Err(ClientError::OffsetOutOfRange { offset })
            }
            Response::PermissionDenied { message } => Err(ClientError::PermissionDenied(message)),
            Response::Error { message } => Err(ClientError::Server(message)),
            other => Ok(other),
        }
    }
}

/// A live record subscription. The server long-polls past the log's tail,
/// so [`ConsumeStream::next`] blocks until the next record exists.
#[derive(Debug)]
pub struct ConsumeStream {
    stream: TcpStream,
}

impl ConsumeStream {
    pub async fn next(&mut self) -> Result<Record> {
        let response: Response = read_frame(&mut self.stream).await?;
        match response {
            Response::Record { record } => Ok(record),
            Response::OffsetOutOfRange { offset, .. } => {
                Err(ClientError::OffsetOutOfRange { offset })
            }
            Response::PermissionDenied { message } => Err(ClientError::PermissionDenied(message)),
            Response::Error { message } => Err(ClientError::Server(message)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::UnexpectedResponse(format!("{response:?}"))
}
