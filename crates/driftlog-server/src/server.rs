use driftlog_core::{auth, Authorizer, Error, Log, Record};
use driftlog_protocol::{read_frame, write_frame, ProtocolError, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info, warn};

/// Subject used for connections that never send a `Hello`.
const ANONYMOUS_SUBJECT: &str = "anonymous";

/// The seam between the server and its storage. The log implements it
/// directly; tests can substitute their own.
pub trait CommitLog: Send + Sync + 'static {
    fn append(&self, record: &mut Record) -> driftlog_core::Result<u64>;
    fn read(&self, offset: u64) -> driftlog_core::Result<Record>;
}

impl CommitLog for Log {
    fn append(&self, record: &mut Record) -> driftlog_core::Result<u64> {
        Log::append(self, record)
    }

    fn read(&self, offset: u64) -> driftlog_core::Result<Record> {
        Log::read(self, offset)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// ACL table consulted before every operation. `None` disables
    /// authorization entirely.
    pub authorizer: Option<Arc<Authorizer>>,

    /// How long a consume stream sleeps before re-trying a read past the
    /// tail.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            authorizer: None,
            poll_interval: Duration::from_millis(10),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    commit_log: Arc<dyn CommitLog>,
    listener: TcpListener,
}

impl Server {
    /// Bind the listener. Serving starts with [`Server::serve`].
    pub async fn bind(
        addr: impl ToSocketAddrs,
        commit_log: Arc<dyn CommitLog>,
        config: ServerConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            config,
            commit_log,
            listener,
        })
    }

    /// The bound address; with port 0 this is how tests learn the port.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, "serving commit log");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let commit_log = Arc::clone(&self.commit_log);
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, commit_log, config).await {
                            debug!(%peer, error = %e, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    commit_log: Arc<dyn CommitLog>,
    config: ServerConfig,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut subject = ANONYMOUS_SUBJECT.to_string();

    loop {
        let request = match read_frame::<_, Request>(&mut reader).await {
            Ok(request) => request,
            Err(ProtocolError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match request {
            Request::Hello { subject: s } => {
                subject = s;
                write_frame(&mut writer, &Response::Ack).await?;
            }

            Request::Produce { value } => {
                let response = match authorize(&config, &subject, auth::PRODUCE_ACTION) {
                    Err(denied) => denied,
                    Ok(()) => produce(commit_log.as_ref(), value),
                };
                write_frame(&mut writer, &response).await?;
            }

            Request::Consume { offset } => {
                let response = match authorize(&config, &subject, auth::CONSUME_ACTION) {
                    Err(denied) => denied,
                    Ok(()) => consume(commit_log.as_ref(), offset),
                };
                write_frame(&mut writer, &response).await?;
            }

            Request::ProduceStream => {
                if let Err(denied) = authorize(&config, &subject, auth::PRODUCE_ACTION) {
                    write_frame(&mut writer, &denied).await?;
                    continue;
                }
                write_frame(&mut writer, &Response::Ack).await?;
                if produce_stream(&mut reader, &mut writer, commit_log.as_ref()).await? {
                    // Client hung up mid-stream.
                    return Ok(());
                }
            }

            Request::ConsumeStream { offset } => {
                if let Err(denied) = authorize(&config, &subject, auth::CONSUME_ACTION) {
                    write_frame(&mut writer, &denied).await?;
                    continue;
                }
                consume_stream(
                    &mut reader,
                    &mut writer,
                    commit_log.as_ref(),
                    offset,
                    config.poll_interval,
                )
                .await?;
                // A consume stream owns the connection until the client
                // disconnects; nothing sensible can follow it.
                return Ok(());
            }

            Request::StreamEnd => {
                // Only meaningful inside a produce stream.
                write_frame(
                    &mut writer,
                    &Response::Error {
                        message: "stream end outside a produce stream".to_string(),
                    },
                )
                .await?;
            }
        }
    }
}

fn authorize(
    config: &ServerConfig,
    subject: &str,
    action: &str,
) -> std::result::Result<(), Response> {
    let Some(authorizer) = &config.authorizer else {
        return Ok(());
    };
    match authorizer.authorize(subject, auth::OBJECT_WILDCARD, action) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(subject, action, "authorization denied");
            Err(Response::PermissionDenied {
                message: e.to_string(),
            })
        }
    }
}

fn produce(commit_log: &dyn CommitLog, value: bytes::Bytes) -> Response {
    let mut record = Record::new(value);
    match commit_log.append(&mut record) {
        Ok(offset) => Response::Offset { offset },
        Err(e) => {
            error!(error = %e, "append failed");
            Response::Error {
                message: e.to_string(),
            }
        }
    }
}

fn consume(commit_log: &dyn CommitLog, offset: u64) -> Response {
    match commit_log.read(offset) {
        Ok(record) => Response::Record { record },
        Err(Error::OffsetOutOfRange { offset }) => Response::offset_out_of_range(offset),
        Err(e) => {
            error!(error = %e, offset, "read failed");
            Response::Error {
                message: e.to_string(),
            }
        }
    }
}

/// Answer each `Produce` frame with the assigned offset, in order, until
/// `StreamEnd` or disconnect. Returns true when the client disconnected.
async fn produce_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    commit_log: &dyn CommitLog,
) -> anyhow::Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request = match read_frame::<_, Request>(reader).await {
            Ok(request) => request,
            Err(ProtocolError::ConnectionClosed) => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        match request {
            Request::Produce { value } => {
                write_frame(writer, &produce(commit_log, value)).await?;
            }
            Request::StreamEnd => {
                write_frame(writer, &Response::Ack).await?;
                return Ok(false);
            }
            other => {
                write_frame(
                    writer,
                    &Response::Error {
                        message: format!("unexpected request in produce stream: {other:?}"),
                    },
                )
                .await?;
                return Ok(false);
            }
        }
    }
}

/// Stream records from `offset` forward. Reads past the tail wait out a
/// short poll interval and retry, so the stream observes future appends.
/// The loop ends when the client closes its half of the connection, a send
/// fails, or the log reports a non-range error.
async fn consume_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    commit_log: &dyn CommitLog,
    start_offset: u64,
    poll_interval: Duration,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut offset = start_offset;
    let mut eof_buf = [0u8; 1];

    loop {
        match commit_log.read(offset) {
            Ok(record) => {
                write_frame(writer, &Response::Record { record }).await?;
                offset += 1;
            }
            Err(Error::OffsetOutOfRange { .. }) => {
                // Long-poll: wait for an append, watching the read half so
                // a client hang-up ends the stream cleanly.
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    read = reader.read(&mut eof_buf) => {
                        match read {
                            Ok(0) | Err(_) => return Ok(()),
                            Ok(_) => {
                                debug!("unexpected data during consume stream");
                                return Ok(());
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, offset, "consume stream read failed");
                write_frame(
                    writer,
                    &Response::Error {
                        message: e.to_string(),
                    },
                )
                .await?;
                return Ok(());
            }
        }
    }
}
