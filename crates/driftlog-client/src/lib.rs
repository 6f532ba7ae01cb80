//! # driftlog-client
//!
//! Async client for the driftlog commit log service.
//!
//! ```rust,ignore
//! use driftlog_client::Client;
//!
//! let mut client = Client::connect("127.0.0.1:8400").await?;
//! client.hello("root").await?;
//!
//! let offset = client.produce("hello world").await?;
//! let record = client.consume(offset).await?;
//!
//! // Subscribe from the beginning; next() long-polls past the tail.
//! let mut stream = client.consume_stream(0).await?;
//! loop {
//!     let record = stream.next().await?;
//!     println!("{}: {:?}", record.offset, record.value);
//! }
//! ```

mod client;
mod error;

pub use client::{Client, ConsumeStream};
pub use error::{ClientError, Result};
