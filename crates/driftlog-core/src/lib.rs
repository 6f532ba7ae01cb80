//! # driftlog-core
//!
//! The storage engine behind driftlog: an append-only commit log built from
//! size-bounded segments. Each segment pairs a length-prefixed store file
//! with a memory-mapped index that maps relative offsets to store positions.
//!
//! ```rust,ignore
//! use driftlog_core::{Config, Log, Record};
//!
//! let log = Log::new("/var/lib/driftlog", Config::default())?;
//! let mut record = Record::new("hello world");
//! let offset = log.append(&mut record)?;
//! let read = log.read(offset)?;
//! assert_eq!(read.value, record.value);
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod record;
pub mod serde_utils;
pub mod storage;

pub use auth::{Authorizer, CONSUME_ACTION, OBJECT_WILDCARD, PRODUCE_ACTION};
pub use config::{Config, SegmentConfig};
pub use error::{Error, Result};
pub use record::Record;
pub use storage::{Index, Log, LogReader, Segment, Store};
