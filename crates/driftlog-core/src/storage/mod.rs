//! Segmented commit log storage.
//!
//! # Data directory exclusivity
//!
//! A data directory belongs to exactly one [`Log`] instance. The index
//! files are memory-mapped read-write; external modification of segment
//! files while the log is open can cause undefined behavior including
//! SIGBUS. Stop the process before touching the files.

mod index;
mod log;
mod segment;
mod store;

pub use index::Index;
pub use log::{Log, LogReader};
pub use segment::Segment;
pub use store::Store;

/// Width of the length prefix on every store entry.
pub const LEN_WIDTH: u64 = 8;

/// Index entry layout: 4-byte relative offset, 8-byte store position.
pub const OFF_WIDTH: u64 = 4;
pub const POS_WIDTH: u64 = 8;
pub const ENTRY_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

pub(crate) const STORE_SUFFIX: &str = "store";
pub(crate) const INDEX_SUFFIX: &str = "index";
