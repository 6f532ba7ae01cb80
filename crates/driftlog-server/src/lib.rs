//! # driftlog-server
//!
//! Serves a commit log over TCP with four operations: produce, consume,
//! produce-stream, and consume-stream. Consume streams long-poll past the
//! log's tail so subscribers see future appends without reconnecting.

mod server;

pub use server::{CommitLog, Server, ServerConfig};
