//! # driftlogd
//!
//! The driftlog node daemon: one process that owns a data directory,
//! serves its commit log over TCP, gossips membership over UDP, and
//! replicates every discovered peer's records into its own log.

pub mod agent;
pub mod cli;

pub use agent::{Agent, AgentConfig};
pub use cli::Cli;
