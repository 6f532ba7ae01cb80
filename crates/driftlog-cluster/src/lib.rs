//! # driftlog-cluster
//!
//! Cluster plumbing for driftlog nodes:
//!
//! - **SWIM membership** — UDP gossip with direct and indirect probes,
//!   suspicion timeouts, and incarnation-numbered refutation. Join and
//!   leave notifications drive an injected [`Handler`].
//! - **Pull replication** — a [`Replicator`] implements the handler: for
//!   every discovered peer it opens a consume stream at offset zero and
//!   re-produces each record into the local server. Replication is
//!   best-effort convergence of record sets, not consensus.

pub mod config;
pub mod error;
pub mod membership;
pub mod node;
pub mod replicator;

pub use config::{GossipConfig, RPC_ADDR_TAG};
pub use error::{ClusterError, Result};
pub use membership::{Handler, Membership, MembershipEvent};
pub use node::{Member, MemberState, MemberStatus};
pub use replicator::{Replicator, REPLICATOR_SUBJECT};
