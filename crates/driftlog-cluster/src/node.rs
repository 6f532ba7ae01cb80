//! Member records and the states the failure detector moves them through.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Locally observed state of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Responding to probes.
    #[default]
    Alive,
    /// Missed probes; not yet confirmed dead.
    Suspect,
    /// Confirmed dead by suspicion timeout or gossip.
    Dead,
    /// Announced a graceful departure.
    Leaving,
}

impl MemberStatus {
    /// Whether this member is worth sending datagrams to.
    pub fn is_reachable(&self) -> bool {
        matches!(self, MemberStatus::Alive | MemberStatus::Suspect)
    }
}

/// The gossiped description of a member: everything a peer needs to know
/// to track it and (via tags) to dial its RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    pub name: String,
    pub gossip_addr: SocketAddr,
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
    pub incarnation: u64,
}

/// A member plus local bookkeeping the failure detector needs.
#[derive(Debug, Clone)]
pub struct Member {
    pub state: MemberState,
    pub last_seen: Instant,
}

impl Member {
    pub fn new(state: MemberState) -> Self {
        Self {
            state,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn mark_alive(&mut self, incarnation: u64) {
        self.state.status = MemberStatus::Alive;
        self.state.incarnation = incarnation;
        self.touch();
    }

    pub fn mark_suspect(&mut self) {
        if self.state.status == MemberStatus::Alive {
            self.state.status = MemberStatus::Suspect;
        }
    }

    pub fn mark_dead(&mut self) {
        self.state.status = MemberStatus::Dead;
    }

    pub fn mark_leaving(&mut self) {
        self.state.status = MemberStatus::Leaving;
    }

    pub fn is_reachable(&self) -> bool {
        self.state.status.is_reachable()
    }
}
