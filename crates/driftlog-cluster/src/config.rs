use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Tag under which a member advertises its commit-log RPC address.
/// Join notifications hand this value to the [`crate::Handler`].
pub const RPC_ADDR_TAG: &str = "rpc_addr";

/// Gossip layer configuration.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Unique name of this node across the cluster.
    pub node_name: String,

    /// UDP address the gossip socket binds to. Port 0 picks a free port.
    pub bind_addr: SocketAddr,

    /// Metadata gossiped with this node; must include [`RPC_ADDR_TAG`]
    /// for peers to replicate from it.
    pub tags: HashMap<String, String>,

    /// Bootstrap peers contacted on startup. Empty for the first node.
    pub start_join_addrs: Vec<String>,

    /// Interval between probe rounds.
    pub probe_interval: Duration,

    /// How long to wait for a direct ack before probing indirectly.
    pub probe_timeout: Duration,

    /// Number of peers asked to probe on our behalf after a direct miss.
    pub indirect_probes: usize,

    /// A suspect is declared dead after
    /// `suspicion_multiplier * probe_interval` without an ack.
    pub suspicion_multiplier: u32,

    /// Interval between full state syncs with a random peer.
    pub sync_interval: Duration,

    /// Shared token for HMAC-tagged gossip datagrams. `None` disables
    /// message authentication.
    pub auth_token: Option<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            bind_addr: "0.0.0.0:8401".parse().expect("valid default bind addr"),
            tags: HashMap::new(),
            start_join_addrs: Vec::new(),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_probes: 3,
            suspicion_multiplier: 4,
            sync_interval: Duration::from_secs(30),
            auth_token: None,
        }
    }
}

impl GossipConfig {
    /// Suspicion window after which a suspect is declared dead.
    pub fn suspicion_timeout(&self) -> Duration {
        self.probe_interval * self.suspicion_multiplier
    }
}
