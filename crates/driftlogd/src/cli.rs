//! CLI argument parsing for the driftlog daemon.

use crate::agent::AgentConfig;
use clap::Parser;
use driftlog_core::{Config, SegmentConfig};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Get the system hostname, falling back to "driftlog" when unavailable.
fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "driftlog".to_owned())
}

/// driftlogd - distributed append-only commit log node
///
/// Run the first node with no --join flags; every further node joins the
/// cluster through any existing member's gossip address.
#[derive(Parser, Debug)]
#[command(name = "driftlogd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Unique node name (defaults to the hostname)
    #[arg(long, env = "DRIFTLOG_NODE_NAME", default_value_t = hostname())]
    pub node_name: String,

    /// TCP address the commit-log server binds to
    #[arg(long, env = "DRIFTLOG_RPC_ADDR", default_value = "0.0.0.0:8400")]
    pub rpc_addr: SocketAddr,

    /// UDP address the gossip layer binds to
    #[arg(long, env = "DRIFTLOG_BIND_ADDR", default_value = "0.0.0.0:8401")]
    pub bind_addr: SocketAddr,

    /// Data directory for segment files
    #[arg(long, env = "DRIFTLOG_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Gossip address of an existing member; repeat to list several seeds
    #[arg(long = "join", env = "DRIFTLOG_JOIN_ADDRS", value_delimiter = ',')]
    pub start_join_addrs: Vec<String>,

    /// Per-segment store file cap in bytes
    #[arg(long, env = "DRIFTLOG_MAX_STORE_BYTES", default_value_t = 1024 * 1024)]
    pub max_store_bytes: u64,

    /// Per-segment index file cap in bytes
    #[arg(long, env = "DRIFTLOG_MAX_INDEX_BYTES", default_value_t = 1024 * 1024)]
    pub max_index_bytes: u64,

    /// Shared token authenticating gossip datagrams
    #[arg(long, env = "DRIFTLOG_GOSSIP_AUTH_TOKEN")]
    pub gossip_auth_token: Option<String>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, env = "DRIFTLOG_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if self.node_name.is_empty() {
            return Err("node name must not be empty".into());
        }
        if self.max_index_bytes < 12 {
            return Err("max index bytes must hold at least one 12-byte entry".into());
        }
        Ok(())
    }

    pub fn into_agent_config(self) -> AgentConfig {
        AgentConfig {
            node_name: self.node_name,
            bind_addr: self.bind_addr,
            rpc_addr: self.rpc_addr,
            data_dir: self.data_dir,
            start_join_addrs: self.start_join_addrs,
            log: Config {
                segment: SegmentConfig {
                    max_store_bytes: self.max_store_bytes,
                    max_index_bytes: self.max_index_bytes,
                    initial_offset: 0,
                },
            },
            authorizer: None,
            gossip_auth_token: self.gossip_auth_token,
        }
    }
}
