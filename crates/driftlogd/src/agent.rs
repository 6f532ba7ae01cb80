//! Node composition: log, server, replicator, and membership wired into
//! one unit with ordered startup and teardown.

use driftlog_cluster::{GossipConfig, Membership, Replicator, RPC_ADDR_TAG};
use driftlog_core::{Authorizer, Config, Log};
use driftlog_server::{Server, ServerConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Unique node name across the cluster.
    pub node_name: String,

    /// UDP bind address for gossip.
    pub bind_addr: SocketAddr,

    /// TCP bind address for the commit-log RPC server.
    pub rpc_addr: SocketAddr,

    /// Directory this node's segments live in.
    pub data_dir: PathBuf,

    /// Gossip addresses of existing cluster members; empty on the first
    /// node.
    pub start_join_addrs: Vec<String>,

    /// Segment caps and initial offset.
    pub log: Config,

    /// ACL table for the RPC server; `None` disables authorization.
    pub authorizer: Option<Arc<Authorizer>>,

    /// Shared token authenticating gossip datagrams.
    pub gossip_auth_token: Option<String>,
}

/// A running driftlog node.
pub struct Agent {
    log: Arc<Log>,
    server_task: JoinHandle<()>,
    rpc_addr: SocketAddr,
    membership: Membership,
    replicator: Arc<Replicator>,
}

impl Agent {
    /// Bring the node up: open the log, serve it, then start replication
    /// and membership so peers can be discovered and pulled from.
    pub async fn new(config: AgentConfig) -> anyhow::Result<Agent> {
        let log = Arc::new(Log::new(&config.data_dir, config.log.clone())?);

        let server = Server::bind(
            config.rpc_addr,
            log.clone(),
            ServerConfig {
                authorizer: config.authorizer.clone(),
                ..ServerConfig::default()
            },
        )
        .await?;
        let rpc_addr = server.local_addr()?;
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                warn!(error = %e, "server stopped");
            }
        });

        let replicator = Arc::new(Replicator::new(rpc_addr));

        let membership = Membership::start(
            GossipConfig {
                node_name: config.node_name.clone(),
                bind_addr: config.bind_addr,
                tags: HashMap::from([(RPC_ADDR_TAG.to_string(), rpc_addr.to_string())]),
                start_join_addrs: config.start_join_addrs.clone(),
                auth_token: config.gossip_auth_token.clone(),
                ..GossipConfig::default()
            },
            replicator.clone(),
        )
        .await?;

        info!(
            node = %config.node_name,
            %rpc_addr,
            gossip_addr = %membership.local_addr(),
            "agent started"
        );

        Ok(Agent {
            log,
            server_task,
            rpc_addr,
            membership,
            replicator,
        })
    }

    /// Address clients and peers produce to and consume from.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Address other nodes join the cluster through.
    pub fn gossip_addr(&self) -> SocketAddr {
        self.membership.local_addr()
    }

    /// Direct handle to the local log, for embedding and tests.
    pub fn log(&self) -> Arc<Log> {
        self.log.clone()
    }

    /// Leave the cluster, stop replication, stop serving, close the log.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.membership.shutdown().await?;
        self.replicator.close();
        self.server_task.abort();
        self.log.close()?;
        info!("agent stopped");
        Ok(())
    }
}
