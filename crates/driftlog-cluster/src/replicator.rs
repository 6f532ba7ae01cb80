//! Pull-based replication.
//!
//! The replicator makes this node's log a superset of every reachable
//! peer's log. It implements the membership [`Handler`]: a join spawns one
//! worker that streams the peer's records from offset zero and re-produces
//! each one into the local server, where it is appended under a fresh
//! local offset.
//!
//! Every reconnect restarts at offset zero, so records a peer already
//! shipped are produced again. Consumers of a replicated cluster must be
//! idempotent on payload content.

use crate::membership::Handler;
use crate::Result;
use driftlog_client::Client;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Subject replication workers authenticate as. Grant it produce access
/// when the local server runs with an authorizer.
pub const REPLICATOR_SUBJECT: &str = "replicator";

/// Buffered records between a stream's receive loop and the produce loop.
const RECORD_CHANNEL_CAPACITY: usize = 64;

/// One replication worker per known peer, keyed by peer name. Dropping a
/// peer's signal sender is what stops its worker.
pub struct Replicator {
    local_addr: SocketAddr,
    state: Mutex<State>,
    shutdown_tx: watch::Sender<()>,
}

struct State {
    peers: HashMap<String, watch::Sender<()>>,
    closed: bool,
}

impl Replicator {
    /// `local_addr` is the RPC address of this node's own server; every
    /// pulled record is produced into it.
    pub fn new(local_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = watch::channel(());
        Self {
            local_addr,
            state: Mutex::new(State {
                peers: HashMap::new(),
                closed: false,
            }),
            shutdown_tx,
        }
    }

    /// Stop every worker and refuse future joins. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.peers.clear();
        let _ = self.shutdown_tx.send(());
        info!("replicator closed");
    }
}

impl Handler for Replicator {
    fn join(&self, name: &str, rpc_addr: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.peers.contains_key(name) {
            return Ok(());
        }

        let (leave_tx, leave_rx) = watch::channel(());
        state.peers.insert(name.to_string(), leave_tx);

        info!(peer = name, addr = rpc_addr, "starting replication worker");
        tokio::spawn(replicate(
            name.to_string(),
            rpc_addr.to_string(),
            self.local_addr,
            leave_rx,
            self.shutdown_tx.subscribe(),
        ));
        Ok(())
    }

    fn leave(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        // Dropping the sender closes the worker's leave signal.
        if state.peers.remove(name).is_some() {
            info!(peer = name, "stopping replication worker");
        }
        Ok(())
    }
}

/// Worker for one peer: dial, open a consume stream at offset zero, and
/// produce every received record locally. Exits on the global shutdown,
/// the per-peer leave signal, or any receive/produce error.
async fn replicate(
    peer: String,
    addr: String,
    local_addr: SocketAddr,
    mut leave_rx: watch::Receiver<()>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut client = match Client::connect(addr.as_str()).await {
        Ok(client) => client,
        Err(e) => {
            error!(peer = %peer, addr = %addr, error = %e, "failed to dial peer");
            return;
        }
    };
    if let Err(e) = client.hello(REPLICATOR_SUBJECT).await {
        error!(peer = %peer, error = %e, "peer rejected hello");
        return;
    }
    let mut stream = match client.consume_stream(0).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(peer = %peer, error = %e, "failed to open consume stream");
            return;
        }
    };

    let mut local = match Client::connect(local_addr).await {
        Ok(local) => local,
        Err(e) => {
            error!(error = %e, "failed to dial local server");
            return;
        }
    };
    if let Err(e) = local.hello(REPLICATOR_SUBJECT).await {
        error!(error = %e, "local server rejected hello");
        return;
    }

    // Receive loop: decode records off the stream and hand them over.
    let (record_tx, mut record_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
    let recv_peer = peer.clone();
    let recv_task = tokio::spawn(async move {
        loop {
            match stream.next().await {
                Ok(record) => {
                    if record_tx.send(record).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(peer = %recv_peer, error = %e, "consume stream ended");
                    return;
                }
            }
        }
    });

    // Dispatch loop: re-append everything locally until told to stop.
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = leave_rx.changed() => break,
            record = record_rx.recv() => {
                let Some(record) = record else { break };
                if let Err(e) = local.produce(record.value).await {
                    error!(peer = %peer, error = %e, "failed to produce replicated record");
                    break;
                }
            }
        }
    }

    recv_task.abort();
    debug!(peer = %peer, "replication worker exited");
}
