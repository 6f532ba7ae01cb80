//! Multi-node membership tests over loopback UDP.

use driftlog_cluster::{GossipConfig, Handler, Membership, Result, RPC_ADDR_TAG};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct RecordingHandler {
    joins: Mutex<Vec<(String, String)>>,
    leaves: Mutex<Vec<String>>,
}

impl Handler for RecordingHandler {
    fn join(&self, name: &str, rpc_addr: &str) -> Result<()> {
        self.joins
            .lock()
            .push((name.to_string(), rpc_addr.to_string()));
        Ok(())
    }

    fn leave(&self, name: &str) -> Result<()> {
        self.leaves.lock().push(name.to_string());
        Ok(())
    }
}

fn fast_config(name: &str, seeds: Vec<String>) -> GossipConfig {
    GossipConfig {
        node_name: name.to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        tags: HashMap::from([(RPC_ADDR_TAG.to_string(), format!("127.0.0.1:0#{name}"))]),
        start_join_addrs: seeds,
        probe_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(50),
        indirect_probes: 2,
        suspicion_multiplier: 3,
        sync_interval: Duration::from_millis(500),
        auth_token: None,
    }
}

async fn eventually(what: &str, deadline: Duration, condition: impl Fn() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn three_nodes_discover_each_other() {
    let h0 = Arc::new(RecordingHandler::default());
    let m0 = Membership::start(fast_config("node-0", vec![]), h0.clone())
        .await
        .unwrap();
    let seeds = vec![m0.local_addr().to_string()];

    let h1 = Arc::new(RecordingHandler::default());
    let m1 = Membership::start(fast_config("node-1", seeds.clone()), h1.clone())
        .await
        .unwrap();
    let h2 = Arc::new(RecordingHandler::default());
    let m2 = Membership::start(fast_config("node-2", seeds.clone()), h2.clone())
        .await
        .unwrap();

    eventually("all nodes to see three members", Duration::from_secs(5), || {
        m0.members().len() == 3 && m1.members().len() == 3 && m2.members().len() == 3
    })
    .await;

    eventually("node-0 handler to see two joins", Duration::from_secs(5), || {
        h0.joins.lock().len() == 2
    })
    .await;

    // Join notifications carry the advertised rpc_addr tag, never self.
    let joins = h0.joins.lock().clone();
    assert!(joins.iter().all(|(name, _)| name != "node-0"));
    assert!(joins
        .iter()
        .any(|(name, addr)| name == "node-1" && addr.ends_with("#node-1")));

    m2.shutdown().await.unwrap();

    eventually("node-0 to observe node-2 leaving", Duration::from_secs(5), || {
        h0.leaves.lock().iter().any(|name| name == "node-2")
    })
    .await;

    m1.shutdown().await.unwrap();
    m0.shutdown().await.unwrap();
}

#[tokio::test]
async fn silent_death_is_detected() {
    let h0 = Arc::new(RecordingHandler::default());
    let m0 = Membership::start(fast_config("probe-0", vec![]), h0.clone())
        .await
        .unwrap();
    let seeds = vec![m0.local_addr().to_string()];

    let h1 = Arc::new(RecordingHandler::default());
    let m1 = Membership::start(fast_config("probe-1", seeds), h1.clone())
        .await
        .unwrap();

    eventually("nodes to meet", Duration::from_secs(5), || {
        m0.members().len() == 2 && m1.members().len() == 2
    })
    .await;

    // Kill the peer without a leave announcement; the failure detector
    // must suspect it and then declare it dead.
    m1.abort();

    eventually(
        "the failure detector to report probe-1",
        Duration::from_secs(10),
        || h0.leaves.lock().iter().any(|name| name == "probe-1"),
    )
    .await;

    m0.shutdown().await.unwrap();
}

#[tokio::test]
async fn bad_seed_address_fails_startup() {
    let handler = Arc::new(RecordingHandler::default());
    let result = Membership::start(
        fast_config("lonely", vec!["not-an-address".to_string()]),
        handler,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn authenticated_gossip_rejects_unauthenticated_peers() {
    let h0 = Arc::new(RecordingHandler::default());
    let mut config0 = fast_config("auth-0", vec![]);
    config0.auth_token = Some("secret".to_string());
    let m0 = Membership::start(config0, h0.clone()).await.unwrap();

    // A peer without the token: its join datagrams are dropped.
    let h1 = Arc::new(RecordingHandler::default());
    let m1 = Membership::start(
        fast_config("auth-1", vec![m0.local_addr().to_string()]),
        h1.clone(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(m0.members().len(), 1, "unauthenticated join must be dropped");

    m1.abort();
    m0.shutdown().await.unwrap();
}
