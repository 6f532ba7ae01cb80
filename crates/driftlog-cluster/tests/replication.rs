//! Replicator tests against real servers, without the gossip layer:
//! the membership handler calls are made directly.

use bytes::Bytes;
use driftlog_client::Client;
use driftlog_cluster::{Handler, Replicator};
use driftlog_core::{Config, Log};
use driftlog_server::{Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

async fn start_node() -> (SocketAddr, Arc<Log>, TempDir) {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Log::new(dir.path(), Config::default()).unwrap());
    let server = Server::bind("127.0.0.1:0", log.clone(), ServerConfig::default())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    (addr, log, dir)
}

async fn wait_for_record(addr: SocketAddr, offset: u64, deadline: Duration) -> Bytes {
    let start = Instant::now();
    loop {
        let mut client = Client::connect(addr).await.unwrap();
        match client.consume(offset).await {
            Ok(record) => return record.value,
            Err(_) if start.elapsed() < deadline => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(e) => panic!("record {offset} never replicated: {e}"),
        }
    }
}

#[tokio::test]
async fn records_flow_from_joined_peer() {
    let (source_addr, _source_log, _d1) = start_node().await;
    let (sink_addr, _sink_log, _d2) = start_node().await;

    let mut producer = Client::connect(source_addr).await.unwrap();
    producer.produce("hello world").await.unwrap();

    // The sink's replicator learns about the source and starts pulling.
    let replicator = Arc::new(Replicator::new(sink_addr));
    replicator
        .join("source", &source_addr.to_string())
        .unwrap();

    let value = wait_for_record(sink_addr, 0, Duration::from_secs(5)).await;
    assert_eq!(value, Bytes::from_static(b"hello world"));

    // Records produced after the join keep flowing.
    producer.produce("second").await.unwrap();
    let value = wait_for_record(sink_addr, 1, Duration::from_secs(5)).await;
    assert_eq!(value, Bytes::from_static(b"second"));

    replicator.close();
}

#[tokio::test]
async fn leave_stops_the_worker() {
    let (source_addr, _source_log, _d1) = start_node().await;
    let (sink_addr, _sink_log, _d2) = start_node().await;

    let mut producer = Client::connect(source_addr).await.unwrap();
    producer.produce("before leave").await.unwrap();

    let replicator = Arc::new(Replicator::new(sink_addr));
    replicator
        .join("source", &source_addr.to_string())
        .unwrap();
    wait_for_record(sink_addr, 0, Duration::from_secs(5)).await;

    replicator.leave("source").unwrap();
    // Give the worker a moment to observe its leave signal.
    tokio::time::sleep(Duration::from_millis(100)).await;

    producer.produce("after leave").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut sink_client = Client::connect(sink_addr).await.unwrap();
    assert!(
        sink_client.consume(1).await.is_err(),
        "no record may replicate after leave"
    );

    replicator.close();
}
