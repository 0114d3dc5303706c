#![allow(dead_code)]

use std::time::Duration;

use realm_mesh::{Envelope, MeshConfig, MeshNode, NodeId};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(3);
pub const QUIET: Duration = Duration::from_millis(300);

pub async fn started_node() -> MeshNode {
    started_node_with(MeshConfig::loopback()).await
}

pub async fn started_node_with(config: MeshConfig) -> MeshNode {
    let node = MeshNode::new(config);
    node.start(0).await.expect("start node");
    node
}

/// Whether `node` lists `peer` as online, polling for up to [`WAIT`].
pub async fn wait_online(node: &MeshNode, peer: NodeId) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        let peers = node.list_peers().await;
        if peers.iter().any(|p| p.node_id == peer && p.online) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Whether `node` lists `peer` as offline, polling for up to [`WAIT`].
pub async fn wait_offline(node: &MeshNode, peer: NodeId) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        let peers = node.list_peers().await;
        if peers.iter().any(|p| p.node_id == peer && !p.online) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Dial `to` from `from` and wait until both sides list each other online.
pub async fn link(from: &MeshNode, to: &MeshNode) {
    from.connect_to_peer(&to.local_endpoint())
        .await
        .expect("connect");
    assert!(wait_online(from, to.node_id()).await, "dialer never saw peer");
    assert!(wait_online(to, from.node_id()).await, "listener never saw peer");
}

pub async fn recv_within(rx: &mut mpsc::Receiver<Envelope>) -> Option<Envelope> {
    tokio::time::timeout(WAIT, rx.recv()).await.ok().flatten()
}

/// Panic if anything arrives on `rx` within [`QUIET`].
pub async fn assert_quiet(rx: &mut mpsc::Receiver<Envelope>) {
    if let Ok(Some(envelope)) = tokio::time::timeout(QUIET, rx.recv()).await {
        panic!("unexpected delivery: {envelope:?}");
    }
}
