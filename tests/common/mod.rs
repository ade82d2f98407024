//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Replicated test objects for each change type
//! - A fault-injecting transport wrapper
//! - Helpers to start nodes on a loopback network

#![allow(dead_code)]

pub mod objects;
pub mod transport;

pub use objects::*;
pub use transport::*;

use object_replication::{LocalNode, LoopbackNetwork, ReplicationConfig};
use std::sync::Arc;
use std::time::Duration;

/// Start a node with the testing config, adjusted by `tweak`.
pub fn start_node(network: &LoopbackNetwork, id: &str, tweak: impl FnOnce(&mut ReplicationConfig)) -> LocalNode {
    let (transport, inbound) = network.attach(id);
    let mut config = ReplicationConfig::for_testing(id);
    tweak(&mut config);
    LocalNode::start(config, transport, inbound)
}

/// Start a node whose outbound traffic goes through a [`FaultyTransport`].
pub fn start_faulty_node(network: &LoopbackNetwork, id: &str) -> (LocalNode, Arc<FaultyTransport>) {
    let (transport, inbound) = network.attach(id);
    let faulty = Arc::new(FaultyTransport::new(transport));
    let node = LocalNode::start(ReplicationConfig::for_testing(id), faulty.clone(), inbound);
    (node, faulty)
}

/// A master node plus `slaves` slave nodes named "slave-1", "slave-2", ...
pub fn cluster(slaves: usize) -> (LoopbackNetwork, LocalNode, Vec<LocalNode>) {
    let network = LoopbackNetwork::new();
    let master = start_node(&network, "master", |_| {});
    let nodes = (1..=slaves)
        .map(|i| start_node(&network, &format!("slave-{}", i), |_| {}))
        .collect();
    (network, master, nodes)
}

pub async fn shutdown_all(nodes: impl IntoIterator<Item = &LocalNode>) {
    for node in nodes {
        node.shutdown().await;
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
