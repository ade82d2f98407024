// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node-to-node packet delivery.
//!
//! The change managers only need two things from the network: who we are,
//! and "put this frame on the wire towards node X". Frames between one pair
//! of nodes must arrive in the order they were sent.
//!
//! [`LoopbackNetwork`] is an in-process implementation used by the tests
//! and by applications running several nodes in one process.

use crate::error::{ReplicationError, Result};
use crate::packet::{encode_body, encode_frame, PacketHeader};
use crate::version::NodeId;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Inbound frames for one attached node.
pub type Inbound = mpsc::UnboundedReceiver<Vec<u8>>;

/// Ordered, reliable frame delivery to other nodes.
pub trait Transport: Send + Sync + 'static {
    /// Identity of the local node.
    fn local_id(&self) -> &NodeId;

    /// Queue a frame for `to`. Fails if the peer is unknown or gone.
    fn send(&self, to: &NodeId, frame: Vec<u8>) -> Result<()>;
}

/// Encode and send a control packet.
pub fn send_control<B: Serialize>(
    transport: &dyn Transport,
    to: &NodeId,
    header: &PacketHeader,
    body: Option<&B>,
) -> Result<()> {
    let payload = match body {
        Some(body) => encode_body(body)?,
        None => Vec::new(),
    };
    let frame = encode_frame(header, &payload)?;
    trace!(
        peer_id = %to,
        command = ?header.command,
        object_id = %header.object_id,
        version = %header.version,
        "Sending control packet"
    );
    transport.send(to, frame)
}

type Routes = Arc<RwLock<HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>>>;

/// In-process network connecting any number of nodes.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    routes: Routes,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node. Re-attaching an id replaces its previous inbox.
    pub fn attach(&self, id: impl Into<NodeId>) -> (Arc<dyn Transport>, Inbound) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().insert(id.clone(), tx);
        debug!(node_id = %id, "Node attached to loopback network");
        let transport = LoopbackTransport {
            id,
            routes: Arc::clone(&self.routes),
        };
        (Arc::new(transport), rx)
    }

    /// Remove a node. Later sends to it fail.
    pub fn detach(&self, id: &NodeId) -> bool {
        let removed = self.routes.write().remove(id).is_some();
        if removed {
            debug!(node_id = %id, "Node detached from loopback network");
        }
        removed
    }

    pub fn node_count(&self) -> usize {
        self.routes.read().len()
    }
}

struct LoopbackTransport {
    id: NodeId,
    routes: Routes,
}

impl Transport for LoopbackTransport {
    fn local_id(&self) -> &NodeId {
        &self.id
    }

    fn send(&self, to: &NodeId, frame: Vec<u8>) -> Result<()> {
        let routes = self.routes.read();
        let tx = routes
            .get(to)
            .ok_or_else(|| ReplicationError::peer(to, "not attached"))?;
        tx.send(frame)
            .map_err(|_| ReplicationError::peer(to, "inbox closed"))
    }
}
