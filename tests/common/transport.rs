//! Transport wrapper that records and optionally drops outbound frames.

use object_replication::error::{ReplicationError, Result};
use object_replication::{NodeId, Transport};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct FaultyTransport {
    inner: Arc<dyn Transport>,
    unreachable: Mutex<HashSet<NodeId>>,
    sent: Mutex<HashMap<NodeId, usize>>,
}

impl FaultyTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            unreachable: Mutex::new(HashSet::new()),
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// Fail every later send to `node`.
    pub fn cut(&self, node: &str) {
        self.unreachable.lock().insert(NodeId::new(node));
    }

    pub fn heal(&self, node: &str) {
        self.unreachable.lock().remove(&NodeId::new(node));
    }

    /// Frames delivered to `node` so far.
    pub fn sent_to(&self, node: &str) -> usize {
        self.sent.lock().get(&NodeId::new(node)).copied().unwrap_or(0)
    }
}

impl Transport for FaultyTransport {
    fn local_id(&self) -> &NodeId {
        self.inner.local_id()
    }

    fn send(&self, to: &NodeId, frame: Vec<u8>) -> Result<()> {
        if self.unreachable.lock().contains(to) {
            return Err(ReplicationError::peer(to, "link cut by test"));
        }
        self.inner.send(to, frame)?;
        *self.sent.lock().entry(to.clone()).or_default() += 1;
        Ok(())
    }
}
