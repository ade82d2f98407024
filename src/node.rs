// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node runtime: receiver and command tasks plus object attachment.
//!
//! # Tasks
//!
//! ```text
//!  Transport inbox ──▶ receiver task ──Command──▶ command task ──▶ handlers
//!                      (decode into a            (one at a time,
//!                       pooled buffer)            per-object tables)
//!                                          ▲
//!  MasterObject::commit_nb ──ObjectCommit──┘
//! ```
//!
//! Application calls (`commit`, `sync`, `map_object`) run on whatever task
//! the application uses and talk to the command task through its queue.

use crate::command::{CacheStats, Command, CommandCache};
use crate::config::ReplicationConfig;
use crate::dispatch::ObjectRegistry;
use crate::error::{ReplicationError, Result};
use crate::instance_cache::InstanceCache;
use crate::metrics;
use crate::object::{Distributable, MasterObject, SlaveObject};
use crate::transport::{Inbound, Transport};
use crate::version::{InstanceId, NodeId, ObjectId, RequestId, Version};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a [`LocalNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Running,
    ShuttingDown,
    Stopped,
}

struct NodeInner {
    id: NodeId,
    config: ReplicationConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<ObjectRegistry>,
    command_cache: CommandCache,
    instance_cache: Option<Arc<InstanceCache>>,
    command_tx: mpsc::UnboundedSender<Command>,
    next_instance: AtomicU32,
    next_request: AtomicU32,
    shutdown_tx: watch::Sender<bool>,
    state_tx: watch::Sender<NodeState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One participant in the session. Cheap to clone.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<NodeInner>,
}

impl LocalNode {
    /// Start the receiver and command tasks. Must be called inside a tokio
    /// runtime.
    pub fn start(config: ReplicationConfig, transport: Arc<dyn Transport>, inbound: Inbound) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(NodeState::Running);
        let registry = Arc::new(ObjectRegistry::new());
        let command_cache = CommandCache::new(&config.command_cache);
        let instance_cache = config
            .instance_cache
            .enabled
            .then(|| Arc::new(InstanceCache::new(config.instance_cache.max_versions_per_object)));
        let id = transport.local_id().clone();

        if config.local_node_id != id.as_str() {
            warn!(
                configured = %config.local_node_id,
                transport = %id,
                "Configured node id differs from transport identity, using transport"
            );
        }

        let receiver = tokio::spawn(run_receiver(
            id.clone(),
            inbound,
            command_cache.clone(),
            command_tx.clone(),
            shutdown_rx.clone(),
        ));
        let commands = tokio::spawn(run_commands(id.clone(), Arc::clone(&registry), command_rx, shutdown_rx));

        info!(
            node_id = %id,
            chunk_size = config.stream.chunk_size,
            compression = config.stream.compression_enabled,
            instance_cache = instance_cache.is_some(),
            "Node started"
        );

        Self {
            inner: Arc::new(NodeInner {
                id,
                config,
                transport,
                registry,
                command_cache,
                instance_cache,
                command_tx,
                next_instance: AtomicU32::new(1),
                next_request: AtomicU32::new(1),
                shutdown_tx,
                state_tx,
                tasks: Mutex::new(vec![receiver, commands]),
            }),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.inner.config
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state_tx.borrow()
    }

    /// Watch lifecycle changes.
    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.inner.state_tx.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn command_cache_stats(&self) -> CacheStats {
        self.inner.command_cache.stats()
    }

    pub fn instance_cache(&self) -> Option<&Arc<InstanceCache>> {
        self.inner.instance_cache.as_ref()
    }

    pub(crate) fn registry(&self) -> &ObjectRegistry {
        &self.inner.registry
    }

    /// Attached object instances (masters and slaves).
    pub fn attached_instances(&self) -> usize {
        self.inner.registry.instance_count()
    }

    pub(crate) fn next_instance_id(&self) -> InstanceId {
        InstanceId(self.inner.next_instance.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.inner.next_request.fetch_add(1, Ordering::Relaxed))
    }

    /// Put a locally created command on the command task's queue.
    pub(crate) fn enqueue_local(&self, command: Command) -> Result<()> {
        self.inner
            .command_tx
            .send(command)
            .map_err(|_| ReplicationError::Shutdown)
    }

    /// Make `object` the master of a new distributed object.
    pub fn register_object<T: Distributable>(&self, object: T) -> MasterObject<T> {
        MasterObject::attach(self, object)
    }

    /// Map a slave copy of `object_id`, whose master lives on `master`.
    ///
    /// `version` selects the first version: a concrete version,
    /// `Version::OLDEST` or `Version::HEAD`. The returned object holds that
    /// version's state.
    pub async fn map_object<T: Distributable>(
        &self,
        object_id: ObjectId,
        master: &NodeId,
        version: Version,
        object: T,
    ) -> Result<SlaveObject<T>> {
        if self.state() != NodeState::Running {
            return Err(ReplicationError::Shutdown);
        }
        SlaveObject::map(self, object_id, master, version, object).await
    }

    /// Stop the receiver and command tasks.
    pub async fn shutdown(&self) {
        if self.state() != NodeState::Running {
            return;
        }
        info!(node_id = %self.inner.id, "Shutting down node");
        let _ = self.inner.state_tx.send(NodeState::ShuttingDown);
        let _ = self.inner.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
        let drain_timeout = Duration::from_secs(5);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        let _ = self.inner.state_tx.send(NodeState::Stopped);
        info!(node_id = %self.inner.id, "Node stopped");
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("instances", &self.attached_instances())
            .finish()
    }
}

async fn run_receiver(
    node_id: NodeId,
    mut inbound: Inbound,
    cache: CommandCache,
    command_tx: mpsc::UnboundedSender<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(frame) = frame else {
                    debug!(node_id = %node_id, "Inbound channel closed");
                    break;
                };
                match cache.command_from_frame(&frame) {
                    Ok(command) => {
                        if command_tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(node_id = %node_id, error = %e, bytes = frame.len(), "Dropping undecodable frame");
                        metrics::record_dropped_frame("decode");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!(node_id = %node_id, "Receiver task stopped");
}

async fn run_commands(
    node_id: NodeId,
    registry: Arc<ObjectRegistry>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            command = command_rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                let command_type = command.command();
                let object_id = command.header().object_id;
                let source = command.header().source.clone();
                match registry.dispatch(command) {
                    Ok(handled) => {
                        trace!(node_id = %node_id, command = ?command_type, object_id = %object_id, handled, "Dispatched");
                    }
                    Err(ReplicationError::UnknownObject(what)) => {
                        debug!(node_id = %node_id, command = ?command_type, peer_id = %source, object = %what, "No attached instance");
                        metrics::record_dropped_frame("unknown_object");
                    }
                    Err(e) if e.is_protocol_violation() => {
                        error!(node_id = %node_id, command = ?command_type, object_id = %object_id, peer_id = %source, error = %e, "Protocol violation");
                    }
                    Err(e) => {
                        warn!(node_id = %node_id, command = ?command_type, object_id = %object_id, error = %e, "Command handler failed");
                    }
                }
            }
        }
    }
    debug!(node_id = %node_id, "Command task stopped");
}
