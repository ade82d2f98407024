// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Application-facing distributed objects.
//!
//! An application type implements [`Distributable`] to describe how its
//! state is serialized. Attaching it to a [`LocalNode`] as a master yields a
//! [`MasterObject`]; mapping a copy on another node yields a
//! [`SlaveObject`].
//!
//! # Commit Flow
//!
//! ```text
//! application task          command task
//! ────────────────          ────────────
//! commit_nb() ──ObjectCommit──▶ MasterChangeManager::commit
//!     │ RequestId                 │ serialize, send, retain
//! commit_sync(id) ◀──oneshot──────┘ Result<Version>
//! ```
//!
//! The master's state lives behind a mutex so the command task can
//! serialize it. Do not hold the guard returned by
//! [`MasterObject::lock`] across an `.await`.

use crate::change_manager::{CmContext, MasterChangeManager, SlaveChangeManager, SlaveQueue};
use crate::command::Command;
use crate::dispatch::CommandTable;
use crate::error::{ReplicationError, Result};
use crate::node::{LocalNode, NodeState};
use crate::packet::{decode_body, CommandType, PacketHeader, StreamKind, SubscribeReply, SubscribeRequest};
use crate::stream::{DataIStream, DataOStream};
use crate::transport::{send_control, Transport};
use crate::version::{ChangeType, InstanceId, NodeId, ObjectId, RequestId, Version};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Serialization hooks of a replicated type.
pub trait Distributable: Send + 'static {
    /// How changes are distributed. Must not change over the object's life.
    fn change_type(&self) -> ChangeType;

    /// Write the complete state.
    fn get_instance_data(&self, os: &mut DataOStream) -> Result<()>;

    /// Replace the state with data written by `get_instance_data`.
    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()>;

    /// Write the changes since the last `pack`. Writing nothing means
    /// "no change" and the commit does not create a version.
    fn pack(&mut self, os: &mut DataOStream) -> Result<()> {
        self.get_instance_data(os)
    }

    /// Apply data written by `pack`.
    fn unpack(&mut self, is: &mut DataIStream) -> Result<()> {
        self.apply_instance_data(is)
    }

    /// Name used in diagnostics.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

type CommitReplies = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<Version>>>>>;

/// Handlers a master instance installs on the command task.
fn master_table<T: Distributable>(
    object_id: ObjectId,
    state: Arc<Mutex<T>>,
    cm: Arc<Mutex<MasterChangeManager>>,
    replies: CommitReplies,
    transport: Arc<dyn Transport>,
) -> CommandTable {
    let commit = {
        let state = Arc::clone(&state);
        let cm = Arc::clone(&cm);
        move |command: Command| -> Result<()> {
            let request = RequestId(command.header().request_id);
            command.release();
            let result = {
                let mut object = state.lock();
                let mut cm = cm.lock();
                cm.commit(&mut *object)
            };
            if let Err(e) = &result {
                warn!(object_id = %object_id, request = %request, error = %e, "Commit failed");
            }
            match replies.lock().remove(&request) {
                Some(waiter) => {
                    let _ = waiter.send(result);
                }
                None => trace!(object_id = %object_id, request = %request, "Commit result has no waiter"),
            }
            Ok(())
        }
    };

    let subscribe = {
        let state = Arc::clone(&state);
        let cm = Arc::clone(&cm);
        move |command: Command| -> Result<()> {
            let source = command.header().source.clone();
            let request: SubscribeRequest = decode_body(command.payload())?;
            command.release();

            let reply = {
                let object = state.lock();
                let mut cm = cm.lock();
                cm.add_slave(&source, &request, &*object).unwrap_or_else(|e| {
                    warn!(object_id = %object_id, peer_id = %source, error = %e, "Refusing subscription");
                    SubscribeReply::refused(e.to_string())
                })
            };
            let header = PacketHeader::control(
                transport.local_id().clone(),
                object_id,
                request.instance_id,
                CommandType::ObjectSubscribeReply,
                reply.start_version,
            );
            send_control(transport.as_ref(), &source, &header, Some(&reply))
        }
    };

    let unsubscribe = move |command: Command| -> Result<()> {
        cm.lock().remove_slave(&command.header().source);
        Ok(())
    };

    CommandTable::new()
        .with(CommandType::ObjectCommit, commit)
        .with(CommandType::ObjectSubscribe, subscribe)
        .with(CommandType::ObjectUnsubscribe, unsubscribe)
}

/// Handlers a slave instance installs on the command task.
fn slave_table(queue: Arc<SlaveQueue>) -> CommandTable {
    let data = |queue: Arc<SlaveQueue>| move |command: Command| queue.add_data_packet(command);
    let marker = {
        let queue = Arc::clone(&queue);
        move |command: Command| -> Result<()> {
            queue.set_version_marker(command.header().version);
            Ok(())
        }
    };
    let reply = {
        let queue = Arc::clone(&queue);
        move |command: Command| -> Result<()> {
            let reply: SubscribeReply = decode_body(command.payload())?;
            queue.set_map_reply(reply);
            Ok(())
        }
    };

    CommandTable::new()
        .with(CommandType::ObjectInstance, data(Arc::clone(&queue)))
        .with(CommandType::ObjectDelta, data(Arc::clone(&queue)))
        .with(CommandType::ObjectDeltaData, data(queue))
        .with(CommandType::ObjectVersion, marker)
        .with(CommandType::ObjectSubscribeReply, reply)
}

/// The authoritative copy of a replicated object.
pub struct MasterObject<T: Distributable> {
    id: ObjectId,
    instance_id: InstanceId,
    change_type: ChangeType,
    state: Arc<Mutex<T>>,
    cm: Arc<Mutex<MasterChangeManager>>,
    replies: CommitReplies,
    waiting: Mutex<HashMap<RequestId, oneshot::Receiver<Result<Version>>>>,
    node: LocalNode,
}

impl<T: Distributable> MasterObject<T> {
    pub(crate) fn attach(node: &LocalNode, object: T) -> Self {
        let id = ObjectId::new_v4();
        let instance_id = node.next_instance_id();
        let change_type = object.change_type();
        let config = node.config();
        let ctx = CmContext {
            object_id: id,
            transport: node.transport().clone(),
            stream: config.stream.clone(),
            history: config.history.clone(),
        };
        let cm = Arc::new(Mutex::new(MasterChangeManager::new(change_type, ctx)));
        let state = Arc::new(Mutex::new(object));
        let replies: CommitReplies = Arc::new(Mutex::new(HashMap::new()));

        let table = master_table(
            id,
            Arc::clone(&state),
            Arc::clone(&cm),
            Arc::clone(&replies),
            node.transport().clone(),
        );
        node.registry().insert(id, instance_id, table);
        info!(object_id = %id, instance_id = %instance_id, change_type = %change_type, "Registered master object");

        Self {
            id,
            instance_id,
            change_type,
            state,
            cm,
            replies,
            waiting: Mutex::new(HashMap::new()),
            node: node.clone(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn is_master(&self) -> bool {
        true
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    /// Lock the object state for reading or modification.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock()
    }

    /// Run `f` with exclusive access to the state.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut *state)
    }

    /// Queue a commit on the command task and return its handle.
    ///
    /// Fails immediately for static objects.
    pub fn commit_nb(&self) -> Result<RequestId> {
        if self.change_type == ChangeType::Static {
            return Err(ReplicationError::IllegalOperation(format!(
                "commit on static object {}",
                self.id
            )));
        }

        let request = self.node.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.replies.lock().insert(request, tx);
        self.waiting.lock().insert(request, rx);

        let mut header = PacketHeader::control(
            self.node.id().clone(),
            self.id,
            self.instance_id,
            CommandType::ObjectCommit,
            Version::NONE,
        );
        header.request_id = request.0;
        if let Err(e) = self.node.enqueue_local(Command::local(header, Vec::new())) {
            self.replies.lock().remove(&request);
            self.waiting.lock().remove(&request);
            return Err(e);
        }
        trace!(object_id = %self.id, request = %request, "Commit queued");
        Ok(request)
    }

    /// Wait for a commit queued with [`commit_nb`](Self::commit_nb).
    ///
    /// Returns the object's version after the commit, unchanged if nothing
    /// was written.
    pub async fn commit_sync(&self, request: RequestId) -> Result<Version> {
        let mut receiver = self
            .waiting
            .lock()
            .remove(&request)
            .ok_or_else(|| ReplicationError::InvalidState {
                expected: "a pending commit request".to_string(),
                actual: request.to_string(),
            })?;

        let mut state = self.node.state_receiver();
        let timeout = self.node.config().sync.commit_timeout_duration();
        let waited = tokio::time::timeout(timeout, async {
            tokio::select! {
                biased;

                result = &mut receiver => result.unwrap_or(Err(ReplicationError::Shutdown)),

                // The command task has exited; a result it produced is still
                // in the channel.
                _ = state.wait_for(|s| *s == NodeState::Stopped) => {
                    receiver.try_recv().unwrap_or(Err(ReplicationError::Shutdown))
                }
            }
        })
        .await;

        match waited {
            Ok(Err(ReplicationError::Shutdown)) => {
                self.replies.lock().remove(&request);
                debug!(object_id = %self.id, request = %request, "Commit abandoned by node shutdown");
                Err(ReplicationError::Shutdown)
            }
            Ok(result) => result,
            Err(_) => {
                self.replies.lock().remove(&request);
                Err(ReplicationError::Timeout(format!("commit {} of {}", request, self.id)))
            }
        }
    }

    /// Commit and wait for the result.
    pub async fn commit(&self) -> Result<Version> {
        let request = self.commit_nb()?;
        self.commit_sync(request).await
    }

    pub fn version(&self) -> Version {
        self.cm.lock().version()
    }

    pub fn head_version(&self) -> Version {
        self.cm.lock().head_version()
    }

    pub fn oldest_version(&self) -> Version {
        self.cm.lock().oldest_version()
    }

    /// Versions retained for late subscribers, oldest first.
    pub fn retained_versions(&self) -> Vec<Version> {
        self.cm.lock().retained_versions()
    }

    /// Drop retained versions older than `version`.
    pub fn obsolete(&self, version: Version) {
        self.cm.lock().obsolete(version);
    }

    /// Keep only versions from the last `count` commits.
    pub fn set_auto_obsolete(&self, count: u32) {
        self.cm.lock().set_auto_obsolete(count);
    }

    pub fn subscribed_nodes(&self) -> usize {
        self.cm.lock().subscribed_nodes()
    }
}

impl<T: Distributable> Drop for MasterObject<T> {
    fn drop(&mut self) {
        self.node.registry().remove(self.id, self.instance_id);
        debug!(object_id = %self.id, "Master object detached");
    }
}

impl<T: Distributable> std::fmt::Debug for MasterObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterObject")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("change_type", &self.change_type)
            .field("cm", &*self.cm.lock())
            .finish()
    }
}

/// A replica of an object whose master lives on some node.
pub struct SlaveObject<T: Distributable> {
    id: ObjectId,
    instance_id: InstanceId,
    master: NodeId,
    object: T,
    cm: SlaveChangeManager,
    node: LocalNode,
    attached: bool,
}

impl<T: Distributable> SlaveObject<T> {
    pub(crate) async fn map(
        node: &LocalNode,
        object_id: ObjectId,
        master: &NodeId,
        requested: Version,
        mut object: T,
    ) -> Result<Self> {
        let change_type = object.change_type();
        let instance_id = node.next_instance_id();
        let queue = Arc::new(SlaveQueue::new(object_id, node.instance_cache().cloned()));
        node.registry().insert(object_id, instance_id, slave_table(Arc::clone(&queue)));

        let mut cm = SlaveChangeManager::new(change_type, Arc::clone(&queue));

        let reply = match Self::request_map(node, object_id, instance_id, master, requested, &queue).await {
            Ok(reply) => reply,
            Err(e) => {
                node.registry().remove(object_id, instance_id);
                queue.close();
                warn!(object_id = %object_id, master = %master, error = %e, "Subscription failed");
                return Err(e);
            }
        };

        if let Err(e) = Self::complete_map(node, object_id, &reply, &mut object, &mut cm).await {
            node.registry().remove(object_id, instance_id);
            queue.close();
            unsubscribe(node, object_id, master);
            warn!(object_id = %object_id, master = %master, error = %e, "Applying map data failed");
            return Err(e);
        }

        info!(
            object_id = %object_id,
            instance_id = %instance_id,
            master = %master,
            version = %cm.version(),
            "Mapped slave object"
        );
        Ok(Self {
            id: object_id,
            instance_id,
            master: master.clone(),
            object,
            cm,
            node: node.clone(),
            attached: true,
        })
    }

    /// Ask the master for a subscription and wait for its reply. The
    /// master replays history before replying, so on success all map data
    /// is already queued.
    async fn request_map(
        node: &LocalNode,
        object_id: ObjectId,
        instance_id: InstanceId,
        master: &NodeId,
        requested: Version,
        queue: &SlaveQueue,
    ) -> Result<SubscribeReply> {
        let cached = node.instance_cache().and_then(|cache| cache.cached_range(object_id));
        let request = SubscribeRequest {
            instance_id,
            requested_version: requested,
            cached,
        };
        let header = PacketHeader::control(
            node.id().clone(),
            object_id,
            InstanceId::ALL,
            CommandType::ObjectSubscribe,
            requested,
        );
        send_control(node.transport().as_ref(), master, &header, Some(&request))?;

        let timeout = node.config().sync.map_timeout_duration();
        let reply = tokio::time::timeout(timeout, queue.wait_map_reply())
            .await
            .map_err(|_| ReplicationError::Timeout(format!("map reply for {}", object_id)))??;

        match reply.error {
            Some(message) => Err(ReplicationError::protocol(object_id, message)),
            None => Ok(reply),
        }
    }

    async fn complete_map(
        node: &LocalNode,
        object_id: ObjectId,
        reply: &SubscribeReply,
        object: &mut T,
        cm: &mut SlaveChangeManager,
    ) -> Result<()> {
        if reply.change_type != Some(cm.change_type()) {
            return Err(ReplicationError::protocol(
                object_id,
                format!(
                    "change type mismatch: master {:?}, slave {}",
                    reply.change_type,
                    cm.change_type()
                ),
            ));
        }

        if let Some((lo, hi)) = reply.cached {
            let cache = node
                .instance_cache()
                .ok_or_else(|| ReplicationError::Internal("cached range without instance cache".to_string()))?;
            for v in lo.get()..=hi.get() {
                let version = Version(v);
                let payload = cache.get(object_id, version).ok_or_else(|| {
                    ReplicationError::protocol(object_id, format!("cached version {} was evicted", version))
                })?;
                cm.queue().insert_ready(DataIStream::from_saved(
                    object_id,
                    StreamKind::Instance,
                    version,
                    payload.as_ref().clone(),
                ));
            }
            debug!(object_id = %object_id, from = %lo, to = %hi, "Reused cached instance data");
        }

        let timeout = node.config().sync.map_timeout_duration();
        tokio::time::timeout(timeout, cm.apply_map_data(object, reply))
            .await
            .map_err(|_| ReplicationError::Timeout(format!("map data for {}", object_id)))?
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn master(&self) -> &NodeId {
        &self.master
    }

    pub fn is_master(&self) -> bool {
        false
    }

    pub fn change_type(&self) -> ChangeType {
        self.cm.change_type()
    }

    /// Apply received versions up to `version`, or `Version::HEAD` /
    /// `Version::NEXT`. Returns the version reached.
    pub async fn sync(&mut self, version: Version) -> Result<Version> {
        self.cm.sync(&mut self.object, version).await
    }

    /// Version applied to the local copy.
    pub fn version(&self) -> Version {
        self.cm.version()
    }

    /// Newest version received.
    pub fn head_version(&self) -> Version {
        self.cm.head_version()
    }

    pub fn get(&self) -> &T {
        &self.object
    }

    /// Local, unreplicated access to the copy.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.object
    }

    /// Detach from the master. Queued versions are discarded.
    pub fn unmap(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        self.node.registry().remove(self.id, self.instance_id);
        unsubscribe(&self.node, self.id, &self.master);
        let flushed = self.cm.queue().close();
        debug!(object_id = %self.id, instance_id = %self.instance_id, flushed, "Slave object unmapped");
    }
}

fn unsubscribe(node: &LocalNode, object_id: ObjectId, master: &NodeId) {
    let header = PacketHeader::control(
        node.id().clone(),
        object_id,
        InstanceId::ALL,
        CommandType::ObjectUnsubscribe,
        Version::NONE,
    );
    if let Err(e) = send_control::<()>(node.transport().as_ref(), master, &header, None) {
        debug!(object_id = %object_id, master = %master, error = %e, "Unsubscribe not delivered");
    }
}

impl<T: Distributable> Drop for SlaveObject<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<T: Distributable> std::fmt::Debug for SlaveObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveObject")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("master", &self.master)
            .field("cm", &self.cm)
            .finish()
    }
}
