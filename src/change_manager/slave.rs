// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Slave-side change managers and their version queue.
//!
//! # Threading
//!
//! ```text
//! command task                         application task
//! ────────────                         ────────────────
//! add_data_packet ─▶ SlaveQueue ◀───── sync(v): pop + apply
//!                    (Mutex + Notify)
//! ```
//!
//! The queue is the only state shared between the two; the change manager
//! itself and the object it updates live on the application side.

use crate::command::Command;
use crate::error::{ReplicationError, Result};
use crate::instance_cache::InstanceCache;
use crate::metrics;
use crate::object::Distributable;
use crate::packet::{StreamKind, SubscribeReply};
use crate::stream::DataIStream;
use crate::version::{ChangeType, ObjectId, Version};
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

#[derive(Default)]
struct QueueState {
    /// Streams still receiving chunks.
    pending: HashMap<Version, DataIStream>,
    /// Complete streams waiting to be applied, oldest first.
    ready: BTreeMap<Version, DataIStream>,
    /// Versions at or below this were applied at map time. `None` until
    /// mapped, so the pre-commit snapshot labelled NONE is kept.
    floor: Option<Version>,
    /// Newest version completed.
    head: Version,
    version_marker: Option<Version>,
    reply: Option<SubscribeReply>,
    closed: bool,
}

/// Received-version queue of one slave instance.
pub struct SlaveQueue {
    object_id: ObjectId,
    state: Mutex<QueueState>,
    notify: Notify,
    instance_cache: Option<Arc<InstanceCache>>,
}

impl SlaveQueue {
    pub fn new(object_id: ObjectId, instance_cache: Option<Arc<InstanceCache>>) -> Self {
        Self {
            object_id,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            instance_cache,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Feed one data chunk. Called on the command task.
    pub fn add_data_packet(&self, command: Command) -> Result<()> {
        let version = command.header().version;
        let mut state = self.state.lock();
        if state.closed {
            trace!(object_id = %self.object_id, version = %version, "Dropping chunk for closed queue");
            return Ok(());
        }

        let stream = state
            .pending
            .entry(version)
            .or_insert_with(|| DataIStream::new(self.object_id));
        let complete = match stream.add_data_packet(command) {
            Ok(complete) => complete,
            Err(e) => {
                state.pending.remove(&version);
                metrics::record_protocol_violation("chunk_sequence");
                error!(object_id = %self.object_id, version = %version, error = %e, "Rejected data chunk");
                return Err(e);
            }
        };
        if !complete {
            return Ok(());
        }

        let Some(stream) = state.pending.remove(&version) else {
            return Err(ReplicationError::Internal(format!("completed stream {} vanished", version)));
        };
        if let Err(e) = stream.verify_digest() {
            metrics::record_protocol_violation("digest");
            error!(object_id = %self.object_id, version = %version, error = %e, "Discarding corrupt version");
            return Err(e);
        }

        if stream.kind() == Some(StreamKind::Instance) && version != Version::NONE {
            if let Some(cache) = &self.instance_cache {
                match stream.payload_bytes() {
                    Ok(bytes) => cache.insert(self.object_id, version, bytes),
                    Err(e) => warn!(object_id = %self.object_id, version = %version, error = %e, "Could not cache instance data"),
                }
            }
        }

        let queued = Self::enqueue(&mut state, self.object_id, stream);
        drop(state);
        if queued {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Queue a complete stream obtained locally, e.g. from the instance
    /// cache.
    pub fn insert_ready(&self, stream: DataIStream) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let queued = Self::enqueue(&mut state, self.object_id, stream);
        drop(state);
        if queued {
            self.notify.notify_waiters();
        }
    }

    /// A stream addressed to this instance replaces a queued broadcast of
    /// the same version; a broadcast never replaces anything.
    fn enqueue(state: &mut QueueState, object_id: ObjectId, stream: DataIStream) -> bool {
        let version = stream.version();
        if let Some(floor) = state.floor.filter(|floor| version <= *floor) {
            trace!(object_id = %object_id, version = %version, floor = %floor, "Dropping already applied version");
            return false;
        }
        match state.ready.entry(version) {
            Entry::Vacant(slot) => {
                slot.insert(stream);
            }
            Entry::Occupied(mut slot) => {
                if !stream.is_addressed() {
                    trace!(object_id = %object_id, version = %version, "Dropping duplicate broadcast version");
                    return false;
                }
                slot.insert(stream);
            }
        }
        state.head = state.head.max(version);
        metrics::set_queued_versions(&object_id.to_string(), state.ready.len());
        trace!(object_id = %object_id, version = %version, queued = state.ready.len(), "Version ready");
        true
    }

    /// Record the master's "no data, you are at version V" marker.
    pub fn set_version_marker(&self, version: Version) {
        self.state.lock().version_marker = Some(version);
        self.notify.notify_waiters();
    }

    pub fn version_marker(&self) -> Option<Version> {
        self.state.lock().version_marker
    }

    pub fn set_map_reply(&self, reply: SubscribeReply) {
        self.state.lock().reply = Some(reply);
        self.notify.notify_waiters();
    }

    /// Newest version completed so far.
    pub fn head_version(&self) -> Version {
        self.state.lock().head
    }

    pub fn queued_versions(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Stop accepting data, drop everything queued and wake waiters.
    /// Returns the number of streams flushed.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let flushed = state.pending.len() + state.ready.len();
        state.pending.clear();
        state.ready.clear();
        drop(state);
        self.notify.notify_waiters();
        flushed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Mark versions up to `version` as applied and drop any queued copies.
    fn set_floor(&self, version: Version) {
        let mut state = self.state.lock();
        state.floor = Some(version);
        state.head = state.head.max(version);
        let kept = state.ready.split_off(&version.next());
        state.ready = kept;
    }

    fn try_pop(&self) -> Option<DataIStream> {
        self.state.lock().ready.pop_first().map(|(_, stream)| stream)
    }

    /// Wait until `check` yields a value. `check` runs under the lock.
    async fn wait_for<R>(&self, mut check: impl FnMut(&mut QueueState) -> Option<R>) -> R {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let found = {
                let mut state = self.state.lock();
                check(&mut *state)
            };
            if let Some(found) = found {
                return found;
            }
            notified.await;
        }
    }

    pub async fn wait_map_reply(&self) -> Result<SubscribeReply> {
        self.wait_for(|state| match state.reply.take() {
            Some(reply) => Some(Ok(reply)),
            None if state.closed => Some(Err(ReplicationError::Shutdown)),
            None => None,
        })
        .await
    }

    async fn pop_wait(&self) -> Result<DataIStream> {
        self.wait_for(|state| match state.ready.pop_first() {
            Some((_, stream)) => Some(Ok(stream)),
            None if state.closed => Some(Err(ReplicationError::Shutdown)),
            None => None,
        })
        .await
    }

    async fn take_version(&self, version: Version) -> Result<DataIStream> {
        self.wait_for(|state| match state.ready.remove(&version) {
            Some(stream) => Some(Ok(stream)),
            None if state.closed => Some(Err(ReplicationError::Shutdown)),
            None => None,
        })
        .await
    }
}

impl std::fmt::Debug for SlaveQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SlaveQueue")
            .field("object_id", &self.object_id)
            .field("pending", &state.pending.len())
            .field("ready", &state.ready.len())
            .field("head", &state.head)
            .field("closed", &state.closed)
            .finish()
    }
}

fn check_consumed(object: &dyn Distributable, stream: &mut DataIStream) {
    let remaining = stream.remaining();
    if remaining > 0 {
        warn!(
            type_name = object.type_name(),
            object_id = %stream.object_id(),
            version = %stream.version(),
            remaining,
            "Application did not consume all data of version"
        );
        metrics::record_partial_consumption(object.type_name(), remaining);
        stream.discard();
    }
}

/// Queue-driven slave state shared by every variant.
#[derive(Debug)]
struct QueuedSlave {
    queue: Arc<SlaveQueue>,
    version: Version,
}

impl QueuedSlave {
    fn new(queue: Arc<SlaveQueue>) -> Self {
        Self {
            queue,
            version: Version::NONE,
        }
    }

    fn violation(&self, reason: &'static str, message: String) -> ReplicationError {
        metrics::record_protocol_violation(reason);
        error!(object_id = %self.queue.object_id, version = %self.version, reason, "{}", message);
        ReplicationError::protocol(self.queue.object_id, message)
    }

    async fn apply_map_data(&mut self, object: &mut dyn Distributable, reply: &SubscribeReply, name: &'static str) -> Result<()> {
        let start = reply.start_version;
        if start == Version::NONE {
            let marker = self.queue.version_marker();
            if marker != Some(Version::NONE) {
                return Err(self.violation(
                    "map_marker",
                    format!("mapped before first commit without a NONE marker, got {:?}", marker),
                ));
            }
            debug!(object_id = %self.queue.object_id, "Mapped before first commit");
        }

        let mut stream = self.queue.take_version(start).await?;
        if stream.kind() != Some(StreamKind::Instance) {
            return Err(self.violation(
                "map_data_kind",
                format!("map data for version {} is not instance data", start),
            ));
        }
        let applied = object.apply_instance_data(&mut stream);
        check_consumed(object, &mut stream);
        self.version = start;
        self.queue.set_floor(start);
        metrics::record_version_applied(name, StreamKind::Instance.as_str());
        debug!(object_id = %self.queue.object_id, version = %start, "Applied map data");
        applied
    }

    fn apply(
        &mut self,
        object: &mut dyn Distributable,
        mut stream: DataIStream,
        name: &'static str,
        accepts: fn(StreamKind) -> bool,
    ) -> Result<()> {
        let expected = self.version.next();
        if stream.version() != expected {
            return Err(self.violation(
                "version_gap",
                format!("expected version {}, got {}", expected, stream.version()),
            ));
        }
        let kind = match stream.kind() {
            Some(kind) if accepts(kind) => kind,
            other => {
                return Err(self.violation(
                    "unexpected_kind",
                    format!("{} cannot apply {:?} data for version {}", name, other, expected),
                ))
            }
        };

        let applied = match kind {
            StreamKind::Instance => object.apply_instance_data(&mut stream),
            StreamKind::Delta => object.unpack(&mut stream),
        };
        check_consumed(object, &mut stream);
        self.version = expected;
        metrics::record_version_applied(name, kind.as_str());
        trace!(object_id = %self.queue.object_id, version = %expected, kind = kind.as_str(), "Applied version");
        applied
    }

    async fn sync(
        &mut self,
        object: &mut dyn Distributable,
        target: Version,
        name: &'static str,
        accepts: fn(StreamKind) -> bool,
    ) -> Result<Version> {
        let started = Instant::now();
        match target {
            Version::HEAD => {
                while let Some(stream) = self.queue.try_pop() {
                    self.apply(object, stream, name, accepts)?;
                }
            }
            Version::NEXT => {
                let stream = self.queue.pop_wait().await?;
                self.apply(object, stream, name, accepts)?;
            }
            Version::OLDEST | Version::INVALID => {
                return Err(ReplicationError::IllegalOperation(format!("sync to {}", target)));
            }
            v if v < self.version => {
                return Err(self.violation(
                    "sync_backwards",
                    format!("sync to {} but already at {}", v, self.version),
                ));
            }
            v => {
                while self.version < v {
                    let stream = self.queue.pop_wait().await?;
                    self.apply(object, stream, name, accepts)?;
                }
            }
        }
        metrics::record_sync_wait(started.elapsed());
        Ok(self.version)
    }
}

fn instance_only(kind: StreamKind) -> bool {
    kind == StreamKind::Instance
}

fn any_kind(_: StreamKind) -> bool {
    true
}

fn delta_only(kind: StreamKind) -> bool {
    kind == StreamKind::Delta
}

/// Slave of a STATIC object: mapped once, never changes.
#[derive(Debug)]
pub struct StaticSlaveCm {
    core: QueuedSlave,
}

/// Slave of an INSTANCE object: every version is full instance data.
#[derive(Debug)]
pub struct FullSlaveCm {
    core: QueuedSlave,
}

/// Slave of a DELTA object: instance data or deltas, in version order.
#[derive(Debug)]
pub struct VersionedSlaveCm {
    core: QueuedSlave,
}

/// Slave of an UNBUFFERED object: a snapshot at map time, deltas after.
#[derive(Debug)]
pub struct DeltaSlaveCm {
    core: QueuedSlave,
}

/// Slave change manager, chosen once from the object's [`ChangeType`].
#[derive(Debug)]
pub enum SlaveChangeManager {
    Static(StaticSlaveCm),
    Full(FullSlaveCm),
    Versioned(VersionedSlaveCm),
    Delta(DeltaSlaveCm),
}

impl SlaveChangeManager {
    pub fn new(change_type: ChangeType, queue: Arc<SlaveQueue>) -> Self {
        let core = QueuedSlave::new(queue);
        match change_type {
            ChangeType::Static => Self::Static(StaticSlaveCm { core }),
            ChangeType::Instance => Self::Full(FullSlaveCm { core }),
            ChangeType::Delta => Self::Versioned(VersionedSlaveCm { core }),
            ChangeType::Unbuffered => Self::Delta(DeltaSlaveCm { core }),
        }
    }

    fn core(&self) -> &QueuedSlave {
        match self {
            Self::Static(cm) => &cm.core,
            Self::Full(cm) => &cm.core,
            Self::Versioned(cm) => &cm.core,
            Self::Delta(cm) => &cm.core,
        }
    }

    fn core_mut(&mut self) -> &mut QueuedSlave {
        match self {
            Self::Static(cm) => &mut cm.core,
            Self::Full(cm) => &mut cm.core,
            Self::Versioned(cm) => &mut cm.core,
            Self::Delta(cm) => &mut cm.core,
        }
    }

    fn accepts(&self) -> fn(StreamKind) -> bool {
        match self {
            Self::Static(_) | Self::Full(_) => instance_only,
            Self::Versioned(_) => any_kind,
            Self::Delta(_) => delta_only,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Static(_) => "StaticSlaveCM",
            Self::Full(_) => "FullSlaveCM",
            Self::Versioned(_) => "VersionedSlaveCM",
            Self::Delta(_) => "DeltaSlaveCM",
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            Self::Static(_) => ChangeType::Static,
            Self::Full(_) => ChangeType::Instance,
            Self::Versioned(_) => ChangeType::Delta,
            Self::Delta(_) => ChangeType::Unbuffered,
        }
    }

    pub fn queue(&self) -> &Arc<SlaveQueue> {
        &self.core().queue
    }

    /// Version currently applied to the object.
    pub fn version(&self) -> Version {
        self.core().version
    }

    /// Newest version received, applied or not.
    pub fn head_version(&self) -> Version {
        let core = self.core();
        core.queue.head_version().max(core.version)
    }

    /// First-time initialization from the version named in the map reply.
    pub async fn apply_map_data(&mut self, object: &mut dyn Distributable, reply: &SubscribeReply) -> Result<()> {
        let name = self.name();
        self.core_mut().apply_map_data(object, reply, name).await
    }

    /// Apply queued versions.
    ///
    /// - `HEAD`: everything already received, without waiting
    /// - `NEXT`: wait for and apply exactly one version
    /// - a concrete version: wait until it has been applied
    ///
    /// Static objects return immediately.
    pub async fn sync(&mut self, object: &mut dyn Distributable, target: Version) -> Result<Version> {
        if let Self::Static(cm) = self {
            return Ok(cm.core.version);
        }
        let name = self.name();
        let accepts = self.accepts();
        self.core_mut().sync(object, target, name, accepts).await
    }
}
