// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master-side change managers.
//!
//! All of these run on the command task only. The application reaches them
//! through `MasterObject`, which marshals commits onto that task.

use super::slaves::SlaveSet;
use super::CmContext;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::object::Distributable;
use crate::packet::{CommandType, PacketHeader, StreamKind, SubscribeReply, SubscribeRequest};
use crate::stream::{send_saved, DataOStream, StreamTarget};
use crate::transport::send_control;
use crate::version::{ChangeType, NodeId, Version};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info, instrument, trace};

/// One retained version of a buffered master.
#[derive(Debug, Default)]
pub struct InstanceData {
    pub version: Version,
    /// Master commit counter when this version was produced.
    pub commit_count: u32,
    /// Full serialized state at `version`.
    pub instance: Vec<u8>,
    /// Changes from the previous version, delta masters only.
    pub delta: Option<Vec<u8>>,
}

/// Oldest-first run of retained versions plus a free-list of evicted
/// entries whose buffers get reused by later commits.
#[derive(Debug)]
struct History {
    entries: VecDeque<InstanceData>,
    free: Vec<InstanceData>,
    max_free: usize,
    auto_obsolete: Option<u32>,
}

impl History {
    fn new(auto_obsolete: Option<u32>, max_free: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            free: Vec::new(),
            max_free,
            auto_obsolete,
        }
    }

    fn take_free(&mut self) -> InstanceData {
        self.free.pop().unwrap_or_default()
    }

    fn recycle(&mut self, mut data: InstanceData) {
        if self.free.len() < self.max_free {
            data.instance.clear();
            if let Some(delta) = data.delta.as_mut() {
                delta.clear();
            }
            self.free.push(data);
        }
    }

    fn oldest(&self) -> Version {
        self.entries.front().map_or(Version::NONE, |d| d.version)
    }

    fn head(&self) -> Version {
        self.entries.back().map_or(Version::NONE, |d| d.version)
    }

    /// Evict entries produced more than `auto_obsolete` commits ago.
    fn apply_auto_obsolete(&mut self, commit_count: u32) -> usize {
        let Some(keep) = self.auto_obsolete else {
            return 0;
        };
        let mut evicted = 0;
        while self.entries.len() > 1 {
            let front = &self.entries[0];
            if u64::from(front.commit_count) + u64::from(keep) > u64::from(commit_count) {
                break;
            }
            if let Some(data) = self.entries.pop_front() {
                self.recycle(data);
                evicted += 1;
            }
        }
        evicted
    }

    /// Evict every entry older than `version`, never the head.
    fn obsolete_below(&mut self, version: Version) -> usize {
        let mut evicted = 0;
        while self.entries.len() > 1 && self.entries[0].version < version {
            if let Some(data) = self.entries.pop_front() {
                self.recycle(data);
                evicted += 1;
            }
        }
        evicted
    }
}

fn version_marker(ctx: &CmContext, node: &NodeId, request: &SubscribeRequest, version: Version) -> Result<()> {
    let header = PacketHeader::control(
        ctx.transport.local_id().clone(),
        ctx.object_id,
        request.instance_id,
        CommandType::ObjectVersion,
        version,
    );
    send_control::<()>(ctx.transport.as_ref(), node, &header, None)
}

/// Serialize the current full state without sending it.
fn snapshot(os: &mut DataOStream, version: Version, object: &dyn Distributable) -> Result<Vec<u8>> {
    os.enable(StreamKind::Instance, version, Vec::new(), true);
    let written = object.get_instance_data(os);
    let payload = os.disable()?.unwrap_or_default();
    written.map(|()| payload)
}

/// Send the current full state to one subscriber instance, labelled
/// `version`. Returns the payload size.
fn send_snapshot(
    ctx: &CmContext,
    os: &mut DataOStream,
    node: &NodeId,
    request: &SubscribeRequest,
    version: Version,
    object: &dyn Distributable,
) -> Result<usize> {
    let payload = snapshot(os, version, object)?;
    let target = [StreamTarget::new(node.clone(), request.instance_id)];
    send_saved(
        ctx.transport.as_ref(),
        &ctx.stream,
        ctx.object_id,
        StreamKind::Instance,
        version,
        &payload,
        &target,
    )?;
    Ok(payload.len())
}

/// State shared by the two history-keeping masters.
struct BufferedCore {
    ctx: CmContext,
    version: Version,
    commit_count: u32,
    history: History,
    slaves: SlaveSet,
    instance_os: DataOStream,
}

impl BufferedCore {
    fn new(ctx: CmContext) -> Self {
        let history = History::new(ctx.history.auto_obsolete, ctx.history.max_free_instance_data);
        let instance_os = DataOStream::new(ctx.stream.clone(), ctx.transport.clone(), ctx.object_id);
        Self {
            ctx,
            version: Version::NONE,
            commit_count: 0,
            history,
            slaves: SlaveSet::new(),
            instance_os,
        }
    }

    fn finish_commit(&mut self, mut data: InstanceData, minted: bool, next: Version) {
        if minted {
            data.version = next;
            data.commit_count = self.commit_count;
            self.history.entries.push_back(data);
            self.version = next;
        } else {
            self.history.recycle(data);
        }
        let evicted = self.history.apply_auto_obsolete(self.commit_count);
        metrics::record_obsoleted(evicted);
        metrics::set_history_depth(&self.ctx.object_id.to_string(), self.history.entries.len());
        if minted {
            debug!(
                object_id = %self.ctx.object_id,
                version = %self.version,
                evicted,
                retained = self.history.entries.len(),
                "Committed new version"
            );
        } else {
            trace!(object_id = %self.ctx.object_id, version = %self.version, "Commit wrote no data");
        }
    }

    fn resolve_start(&self, requested: Version) -> Result<Version> {
        let oldest = self.history.oldest();
        let head = self.history.head();
        match requested {
            Version::OLDEST | Version::NONE => Ok(oldest),
            Version::HEAD => Ok(head),
            Version::NEXT | Version::INVALID => Err(ReplicationError::protocol(
                self.ctx.object_id,
                format!("cannot subscribe at {}", requested),
            )),
            v if v > head => Err(ReplicationError::protocol(
                self.ctx.object_id,
                format!("requested version {} is newer than head {}", v, head),
            )),
            v => Ok(v.max(oldest)),
        }
    }

    /// Replay retained history to a new subscriber instance, then count it
    /// as subscribed. With `deltas`, versions after the first go as deltas.
    /// Before the first commit the current state goes out labelled NONE.
    fn add_slave(
        &mut self,
        node: &NodeId,
        request: &SubscribeRequest,
        object: &dyn Distributable,
        change_type: ChangeType,
        deltas: bool,
    ) -> Result<SubscribeReply> {
        if self.version == Version::NONE {
            version_marker(&self.ctx, node, request, Version::NONE)?;
            let bytes = send_snapshot(&self.ctx, &mut self.instance_os, node, request, Version::NONE, object)?;
            self.slaves.add(node);
            metrics::set_subscribed_nodes(&self.ctx.object_id.to_string(), self.slaves.len());
            info!(object_id = %self.ctx.object_id, peer_id = %node, bytes, "Slave subscribed before first commit");
            return Ok(SubscribeReply::accepted(Version::NONE, None, change_type));
        }

        let start = self.resolve_start(request.requested_version)?;
        let head = self.history.head();
        let skip = request.cached.and_then(|(min, max)| {
            let lo = min.max(start);
            let hi = max.min(head);
            (lo <= hi).then_some((lo, hi))
        });

        let target = [StreamTarget::new(node.clone(), request.instance_id)];
        let mut replayed = 0usize;
        for data in self.history.entries.iter().filter(|d| d.version >= start) {
            if skip.is_some_and(|(lo, hi)| data.version >= lo && data.version <= hi) {
                continue;
            }
            let (kind, payload) = match (&data.delta, deltas && data.version != start) {
                (Some(delta), true) => (StreamKind::Delta, delta.as_slice()),
                _ => (StreamKind::Instance, data.instance.as_slice()),
            };
            send_saved(
                self.ctx.transport.as_ref(),
                &self.ctx.stream,
                self.ctx.object_id,
                kind,
                data.version,
                payload,
                &target,
            )?;
            replayed += 1;
        }

        self.slaves.add(node);
        metrics::set_subscribed_nodes(&self.ctx.object_id.to_string(), self.slaves.len());
        info!(
            object_id = %self.ctx.object_id,
            peer_id = %node,
            instance_id = %request.instance_id,
            requested = %request.requested_version,
            start = %start,
            head = %head,
            replayed,
            skipped = ?skip,
            "Slave subscribed"
        );
        Ok(SubscribeReply::accepted(start, skip, change_type))
    }

    fn remove_slave(&mut self, node: &NodeId) {
        if self.slaves.remove(node) {
            info!(object_id = %self.ctx.object_id, peer_id = %node, "Last slave on node unsubscribed");
        }
        metrics::set_subscribed_nodes(&self.ctx.object_id.to_string(), self.slaves.len());
    }

    fn obsolete(&mut self, version: Version) {
        let evicted = self.history.obsolete_below(version);
        if evicted > 0 {
            debug!(object_id = %self.ctx.object_id, below = %version, evicted, "Obsoleted versions");
        }
        metrics::record_obsoleted(evicted);
        metrics::set_history_depth(&self.ctx.object_id.to_string(), self.history.entries.len());
    }

    fn set_auto_obsolete(&mut self, count: u32) {
        self.history.auto_obsolete = Some(count);
        let evicted = self.history.apply_auto_obsolete(self.commit_count);
        metrics::record_obsoleted(evicted);
    }
}

/// Master of a STATIC object. Never commits; subscribers get one snapshot
/// at [`Version::FIRST`].
pub struct StaticMasterCm {
    ctx: CmContext,
    slaves: SlaveSet,
    os: DataOStream,
}

impl StaticMasterCm {
    pub fn new(ctx: CmContext) -> Self {
        let os = DataOStream::new(ctx.stream.clone(), ctx.transport.clone(), ctx.object_id);
        Self {
            ctx,
            slaves: SlaveSet::new(),
            os,
        }
    }

    fn add_slave(&mut self, node: &NodeId, request: &SubscribeRequest, object: &dyn Distributable) -> Result<SubscribeReply> {
        let bytes = send_snapshot(&self.ctx, &mut self.os, node, request, Version::FIRST, object)?;
        self.slaves.add(node);
        info!(object_id = %self.ctx.object_id, peer_id = %node, bytes, "Static slave mapped");
        Ok(SubscribeReply::accepted(Version::FIRST, None, ChangeType::Static))
    }
}

/// Master of an INSTANCE object: every commit sends and retains full state.
pub struct FullMasterCm {
    core: BufferedCore,
}

impl FullMasterCm {
    pub fn new(ctx: CmContext) -> Self {
        Self {
            core: BufferedCore::new(ctx),
        }
    }

    fn commit(&mut self, object: &mut dyn Distributable) -> Result<Version> {
        let started = Instant::now();
        let core = &mut self.core;
        core.commit_count += 1;
        let next = core.version.next();

        let mut data = core.history.take_free();
        core.instance_os.set_save_buffer(std::mem::take(&mut data.instance));
        core.instance_os.enable(StreamKind::Instance, next, core.slaves.targets(), true);
        let written = object.get_instance_data(&mut core.instance_os);
        data.instance = core.instance_os.disable()?.unwrap_or_default();
        let minted = core.instance_os.has_sent_data();

        core.finish_commit(data, minted, next);
        metrics::record_commit("Full", minted, started.elapsed());
        written?;
        Ok(core.version)
    }
}

/// Master of a DELTA object: sends deltas, retains a snapshot and the delta
/// of every version.
pub struct DeltaMasterCm {
    core: BufferedCore,
    delta_os: DataOStream,
}

impl DeltaMasterCm {
    pub fn new(ctx: CmContext) -> Self {
        let delta_os = DataOStream::new(ctx.stream.clone(), ctx.transport.clone(), ctx.object_id);
        Self {
            core: BufferedCore::new(ctx),
            delta_os,
        }
    }

    fn commit(&mut self, object: &mut dyn Distributable) -> Result<Version> {
        let started = Instant::now();
        let core = &mut self.core;
        core.commit_count += 1;
        let next = core.version.next();

        let mut data = core.history.take_free();
        self.delta_os.set_save_buffer(data.delta.take().unwrap_or_default());
        self.delta_os.enable(StreamKind::Delta, next, core.slaves.targets(), true);
        let packed = object.pack(&mut self.delta_os);
        let delta = self.delta_os.disable()?.unwrap_or_default();
        let minted = self.delta_os.has_sent_data();

        let mut snapshotted = Ok(());
        if minted {
            core.instance_os.set_save_buffer(std::mem::take(&mut data.instance));
            core.instance_os.enable(StreamKind::Instance, next, Vec::new(), true);
            snapshotted = object.get_instance_data(&mut core.instance_os);
            data.instance = core.instance_os.disable()?.unwrap_or_default();
        }
        data.delta = Some(delta);

        core.finish_commit(data, minted, next);
        metrics::record_commit("Delta", minted, started.elapsed());
        packed?;
        snapshotted?;
        Ok(core.version)
    }
}

/// Master of an UNBUFFERED object: deltas only, no history.
pub struct UnbufferedMasterCm {
    ctx: CmContext,
    version: Version,
    slaves: SlaveSet,
    delta_os: DataOStream,
    snapshot_os: DataOStream,
}

impl UnbufferedMasterCm {
    pub fn new(ctx: CmContext) -> Self {
        let delta_os = DataOStream::new(ctx.stream.clone(), ctx.transport.clone(), ctx.object_id);
        let snapshot_os = DataOStream::new(ctx.stream.clone(), ctx.transport.clone(), ctx.object_id);
        Self {
            ctx,
            version: Version::NONE,
            slaves: SlaveSet::new(),
            delta_os,
            snapshot_os,
        }
    }

    fn commit(&mut self, object: &mut dyn Distributable) -> Result<Version> {
        let started = Instant::now();
        let next = self.version.next();
        self.delta_os.enable(StreamKind::Delta, next, self.slaves.targets(), false);
        let packed = object.pack(&mut self.delta_os);
        self.delta_os.disable()?;
        let minted = self.delta_os.has_sent_data();
        if minted {
            self.version = next;
        }
        metrics::record_commit("Unbuffered", minted, started.elapsed());
        packed?;
        Ok(self.version)
    }

    fn add_slave(&mut self, node: &NodeId, request: &SubscribeRequest, object: &dyn Distributable) -> Result<SubscribeReply> {
        if self.version == Version::NONE {
            version_marker(&self.ctx, node, request, Version::NONE)?;
        }
        let bytes = send_snapshot(&self.ctx, &mut self.snapshot_os, node, request, self.version, object)?;
        self.slaves.add(node);
        metrics::set_subscribed_nodes(&self.ctx.object_id.to_string(), self.slaves.len());
        info!(object_id = %self.ctx.object_id, peer_id = %node, version = %self.version, bytes, "Unbuffered slave subscribed");
        Ok(SubscribeReply::accepted(self.version, None, ChangeType::Unbuffered))
    }
}

/// Master change manager, chosen once from the object's [`ChangeType`].
pub enum MasterChangeManager {
    Static(StaticMasterCm),
    Full(FullMasterCm),
    Delta(DeltaMasterCm),
    Unbuffered(UnbufferedMasterCm),
}

impl MasterChangeManager {
    pub fn new(change_type: ChangeType, ctx: CmContext) -> Self {
        match change_type {
            ChangeType::Static => Self::Static(StaticMasterCm::new(ctx)),
            ChangeType::Instance => Self::Full(FullMasterCm::new(ctx)),
            ChangeType::Delta => Self::Delta(DeltaMasterCm::new(ctx)),
            ChangeType::Unbuffered => Self::Unbuffered(UnbufferedMasterCm::new(ctx)),
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            Self::Static(_) => ChangeType::Static,
            Self::Full(_) => ChangeType::Instance,
            Self::Delta(_) => ChangeType::Delta,
            Self::Unbuffered(_) => ChangeType::Unbuffered,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Static(_) => "StaticMasterCM",
            Self::Full(_) => "FullMasterCM",
            Self::Delta(_) => "DeltaMasterCM",
            Self::Unbuffered(_) => "UnbufferedMasterCM",
        }
    }

    /// Serialize and distribute the object's changes. Mints a new version
    /// only if the serializer wrote something; otherwise returns the
    /// current version.
    #[instrument(level = "debug", skip_all, fields(cm = self.name()))]
    pub fn commit(&mut self, object: &mut dyn Distributable) -> Result<Version> {
        match self {
            Self::Static(_) => Err(ReplicationError::IllegalOperation(
                "commit on a static object".to_string(),
            )),
            Self::Full(cm) => cm.commit(object),
            Self::Delta(cm) => cm.commit(object),
            Self::Unbuffered(cm) => cm.commit(object),
        }
    }

    /// Bring a new slave instance up to date and subscribe its node.
    #[instrument(
        level = "debug",
        skip_all,
        fields(cm = self.name(), peer_id = %node, requested = %request.requested_version)
    )]
    pub fn add_slave(
        &mut self,
        node: &NodeId,
        request: &SubscribeRequest,
        object: &dyn Distributable,
    ) -> Result<SubscribeReply> {
        match self {
            Self::Static(cm) => cm.add_slave(node, request, object),
            Self::Full(cm) => cm.core.add_slave(node, request, object, ChangeType::Instance, false),
            Self::Delta(cm) => cm.core.add_slave(node, request, object, ChangeType::Delta, true),
            Self::Unbuffered(cm) => cm.add_slave(node, request, object),
        }
    }

    pub fn remove_slave(&mut self, node: &NodeId) {
        match self {
            Self::Static(cm) => {
                cm.slaves.remove(node);
            }
            Self::Full(cm) => cm.core.remove_slave(node),
            Self::Delta(cm) => cm.core.remove_slave(node),
            Self::Unbuffered(cm) => {
                cm.slaves.remove(node);
                metrics::set_subscribed_nodes(&cm.ctx.object_id.to_string(), cm.slaves.len());
            }
        }
    }

    /// Drop retained versions older than `version`. The head is kept.
    pub fn obsolete(&mut self, version: Version) {
        match self {
            Self::Full(cm) => cm.core.obsolete(version),
            Self::Delta(cm) => cm.core.obsolete(version),
            Self::Static(_) | Self::Unbuffered(_) => {}
        }
    }

    /// Retain only versions produced within the last `count` commits,
    /// applied now and after every later commit.
    pub fn set_auto_obsolete(&mut self, count: u32) {
        match self {
            Self::Full(cm) => cm.core.set_auto_obsolete(count),
            Self::Delta(cm) => cm.core.set_auto_obsolete(count),
            Self::Static(_) | Self::Unbuffered(_) => {}
        }
    }

    pub fn auto_obsolete(&self) -> Option<u32> {
        match self {
            Self::Full(cm) => cm.core.history.auto_obsolete,
            Self::Delta(cm) => cm.core.history.auto_obsolete,
            Self::Static(_) | Self::Unbuffered(_) => None,
        }
    }

    /// Oldest version a new subscriber can start from.
    pub fn oldest_version(&self) -> Version {
        match self {
            Self::Static(_) => Version::FIRST,
            Self::Full(cm) => cm.core.history.oldest(),
            Self::Delta(cm) => cm.core.history.oldest(),
            Self::Unbuffered(cm) => cm.version,
        }
    }

    pub fn head_version(&self) -> Version {
        self.version()
    }

    pub fn version(&self) -> Version {
        match self {
            Self::Static(_) => Version::FIRST,
            Self::Full(cm) => cm.core.version,
            Self::Delta(cm) => cm.core.version,
            Self::Unbuffered(cm) => cm.version,
        }
    }

    /// Versions currently retained for replay.
    pub fn retained_versions(&self) -> Vec<Version> {
        match self {
            Self::Full(cm) => cm.core.history.entries.iter().map(|d| d.version).collect(),
            Self::Delta(cm) => cm.core.history.entries.iter().map(|d| d.version).collect(),
            Self::Static(_) => vec![Version::FIRST],
            Self::Unbuffered(cm) if cm.version == Version::NONE => Vec::new(),
            Self::Unbuffered(cm) => vec![cm.version],
        }
    }

    /// Distinct subscribed nodes.
    pub fn subscribed_nodes(&self) -> usize {
        match self {
            Self::Static(cm) => cm.slaves.len(),
            Self::Full(cm) => cm.core.slaves.len(),
            Self::Delta(cm) => cm.core.slaves.len(),
            Self::Unbuffered(cm) => cm.slaves.len(),
        }
    }
}

impl std::fmt::Debug for MasterChangeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.name())
            .field("version", &self.version())
            .field("oldest", &self.oldest_version())
            .field("subscribed_nodes", &self.subscribed_nodes())
            .finish()
    }
}
