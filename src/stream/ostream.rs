// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Output data stream.
//!
//! A [`DataOStream`] is enabled for one version, receives typed writes from
//! the application's serializer, and emits a chunk whenever its buffer
//! reaches the configured chunk size. `disable()` flushes the final chunk.
//! When saving is on, every written byte is also retained so the master can
//! replay the version to late subscribers with [`send_saved`].

use super::compression::{compress_chunk, content_digest};
use crate::config::StreamConfig;
use crate::error::Result;
use crate::metrics;
use crate::packet::{encode_frame, Compressor, PacketHeader, StreamKind};
use crate::transport::Transport;
use crate::version::{InstanceId, NodeId, ObjectId, Version};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, trace};

/// One receiver of a stream: a node and the instance addressed on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub node: NodeId,
    pub instance: InstanceId,
}

impl StreamTarget {
    pub fn new(node: NodeId, instance: InstanceId) -> Self {
        Self { node, instance }
    }

    /// Every instance of the object on `node`.
    pub fn all_on(node: NodeId) -> Self {
        Self {
            node,
            instance: InstanceId::ALL,
        }
    }
}

struct ChunkSpec<'a> {
    object_id: ObjectId,
    kind: StreamKind,
    version: Version,
    sequence: u32,
    last: bool,
    digest: Option<String>,
    data: &'a [u8],
}

/// Compress and send one chunk to every target.
///
/// A failed send is logged and counted; the remaining targets still get
/// the chunk.
fn emit_chunk(transport: &dyn Transport, config: &StreamConfig, targets: &[StreamTarget], chunk: ChunkSpec<'_>) -> Result<()> {
    if targets.is_empty() {
        return Ok(());
    }

    let compressed = compress_chunk(chunk.data, config);
    let (compressor, chunk_count, payload) = match &compressed {
        Some(bytes) => (Compressor::Zstd, 1, bytes.as_slice()),
        None => (Compressor::None, 0, chunk.data),
    };

    let mut header = PacketHeader {
        source: transport.local_id().clone(),
        object_id: chunk.object_id,
        instance_id: InstanceId::ALL,
        command: chunk.kind.command_for(chunk.sequence),
        version: chunk.version,
        sequence: chunk.sequence,
        last: chunk.last,
        compressor,
        chunk_count,
        payload_len: chunk.data.len() as u64,
        request_id: 0,
        digest: chunk.digest,
    };

    for target in targets {
        header.instance_id = target.instance;
        let frame = encode_frame(&header, payload)?;
        let wire = frame.len();
        match transport.send(&target.node, frame) {
            Ok(()) => metrics::record_chunk_sent(chunk.kind.as_str(), chunk.data.len(), wire),
            Err(e) => {
                debug!(
                    peer_id = %target.node,
                    object_id = %chunk.object_id,
                    version = %chunk.version,
                    error = %e,
                    "Chunk send failed, skipping peer"
                );
                metrics::record_send_failure(target.node.as_str());
            }
        }
    }

    trace!(
        object_id = %chunk.object_id,
        version = %chunk.version,
        kind = chunk.kind.as_str(),
        sequence = chunk.sequence,
        last = chunk.last,
        bytes = chunk.data.len(),
        compressed = compressor == Compressor::Zstd,
        targets = targets.len(),
        "Emitted chunk"
    );
    Ok(())
}

/// Replay a retained version payload to `targets`.
///
/// Always emits at least one chunk, so an empty payload still produces a
/// complete stream. Returns the number of chunks sent.
pub fn send_saved(
    transport: &dyn Transport,
    config: &StreamConfig,
    object_id: ObjectId,
    kind: StreamKind,
    version: Version,
    payload: &[u8],
    targets: &[StreamTarget],
) -> Result<u32> {
    let chunk_size = config.chunk_size.max(1);
    let digest = config.checksum.then(|| content_digest(payload));

    let mut chunks: Vec<&[u8]> = payload.chunks(chunk_size).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    let total = chunks.len();

    for (sequence, data) in chunks.into_iter().enumerate() {
        let last = sequence + 1 == total;
        emit_chunk(
            transport,
            config,
            targets,
            ChunkSpec {
                object_id,
                kind,
                version,
                sequence: sequence as u32,
                last,
                digest: if last { digest.clone() } else { None },
                data,
            },
        )?;
    }
    Ok(total as u32)
}

/// Chunking output stream bound to one object.
pub struct DataOStream {
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    object_id: ObjectId,
    kind: StreamKind,
    version: Version,
    targets: Vec<StreamTarget>,
    buffer: Vec<u8>,
    saved: Vec<u8>,
    saving: bool,
    hasher: Option<Sha256>,
    sequence: u32,
    sent_data: bool,
    enabled: bool,
}

impl DataOStream {
    pub fn new(config: StreamConfig, transport: Arc<dyn Transport>, object_id: ObjectId) -> Self {
        Self {
            config,
            transport,
            object_id,
            kind: StreamKind::Instance,
            version: Version::NONE,
            targets: Vec::new(),
            buffer: Vec::new(),
            saved: Vec::new(),
            saving: false,
            hasher: None,
            sequence: 0,
            sent_data: false,
            enabled: false,
        }
    }

    /// Hand the stream a buffer to save into, typically one recycled from
    /// evicted history. Used by the next `enable` with saving on.
    pub fn set_save_buffer(&mut self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.saved = buffer;
    }

    /// Start a new version. With no targets the stream only saves.
    pub fn enable(&mut self, kind: StreamKind, version: Version, targets: Vec<StreamTarget>, save: bool) {
        debug_assert!(!self.enabled, "enable() on an already enabled stream");
        self.kind = kind;
        self.version = version;
        self.targets = targets;
        self.saving = save;
        self.saved.clear();
        self.buffer.clear();
        self.hasher = self.config.checksum.then(Sha256::new);
        self.sequence = 0;
        self.sent_data = false;
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// True once any byte was written since the last `enable`.
    pub fn has_sent_data(&self) -> bool {
        self.sent_data
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(self.enabled, "write on a disabled stream");
        if data.is_empty() {
            return Ok(());
        }
        self.sent_data = true;
        if self.saving {
            self.saved.extend_from_slice(data);
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(data);
        }

        self.buffer.extend_from_slice(data);
        let chunk_size = self.config.chunk_size.max(1);
        if self.buffer.len() >= chunk_size {
            let full = self.buffer.len() / chunk_size * chunk_size;
            let pending: Vec<u8> = self.buffer.drain(..full).collect();
            for chunk in pending.chunks(chunk_size) {
                self.flush_chunk(chunk, false)?;
            }
        }
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_bytes(&[v])
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    /// Length-prefixed byte string.
    pub fn write_blob(&mut self, data: &[u8]) -> Result<()> {
        self.write_u64(data.len() as u64)?;
        self.write_bytes(data)
    }

    pub fn write_str(&mut self, s: &str) -> Result<()> {
        self.write_blob(s.as_bytes())
    }

    /// Any serde value, bincode-encoded and length-prefixed.
    pub fn write_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        self.write_blob(&encoded)
    }

    /// Finish the version. Emits the last chunk if anything was written and
    /// returns the saved payload when saving was on.
    pub fn disable(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.enabled {
            return Ok(None);
        }
        self.enabled = false;

        let result = if self.sent_data {
            let tail = std::mem::take(&mut self.buffer);
            let flushed = self.flush_chunk(&tail, true);
            self.buffer = tail;
            self.buffer.clear();
            flushed
        } else {
            Ok(())
        };
        self.targets.clear();
        self.hasher = None;

        let saved = self.saving.then(|| std::mem::take(&mut self.saved));
        self.saving = false;
        result.map(|()| saved)
    }

    fn flush_chunk(&mut self, data: &[u8], last: bool) -> Result<()> {
        let digest = if last {
            self.hasher.take().map(|h| hex::encode(h.finalize()))
        } else {
            None
        };
        let spec = ChunkSpec {
            object_id: self.object_id,
            kind: self.kind,
            version: self.version,
            sequence: self.sequence,
            last,
            digest,
            data,
        };
        self.sequence += 1;
        emit_chunk(self.transport.as_ref(), &self.config, &self.targets, spec)
    }
}

impl std::fmt::Debug for DataOStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataOStream")
            .field("object_id", &self.object_id)
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("enabled", &self.enabled)
            .field("sequence", &self.sequence)
            .field("targets", &self.targets.len())
            .finish()
    }
}
