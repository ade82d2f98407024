// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire packets exchanged between master and slave change managers.
//!
//! # Frame Layout
//!
//! ```text
//! ┌──────────────┬─────────────────────────────┬──────────────────────┐
//! │ header_len   │ PacketHeader (bincode)      │ payload              │
//! │ u32 LE       │ header_len bytes            │ rest of frame        │
//! └──────────────┴─────────────────────────────┴──────────────────────┘
//! ```
//!
//! The payload of a data packet is one chunk of a serialized version,
//! possibly zstd-compressed (see [`Compressor`]). The payload of a control
//! packet is a bincode-encoded body such as [`SubscribeRequest`].
//!
//! Decoding never panics on malformed input; it returns
//! [`ReplicationError::StreamParse`].

use crate::error::{ReplicationError, Result};
use crate::version::{ChangeType, InstanceId, NodeId, ObjectId, Version};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Upper bound on an encoded header. Protects the decoder from absurd
/// length prefixes in corrupted frames.
pub const MAX_HEADER_LEN: usize = 4096;

/// Packet command tags relevant to object replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    /// Chunk of full instance data.
    ObjectInstance,
    /// First chunk of a delta.
    ObjectDelta,
    /// Continuation chunk of a delta.
    ObjectDeltaData,
    /// Master-local commit trigger, carries a request id.
    ObjectCommit,
    /// Slave bootstrap: "you are now at version V with no data".
    ObjectVersion,
    /// Slave asks the master to add it as a subscriber.
    ObjectSubscribe,
    /// Master finished replaying history to a new subscriber.
    ObjectSubscribeReply,
    /// Slave instance detached.
    ObjectUnsubscribe,
}

impl CommandType {
    /// The stream kind carried by a data packet, `None` for control packets.
    pub fn stream_kind(self) -> Option<StreamKind> {
        match self {
            CommandType::ObjectInstance => Some(StreamKind::Instance),
            CommandType::ObjectDelta | CommandType::ObjectDeltaData => Some(StreamKind::Delta),
            _ => None,
        }
    }

    pub fn is_data(self) -> bool {
        self.stream_kind().is_some()
    }
}

/// What a data stream contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Full object state, applied with `apply_instance_data`.
    Instance,
    /// Changes since the previous version, applied with `unpack`.
    Delta,
}

impl StreamKind {
    /// Command tag for the chunk at `sequence` of a stream of this kind.
    pub fn command_for(self, sequence: u32) -> CommandType {
        match (self, sequence) {
            (StreamKind::Instance, _) => CommandType::ObjectInstance,
            (StreamKind::Delta, 0) => CommandType::ObjectDelta,
            (StreamKind::Delta, _) => CommandType::ObjectDeltaData,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Instance => "Instance",
            StreamKind::Delta => "Delta",
        }
    }
}

/// Payload compression applied to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compressor {
    None,
    Zstd,
}

/// Fixed header carried by every packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Sending node.
    pub source: NodeId,
    pub object_id: ObjectId,
    /// Target instance on the receiving node, or [`InstanceId::ALL`].
    pub instance_id: InstanceId,
    pub command: CommandType,
    pub version: Version,
    /// Chunk index within one version's stream, starting at 0.
    pub sequence: u32,
    /// Set on the final chunk of a version.
    pub last: bool,
    pub compressor: Compressor,
    /// Compressed blocks in the payload (0 when uncompressed).
    pub chunk_count: u32,
    /// Uncompressed payload length.
    pub payload_len: u64,
    /// Commit request id for `ObjectCommit`, 0 otherwise.
    pub request_id: u32,
    /// Hex SHA-256 of the full uncompressed version payload, last chunk only.
    pub digest: Option<String>,
}

impl PacketHeader {
    /// Header for a control packet with default data fields.
    pub fn control(
        source: NodeId,
        object_id: ObjectId,
        instance_id: InstanceId,
        command: CommandType,
        version: Version,
    ) -> Self {
        Self {
            source,
            object_id,
            instance_id,
            command,
            version,
            sequence: 0,
            last: true,
            compressor: Compressor::None,
            chunk_count: 0,
            payload_len: 0,
            request_id: 0,
            digest: None,
        }
    }
}

fn header_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_HEADER_LEN as u64)
}

/// Encode a header and payload into one frame.
pub fn encode_frame(header: &PacketHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let encoded = header_codec().serialize(header)?;
    let mut frame = Vec::with_capacity(4 + encoded.len() + payload.len());
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(&encoded);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode the header of a frame.
///
/// Returns the header and the offset at which the payload starts.
pub fn decode_header(frame: &[u8]) -> Result<(PacketHeader, usize)> {
    if frame.len() < 4 {
        return Err(ReplicationError::StreamParse(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let header_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(ReplicationError::StreamParse(format!(
            "header length {} exceeds {}",
            header_len, MAX_HEADER_LEN
        )));
    }
    let end = 4 + header_len;
    if frame.len() < end {
        return Err(ReplicationError::StreamParse(format!(
            "truncated header: need {} bytes, have {}",
            end,
            frame.len()
        )));
    }
    let header: PacketHeader = header_codec()
        .deserialize(&frame[4..end])
        .map_err(|e| ReplicationError::StreamParse(format!("header decode: {}", e)))?;
    Ok((header, end))
}

/// Subscription request sent by a slave to the master node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Instance id of the slave object on the requesting node.
    pub instance_id: InstanceId,
    /// First version wanted: a concrete version, `OLDEST`, or `HEAD`.
    pub requested_version: Version,
    /// Versions the requester already holds locally (inclusive range).
    pub cached: Option<(Version, Version)>,
}

/// Reply to a [`SubscribeRequest`], sent after all replayed data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeReply {
    /// Version the slave must apply as its map data.
    pub start_version: Version,
    /// Subrange the master skipped; the slave reads it from its cache.
    pub cached: Option<(Version, Version)>,
    /// Change type of the master, checked by the slave.
    pub change_type: Option<ChangeType>,
    /// Set when the subscription was refused.
    pub error: Option<String>,
}

impl SubscribeReply {
    pub fn accepted(start_version: Version, cached: Option<(Version, Version)>, change_type: ChangeType) -> Self {
        Self {
            start_version,
            cached,
            change_type: Some(change_type),
            error: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            start_version: Version::INVALID,
            cached: None,
            change_type: None,
            error: Some(message.into()),
        }
    }
}

/// Encode a control body.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(body)?)
}

/// Decode a control body.
pub fn decode_body<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload)
        .map_err(|e| ReplicationError::StreamParse(format!("control body decode: {}", e)))
}
