// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Input data stream: reassembles one version from received chunks.

use super::compression::{content_digest, decompress_chunk, MAX_CHUNK_PAYLOAD};
use crate::command::Command;
use crate::error::{ReplicationError, Result};
use crate::packet::{Compressor, StreamKind};
use crate::version::{ObjectId, Version};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;

/// Chunks of one version, read back as a contiguous byte stream.
///
/// Chunks are added in arrival order with [`add_data_packet`]; the stream
/// is ready once the chunk flagged `last` arrived. Reads decompress one
/// chunk at a time and release its [`Command`] as soon as it is consumed.
///
/// [`add_data_packet`]: DataIStream::add_data_packet
pub struct DataIStream {
    object_id: ObjectId,
    kind: Option<StreamKind>,
    version: Version,
    addressed: bool,
    chunks: VecDeque<Command>,
    next_sequence: u32,
    complete: bool,
    digest: Option<String>,
    current: Vec<u8>,
    position: usize,
}

impl DataIStream {
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            kind: None,
            version: Version::NONE,
            addressed: false,
            chunks: VecDeque::new(),
            next_sequence: 0,
            complete: false,
            digest: None,
            current: Vec::new(),
            position: 0,
        }
    }

    /// A ready stream over bytes already held locally.
    pub fn from_saved(object_id: ObjectId, kind: StreamKind, version: Version, payload: Vec<u8>) -> Self {
        Self {
            object_id,
            kind: Some(kind),
            version,
            addressed: true,
            chunks: VecDeque::new(),
            next_sequence: 1,
            complete: true,
            digest: None,
            current: payload,
            position: 0,
        }
    }

    /// Append the next chunk. Returns true when this chunk completed the
    /// stream.
    pub fn add_data_packet(&mut self, command: Command) -> Result<bool> {
        let header = command.header();
        let kind = header.command.stream_kind().ok_or_else(|| {
            ReplicationError::protocol(self.object_id, format!("{:?} is not a data packet", header.command))
        })?;

        if self.complete {
            return Err(ReplicationError::protocol(
                self.object_id,
                format!("chunk {} for version {} after last chunk", header.sequence, self.version),
            ));
        }
        if header.sequence != self.next_sequence {
            return Err(ReplicationError::protocol(
                self.object_id,
                format!(
                    "out of order chunk for version {}: expected sequence {}, got {}",
                    header.version, self.next_sequence, header.sequence
                ),
            ));
        }

        let expected_command = kind.command_for(header.sequence);
        if header.command != expected_command {
            return Err(ReplicationError::protocol(
                self.object_id,
                format!("chunk {} tagged {:?}, expected {:?}", header.sequence, header.command, expected_command),
            ));
        }

        let declared = usize::try_from(header.payload_len)
            .ok()
            .filter(|len| *len <= MAX_CHUNK_PAYLOAD)
            .ok_or_else(|| {
                ReplicationError::protocol(
                    self.object_id,
                    format!("chunk {} declares {} bytes, limit is {}", header.sequence, header.payload_len, MAX_CHUNK_PAYLOAD),
                )
            })?;
        if header.compressor == Compressor::None && declared != command.payload().len() {
            return Err(ReplicationError::protocol(
                self.object_id,
                format!(
                    "chunk {} declares {} bytes but carries {}",
                    header.sequence,
                    declared,
                    command.payload().len()
                ),
            ));
        }

        if self.next_sequence == 0 {
            self.kind = Some(kind);
            self.version = header.version;
            self.addressed = !header.instance_id.is_all();
        } else if self.kind != Some(kind) || self.version != header.version {
            return Err(ReplicationError::protocol(
                self.object_id,
                format!(
                    "chunk {:?}@{} does not continue stream {:?}@{}",
                    kind, header.version, self.kind, self.version
                ),
            ));
        }

        self.next_sequence += 1;
        if header.last {
            self.complete = true;
            self.digest = header.digest.clone();
        }
        self.chunks.push_back(command);
        Ok(self.complete)
    }

    /// All chunks received.
    pub fn is_ready(&self) -> bool {
        self.complete
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn kind(&self) -> Option<StreamKind> {
        self.kind
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// True when the stream was sent to one instance rather than broadcast.
    pub fn is_addressed(&self) -> bool {
        self.addressed
    }

    /// Chunks received and not yet consumed.
    pub fn queued_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Decompress and return the next unread chunk, releasing its packet.
    pub fn get_next_buffer(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(command) = self.chunks.pop_front() else {
            return Ok(None);
        };
        let header = command.header();
        let data = decompress_chunk(header.compressor, command.payload(), header.payload_len)?;
        command.release();
        Ok(Some(data))
    }

    /// The complete uncompressed payload without consuming the stream.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        let mut out = self.current[self.position..].to_vec();
        for command in &self.chunks {
            let header = command.header();
            out.extend(decompress_chunk(header.compressor, command.payload(), header.payload_len)?);
        }
        Ok(out)
    }

    /// Check the payload against the digest carried by the last chunk.
    /// Streams without a digest pass.
    pub fn verify_digest(&self) -> Result<()> {
        let Some(expected) = self.digest.as_deref() else {
            return Ok(());
        };
        let actual = content_digest(&self.payload_bytes()?);
        if actual != expected {
            return Err(ReplicationError::protocol(
                self.object_id,
                format!("digest mismatch for version {}: expected {}, got {}", self.version, expected, actual),
            ));
        }
        Ok(())
    }

    /// Unread bytes, as declared by the queued chunks.
    pub fn remaining(&self) -> usize {
        let queued = self.chunks.iter().fold(0usize, |total, c| {
            total.saturating_add(usize::try_from(c.header().payload_len).unwrap_or(usize::MAX))
        });
        (self.current.len() - self.position).saturating_add(queued)
    }

    /// Drop any unread data.
    pub fn discard(&mut self) {
        self.chunks.clear();
        self.current.clear();
        self.position = 0;
    }

    /// Make sure unread bytes are available in `current`. `wanted` is only
    /// used for the error message.
    fn fill_current(&mut self, wanted: usize) -> Result<()> {
        while self.position == self.current.len() {
            match self.get_next_buffer()? {
                Some(next) => {
                    self.current = next;
                    self.position = 0;
                }
                None => {
                    return Err(ReplicationError::StreamParse(format!(
                        "read past end of version {}: wanted {} more bytes",
                        self.version, wanted
                    )))
                }
            }
        }
        Ok(())
    }

    /// Fill `out` completely, crossing chunk boundaries as needed.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            self.fill_current(out.len() - filled)?;
            let n = (out.len() - filled).min(self.current.len() - self.position);
            out[filled..filled + n].copy_from_slice(&self.current[self.position..self.position + n]);
            filled += n;
            self.position += n;
        }
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ReplicationError::StreamParse(format!("invalid bool byte {other:#04x}"))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Length-prefixed byte string.
    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u64()?;
        let remaining = self.remaining();
        if len > remaining as u64 {
            return Err(ReplicationError::StreamParse(format!(
                "blob length {} exceeds remaining {} bytes",
                len, remaining
            )));
        }
        // Grow with the chunks actually decoded, not the declared length.
        let len = len as usize;
        let mut data = Vec::with_capacity(len.min(self.current.len() - self.position));
        while data.len() < len {
            self.fill_current(len - data.len())?;
            let n = (len - data.len()).min(self.current.len() - self.position);
            data.extend_from_slice(&self.current[self.position..self.position + n]);
            self.position += n;
        }
        Ok(data)
    }

    pub fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_blob()?)
            .map_err(|e| ReplicationError::StreamParse(format!("invalid utf-8 string: {}", e)))
    }

    /// A value written with `DataOStream::write_value`.
    pub fn read_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_blob()?;
        bincode::deserialize(&bytes)
            .map_err(|e| ReplicationError::StreamParse(format!("value decode: {}", e)))
    }
}

impl std::fmt::Debug for DataIStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataIStream")
            .field("object_id", &self.object_id)
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("addressed", &self.addressed)
            .field("complete", &self.complete)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}
