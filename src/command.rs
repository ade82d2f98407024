// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared ownership of decoded packets and the receive buffer pool.
//!
//! # Ownership Model
//!
//! A [`Command`] owns one received frame. Handles are reference counted:
//!
//! - [`Command::retain()`] produces another handle to the same packet
//! - [`Command::release()`] consumes a handle
//!
//! There is no `Clone`; every additional owner is created explicitly. Once the
//! last handle is released the frame buffer goes back to the
//! [`CommandCache`] it was allocated from. Because `release` takes `self`,
//! reading a packet after releasing it does not compile.
//!
//! # Buffer Pool
//!
//! ```text
//! receiver task                    command task / slave streams
//!      │ alloc(len)                       │
//!      ▼                                  │ last handle dropped
//! ┌──────────────┐   Command    ┌─────────┴──────┐
//! │ CommandCache │ ───────────▶ │ Command (Arc)  │
//! │  size class  │ ◀─────────── │ retain/release │
//! │  → buffers   │   recycle    └────────────────┘
//! └──────────────┘
//! ```
//!
//! Buffers are bucketed by power-of-two size class so the next packet of a
//! similar size reuses the allocation. In debug builds a recycled buffer is
//! overwritten with [`POISON_BYTE`] before it is pooled.

use crate::config::CommandCacheConfig;
use crate::error::Result;
use crate::metrics;
use crate::packet::{decode_header, CommandType, PacketHeader};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Fill pattern for released buffers in debug builds.
pub const POISON_BYTE: u8 = 0xDD;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Allocations served from a pooled buffer.
    pub hits: u64,
    /// Allocations that needed a fresh buffer.
    pub misses: u64,
    /// Buffers currently pooled across all size classes.
    pub cached: usize,
}

/// Overwrite a released buffer up to its capacity so reads of stale
/// pooled memory stand out.
#[cfg(debug_assertions)]
fn poison(buffer: &mut Vec<u8>) {
    let capacity = buffer.capacity();
    buffer.clear();
    buffer.resize(capacity, POISON_BYTE);
}

struct CacheShared {
    classes: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    max_per_class: usize,
    min_class: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheShared {
    fn recycle(&self, mut buffer: Vec<u8>) {
        let capacity = buffer.capacity();
        if capacity < self.min_class {
            return;
        }

        #[cfg(debug_assertions)]
        poison(&mut buffer);
        buffer.clear();

        // Largest power of two not above the capacity, so any request in
        // this class fits without reallocating.
        let class = 1usize << (usize::BITS - 1 - capacity.leading_zeros());
        let mut classes = self.classes.lock();
        let bucket = classes.entry(class).or_default();
        if bucket.len() < self.max_per_class {
            bucket.push(buffer);
        }
    }
}

/// Pool of receive buffers keyed by size class.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct CommandCache {
    shared: Arc<CacheShared>,
}

impl CommandCache {
    pub fn new(config: &CommandCacheConfig) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                classes: Mutex::new(HashMap::new()),
                max_per_class: config.max_buffers_per_class,
                min_class: config.min_class_size.max(1).next_power_of_two(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    fn class_for(&self, len: usize) -> usize {
        len.max(self.shared.min_class).next_power_of_two()
    }

    /// Get an empty buffer with capacity for at least `len` bytes.
    pub fn alloc(&self, len: usize) -> Vec<u8> {
        let class = self.class_for(len);
        let pooled = self
            .shared
            .classes
            .lock()
            .get_mut(&class)
            .and_then(|bucket| bucket.pop());

        match pooled {
            Some(buffer) => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_command_cache(true);
                buffer
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_command_cache(false);
                Vec::with_capacity(class)
            }
        }
    }

    /// Copy a received frame into a pooled buffer and decode its header.
    pub fn command_from_frame(&self, frame: &[u8]) -> Result<Command> {
        let mut buffer = self.alloc(frame.len());
        buffer.extend_from_slice(frame);
        Command::from_buffer(buffer, Arc::downgrade(&self.shared))
    }

    pub fn stats(&self) -> CacheStats {
        let cached = self.shared.classes.lock().values().map(Vec::len).sum();
        CacheStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            cached,
        }
    }
}

impl fmt::Debug for CommandCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCache").field("stats", &self.stats()).finish()
    }
}

struct CommandInner {
    header: PacketHeader,
    buffer: Vec<u8>,
    payload_offset: usize,
    cache: Weak<CacheShared>,
}

impl Drop for CommandInner {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.recycle(std::mem::take(&mut self.buffer));
        }
    }
}

/// Reference-counted handle to one decoded packet.
pub struct Command {
    inner: Arc<CommandInner>,
}

impl Command {
    fn from_buffer(buffer: Vec<u8>, cache: Weak<CacheShared>) -> Result<Self> {
        let (header, payload_offset) = match decode_header(&buffer) {
            Ok(decoded) => decoded,
            Err(e) => {
                if let Some(cache) = cache.upgrade() {
                    cache.recycle(buffer);
                }
                return Err(e);
            }
        };
        Ok(Self {
            inner: Arc::new(CommandInner {
                header,
                buffer,
                payload_offset,
                cache,
            }),
        })
    }

    /// Build a command that did not arrive over the transport, such as a
    /// local commit request. Its buffer is not pooled.
    pub fn local(header: PacketHeader, payload: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(CommandInner {
                header,
                buffer: payload,
                payload_offset: 0,
                cache: Weak::new(),
            }),
        }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.inner.header
    }

    pub fn command(&self) -> CommandType {
        self.inner.header.command
    }

    /// Payload bytes as received (possibly compressed).
    pub fn payload(&self) -> &[u8] {
        &self.inner.buffer[self.inner.payload_offset..]
    }

    /// Take another owning handle to this packet.
    pub fn retain(&self) -> Command {
        Command {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Give up this handle. The buffer is recycled when the last one goes.
    pub fn release(self) {
        drop(self);
    }

    /// Number of live handles to this packet.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.inner.header;
        f.debug_struct("Command")
            .field("command", &h.command)
            .field("object_id", &h.object_id)
            .field("instance_id", &h.instance_id)
            .field("version", &h.version)
            .field("sequence", &h.sequence)
            .field("last", &h.last)
            .field("payload", &self.payload().len())
            .field("refs", &self.ref_count())
            .finish()
    }
}
