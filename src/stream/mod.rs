// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data streams: one logical object version as a sequence of chunks.
//!
//! ```text
//!  master                                       slave
//!  ──────                                       ─────
//!  get_instance_data / pack                     apply_instance_data / unpack
//!        │                                             ▲
//!        ▼                                             │ typed reads
//!  DataOStream ── chunk 0 ── chunk 1 ── last ──▶ DataIStream
//!   (buffer, compress per chunk,                 (Command queue, strict
//!    send to every destination)                   sequence, ready on last)
//! ```
//!
//! The receiver does not know how many chunks a version has; completion is
//! signalled by the `last` flag on the final chunk.

mod compression;
mod istream;
mod ostream;

pub use crate::packet::StreamKind;
pub use compression::{compress_chunk, content_digest, decompress_chunk, MAX_CHUNK_PAYLOAD};
pub use istream::DataIStream;
pub use ostream::{send_saved, DataOStream, StreamTarget};
