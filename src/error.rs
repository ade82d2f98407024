// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the object replication core.
//!
//! Errors are categorized by where they originate (transport, wire decoding,
//! protocol state) and carry enough context to identify the object involved.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Protocol violation | Description |
//! |------------|-----------|--------------------|-------------|
//! | `PeerConnection` | Yes | No | Transport could not deliver a frame |
//! | `Protocol` | No | Yes | Gapped/reordered version, sync backwards, wrong stream kind |
//! | `IllegalOperation` | No | Yes | Commit on a static object or on a slave |
//! | `Decompression` | No | No | Chunk payload failed to decompress |
//! | `StreamParse` | No | No | Malformed frame, chunk sequence error, short read |
//! | `Serialization` | No | No | bincode encode/decode failure |
//! | `UnknownObject` | No | No | No registered instance for an object id |
//! | `Config` | No | No | Configuration invalid |
//! | `InvalidState` | No | No | Operation attempted in the wrong lifecycle state |
//! | `Timeout` | Yes | No | Commit or map reply did not arrive in time |
//! | `Shutdown` | No | No | Node is shutting down |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! # Protocol Violations
//!
//! A protocol violation means the transport or this crate itself misbehaved
//! (a version was lost or delivered out of order). They are returned to the
//! caller and logged at `error` level; the library never aborts the process.
//! Use [`ReplicationError::is_protocol_violation()`] to detect them.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while versioning or replicating an object.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Version sequencing was violated.
    ///
    /// Raised when a slave dequeues a version that is not exactly
    /// `current + 1`, when `sync` targets a version older than the one
    /// already applied, or when a stream of the wrong kind reaches a
    /// change manager that cannot apply it.
    #[error("Protocol violation ({object_id}): {message}")]
    Protocol { object_id: String, message: String },

    /// Operation not permitted for this change manager.
    ///
    /// For example `commit()` on a `STATIC` object.
    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    /// Transport failed to deliver a frame to a peer.
    ///
    /// For departed subscribers this is expected and harmless.
    #[error("Peer connection error ({peer_id}): {message}")]
    PeerConnection { peer_id: String, message: String },

    /// Chunk decompression failure.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Frame or packet decoding failure, or an out-of-sequence chunk.
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// bincode encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// No object instance is registered under this identity.
    #[error("Unknown object: {0}")]
    UnknownObject(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// A commit or map reply did not arrive within the configured timeout.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Node shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a protocol violation for an object.
    pub fn protocol(object_id: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Protocol {
            object_id: object_id.to_string(),
            message: message.into(),
        }
    }

    /// Create a transport error for a peer.
    pub fn peer(peer_id: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::PeerConnection {
            peer_id: peer_id.to_string(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PeerConnection { .. } => true,
            Self::Timeout(_) => true,
            Self::Protocol { .. } => false,
            Self::IllegalOperation(_) => false,
            Self::Decompression(_) => false,
            Self::StreamParse(_) => false,
            Self::Serialization(_) => false,
            Self::UnknownObject(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error signals a bug in the transport or the protocol layer.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::IllegalOperation(_))
    }
}
