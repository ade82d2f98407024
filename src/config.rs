//! Configuration for the replication core.
//!
//! Configuration is passed to [`LocalNode::start()`](crate::LocalNode::start)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use object_replication::config::ReplicationConfig;
//!
//! let mut config = ReplicationConfig::for_testing("render-1");
//! config.history.auto_obsolete = Some(4);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_node_id: String
//! ├── stream: StreamConfig              # chunking, compression, digests
//! ├── history: HistoryConfig            # master-side retained versions
//! ├── command_cache: CommandCacheConfig # inbound packet buffer pool
//! ├── instance_cache: InstanceCacheConfig
//! └── sync: SyncConfig                  # commit / map timeouts
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_node_id: "render-node-1"
//!
//! stream:
//!   chunk_size: 65536
//!   compression_enabled: true
//!   compression_level: 3
//!
//! history:
//!   auto_obsolete: 8
//!
//! sync:
//!   commit_timeout: "10s"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `LocalNode::start()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// The identity of the local node. Written into the `source` of every
    /// outbound packet.
    pub local_node_id: String,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub command_cache: CommandCacheConfig,

    #[serde(default)]
    pub instance_cache: InstanceCacheConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local_node_id: "local.dev.node.default".to_string(),
            stream: StreamConfig::default(),
            history: HistoryConfig::default(),
            command_cache: CommandCacheConfig::default(),
            instance_cache: InstanceCacheConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing: small chunks so multi-chunk
    /// paths are exercised, short timeouts.
    pub fn for_testing(local_node_id: &str) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            stream: StreamConfig::for_testing(),
            history: HistoryConfig::default(),
            command_cache: CommandCacheConfig::default(),
            instance_cache: InstanceCacheConfig::default(),
            sync: SyncConfig::for_testing(),
        }
    }

    /// Parse a JSON config document and validate it.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| crate::error::ReplicationError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the stream and history code cannot work with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::ReplicationError;
        if self.local_node_id.is_empty() {
            return Err(ReplicationError::Config("local_node_id is empty".to_string()));
        }
        if self.stream.chunk_size == 0 {
            return Err(ReplicationError::Config("stream.chunk_size must be positive".to_string()));
        }
        if self.stream.chunk_size > crate::stream::MAX_CHUNK_PAYLOAD {
            return Err(ReplicationError::Config(format!(
                "stream.chunk_size {} exceeds {}",
                self.stream.chunk_size,
                crate::stream::MAX_CHUNK_PAYLOAD
            )));
        }
        if humantime::parse_duration(&self.sync.commit_timeout).is_err() {
            return Err(ReplicationError::Config(format!(
                "sync.commit_timeout {:?} is not a duration",
                self.sync.commit_timeout
            )));
        }
        if humantime::parse_duration(&self.sync.map_timeout).is_err() {
            return Err(ReplicationError::Config(format!(
                "sync.map_timeout {:?} is not a duration",
                self.sync.map_timeout
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StreamConfig: chunking and compression
// ═══════════════════════════════════════════════════════════════════════════════

/// Outbound data stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Payload bytes buffered before a chunk is emitted.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Compress chunks with zstd when it makes them smaller.
    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    /// zstd compression level.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Chunks smaller than this are sent uncompressed.
    #[serde(default = "default_min_compress_size")]
    pub min_compress_size: usize,

    /// Attach a SHA-256 digest of the full payload to the last chunk.
    #[serde(default = "default_false")]
    pub checksum: bool,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_compression_level() -> i32 {
    3
}

fn default_min_compress_size() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            compression_enabled: true,
            compression_level: 3,
            min_compress_size: 256,
            checksum: false,
        }
    }
}

impl StreamConfig {
    pub fn for_testing() -> Self {
        Self {
            chunk_size: 64,
            compression_enabled: true,
            compression_level: 1,
            min_compress_size: 32,
            checksum: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HistoryConfig: retained instance data on masters
// ═══════════════════════════════════════════════════════════════════════════════

/// Master-side version history settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Number of commits to retain behind the head for late subscribers.
    /// `None` keeps every version (unbounded growth).
    #[serde(default)]
    pub auto_obsolete: Option<u32>,

    /// Maximum evicted instance data entries kept for reuse.
    #[serde(default = "default_max_free_instance_data")]
    pub max_free_instance_data: usize,
}

fn default_max_free_instance_data() -> usize {
    16
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            auto_obsolete: None,
            max_free_instance_data: 16,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CommandCacheConfig: inbound buffer pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Receive buffer pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCacheConfig {
    /// Released buffers kept per size class.
    #[serde(default = "default_max_buffers_per_class")]
    pub max_buffers_per_class: usize,

    /// Smallest size class in bytes (rounded up to a power of two).
    #[serde(default = "default_min_class_size")]
    pub min_class_size: usize,
}

fn default_max_buffers_per_class() -> usize {
    64
}

fn default_min_class_size() -> usize {
    256
}

impl Default for CommandCacheConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_class: 64,
            min_class_size: 256,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InstanceCacheConfig: slave-side snapshot cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Slave-side instance data cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCacheConfig {
    /// Retain received instance snapshots so later mappings can skip them.
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Snapshots kept per object (oldest dropped first).
    #[serde(default = "default_max_versions_per_object")]
    pub max_versions_per_object: usize,
}

fn default_max_versions_per_object() -> usize {
    8
}

impl Default for InstanceCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_versions_per_object: 8,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncConfig: blocking call timeouts
// ═══════════════════════════════════════════════════════════════════════════════

/// Timeouts for calls that wait on the command task or a remote master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long `commit_sync` waits for the command task, e.g. "30s".
    #[serde(default = "default_timeout")]
    pub commit_timeout: String,

    /// How long `map_object` waits for the master's reply, e.g. "30s".
    #[serde(default = "default_timeout")]
    pub map_timeout: String,
}

fn default_timeout() -> String {
    "30s".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            commit_timeout: "30s".to_string(),
            map_timeout: "30s".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            commit_timeout: "5s".to_string(),
            map_timeout: "5s".to_string(),
        }
    }

    /// Parse the commit timeout, falling back to 30 seconds.
    pub fn commit_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.commit_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the map timeout, falling back to 30 seconds.
    pub fn map_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.map_timeout).unwrap_or(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
