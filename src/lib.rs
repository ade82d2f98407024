//! # Object Replication
//!
//! Master/slave versioning of distributed objects for cluster applications.
//!
//! ## Architecture
//!
//! One node owns the master copy of an object and commits new versions;
//! other nodes map slave copies and apply those versions in order:
//!
//! ```text
//! ┌──────────────────────── master node ────────────────────────┐
//! │  MasterObject<T> ──commit──▶ MasterChangeManager             │
//! │                               │ history: v1 v2 v3 ...        │
//! │                               │ SlaveSet (per-node refcount) │
//! │                               ▼                              │
//! │                          DataOStream (chunk, zstd, digest)   │
//! └───────────────────────────────┬─────────────────────────────┘
//!                                 │ frames over Transport
//! ┌───────────────────────────────▼───── slave node ────────────┐
//! │  receiver task ─▶ CommandCache ─▶ command task ─▶ SlaveQueue │
//! │                                                   │          │
//! │  SlaveObject<T>::sync(v) ◀── SlaveChangeManager ◀─┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Change Types
//!
//! - **Static**: never changes after mapping.
//! - **Instance**: every version is a full snapshot.
//! - **Delta**: versions are deltas; history keeps full snapshots for late
//!   subscribers.
//! - **Unbuffered**: deltas with no history; new subscribers get the current
//!   state.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use object_replication::{
//!     ChangeType, DataIStream, DataOStream, Distributable, LocalNode, LoopbackNetwork,
//!     ReplicationConfig, Result, Version,
//! };
//!
//! struct Score(u64);
//!
//! impl Distributable for Score {
//!     fn change_type(&self) -> ChangeType {
//!         ChangeType::Instance
//!     }
//!     fn get_instance_data(&self, os: &mut DataOStream) -> Result<()> {
//!         os.write_u64(self.0)
//!     }
//!     fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()> {
//!         self.0 = is.read_u64()?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let network = LoopbackNetwork::new();
//!     let (t1, in1) = network.attach("app");
//!     let (t2, in2) = network.attach("render");
//!     let app = LocalNode::start(ReplicationConfig::for_testing("app"), t1, in1);
//!     let render = LocalNode::start(ReplicationConfig::for_testing("render"), t2, in2);
//!
//!     let master = app.register_object(Score(0));
//!     let mut slave = render
//!         .map_object(master.id(), app.id(), Version::OLDEST, Score(0))
//!         .await?;
//!
//!     master.with_mut(|s| s.0 = 42);
//!     let v = master.commit().await?;
//!     slave.sync(v).await?;
//!     assert_eq!(slave.get().0, 42);
//!
//!     render.shutdown().await;
//!     app.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod change_manager;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod instance_cache;
pub mod metrics;
pub mod node;
pub mod object;
pub mod packet;
pub mod stream;
pub mod transport;
pub mod version;

// Re-exports for convenience
pub use command::{CacheStats, Command, CommandCache};
pub use config::{
    CommandCacheConfig, HistoryConfig, InstanceCacheConfig, ReplicationConfig, StreamConfig, SyncConfig,
};
pub use error::{ReplicationError, Result};
pub use instance_cache::InstanceCache;
pub use node::{LocalNode, NodeState};
pub use object::{Distributable, MasterObject, SlaveObject};
pub use packet::{CommandType, StreamKind};
pub use stream::{DataIStream, DataOStream};
pub use transport::{LoopbackNetwork, Transport};
pub use version::{ChangeType, InstanceId, NodeId, ObjectId, RequestId, Version};
