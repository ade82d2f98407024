// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change managers: the versioning policy attached to each object.
//!
//! An object's [`ChangeType`](crate::version::ChangeType) selects one master and one slave variant:
//!
//! | ChangeType   | Master             | Slave               |
//! |--------------|--------------------|---------------------|
//! | `Static`     | `StaticMasterCm`   | `StaticSlaveCm`     |
//! | `Instance`   | `FullMasterCm`     | `FullSlaveCm`       |
//! | `Delta`      | `DeltaMasterCm`    | `VersionedSlaveCm`  |
//! | `Unbuffered` | `UnbufferedMasterCm` | `DeltaSlaveCm`    |
//!
//! Masters keep (or, for unbuffered objects, do not keep) a history of
//! committed versions and replay it to new subscribers. Slaves queue
//! received versions and apply them strictly in order when the application
//! calls `sync`.

mod master;
mod slave;
mod slaves;

pub use master::{
    DeltaMasterCm, FullMasterCm, InstanceData, MasterChangeManager, StaticMasterCm, UnbufferedMasterCm,
};
pub use slave::{SlaveChangeManager, SlaveQueue};
pub use slaves::SlaveSet;

use crate::config::{HistoryConfig, StreamConfig};
use crate::transport::Transport;
use crate::version::ObjectId;
use std::sync::Arc;

/// Everything a master change manager needs from its surroundings.
#[derive(Clone)]
pub struct CmContext {
    pub object_id: ObjectId,
    pub transport: Arc<dyn Transport>,
    pub stream: StreamConfig,
    pub history: HistoryConfig,
}
