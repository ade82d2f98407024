// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node-local cache of received instance data.
//!
//! When enabled, every complete instance stream a slave receives is kept
//! here keyed by (object, version). A later `map_object` for the same
//! object advertises the newest contiguous run of cached versions, and the
//! master skips sending them.

use crate::version::{ObjectId, Version};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

pub struct InstanceCache {
    max_versions_per_object: usize,
    entries: Mutex<HashMap<ObjectId, BTreeMap<Version, Arc<Vec<u8>>>>>,
}

impl InstanceCache {
    pub fn new(max_versions_per_object: usize) -> Self {
        Self {
            max_versions_per_object: max_versions_per_object.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store the instance payload of `version`, evicting the oldest entries
    /// of that object beyond the per-object bound.
    pub fn insert(&self, object_id: ObjectId, version: Version, payload: Vec<u8>) {
        let mut entries = self.entries.lock();
        let versions = entries.entry(object_id).or_default();
        versions.insert(version, Arc::new(payload));
        while versions.len() > self.max_versions_per_object {
            versions.pop_first();
        }
        trace!(object_id = %object_id, version = %version, cached = versions.len(), "Cached instance data");
    }

    pub fn get(&self, object_id: ObjectId, version: Version) -> Option<Arc<Vec<u8>>> {
        self.entries.lock().get(&object_id)?.get(&version).cloned()
    }

    /// The newest contiguous run of cached versions, inclusive.
    pub fn cached_range(&self, object_id: ObjectId) -> Option<(Version, Version)> {
        let entries = self.entries.lock();
        let versions = entries.get(&object_id)?;
        let mut iter = versions.keys().rev();
        let max = *iter.next()?;
        let mut min = max;
        for v in iter {
            if v.0 + 1 != min.0 {
                break;
            }
            min = *v;
        }
        Some((min, max))
    }

    /// Forget everything cached for an object.
    pub fn erase(&self, object_id: ObjectId) -> usize {
        self.entries
            .lock()
            .remove(&object_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCache")
            .field("max_versions_per_object", &self.max_versions_per_object)
            .field("entries", &self.len())
            .finish()
    }
}
