// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Version numbers and object identities.
//!
//! Every replicated object carries a monotonically increasing [`Version`]
//! starting at [`Version::FIRST`] on the first commit. The top of the `u32`
//! range is reserved for request sentinels:
//!
//! ```text
//! 0x0000_0000  NONE     never committed
//! 0x0000_0001  FIRST    first committed version
//! ...
//! 0xffff_fffc  NEXT     sync: block for exactly one new version
//! 0xffff_fffd  INVALID  no data available / error
//! 0xffff_fffe  OLDEST   subscribe: earliest retained version
//! 0xffff_ffff  HEAD     sync: latest received, non-blocking
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session-wide object identity.
pub type ObjectId = uuid::Uuid;

/// Monotonic per-object version counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u32);

impl Version {
    pub const NONE: Version = Version(0);
    pub const FIRST: Version = Version(1);
    pub const NEXT: Version = Version(0xffff_fffc);
    pub const INVALID: Version = Version(0xffff_fffd);
    pub const OLDEST: Version = Version(0xffff_fffe);
    pub const HEAD: Version = Version(0xffff_ffff);

    /// Whether this value is one of the reserved request sentinels.
    pub fn is_sentinel(self) -> bool {
        self.0 >= Self::NEXT.0
    }

    /// The version following this one.
    pub fn next(self) -> Version {
        debug_assert!(!self.is_sentinel(), "next() on sentinel {self}");
        Version(self.0 + 1)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::NONE
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Version::NONE => write!(f, "NONE"),
            Version::NEXT => write!(f, "NEXT"),
            Version::INVALID => write!(f, "INVALID"),
            Version::OLDEST => write!(f, "OLDEST"),
            Version::HEAD => write!(f, "HEAD"),
            Version(v) => write!(f, "{v}"),
        }
    }
}

impl From<u32> for Version {
    fn from(v: u32) -> Self {
        Version(v)
    }
}

/// Node-wide identity of one attached instance of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// Addresses every instance of the object on the receiving node.
    pub const ALL: InstanceId = InstanceId(u32::MAX);

    pub fn is_all(self) -> bool {
        self == Self::ALL
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            write!(f, "ALL")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identity of a node on the transport.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// Handle for a pending non-blocking commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// How an object distributes its changes. Fixed for the object's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    /// Never re-sent after mapping, no versioning.
    Static,
    /// Every commit resends the full instance data.
    Instance,
    /// Commits send deltas; full snapshots are retained for late subscribers.
    Delta,
    /// Commits send deltas; no history is retained.
    Unbuffered,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Static => write!(f, "STATIC"),
            ChangeType::Instance => write!(f, "INSTANCE"),
            ChangeType::Delta => write!(f, "DELTA"),
            ChangeType::Unbuffered => write!(f, "UNBUFFERED"),
        }
    }
}
