//! Identifier newtypes used across the engine.
//!
//! Four id spaces exist and are deliberately kept apart at the type level:
//!
//! - [`PageId`]: the *logical* identity of a page. Stable across
//!   copy-on-write: every physical incarnation of a page keeps its `PageId`.
//! - [`PagePtr`]: the *physical* identity of one materialized page object.
//!   A COW clone gets a fresh `PagePtr` under the same `PageId`.
//! - [`NodeId`]: identity of a node in the versioned node directory tree.
//! - [`VersionId`]: identity of a version (snapshot) in the history graph.

use std::fmt;

/// Stable logical page identifier, assigned once at `create` and never
/// reused while the page is reachable from any version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageId(pub u64);

/// Physical identity of one materialized page object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PagePtr(pub u64);

/// Identifier of a directory tree node. Assigned once, never reused while
/// the node is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u64);

/// Identifier of a version in the history graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

impl fmt::Display for PagePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ptr:{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
