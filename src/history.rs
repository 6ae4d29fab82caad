//! Version history graph.
//!
//! Every version of the store has a descriptor here: its lifecycle status,
//! its parent and children in the branching history, the directory root
//! node the version sees, and its named-root directory. Descriptors form a
//! tree rooted at the genesis version; `master` points at the most
//! recently committed version and is what [`Store::master`](crate::store::Store::master)
//! branches from by default.
//!
//! The named-root directory is layered: a version's own map holds only the
//! names it touched, everything else falls through to the parent chain.
//! Deletions leave a tombstone so that an inherited name can be shadowed.

use crate::error::{Result, StoreError};
use crate::ids::{NodeId, PageId, VersionId};
use std::collections::HashMap;

/// Lifecycle status of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    /// Writable through exactly one snapshot.
    Active,
    /// Immutable; may be read and branched from.
    Committed,
    /// Discarded; its private structure has been released.
    RolledBack,
}

/// How a named root relates to the parent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStatus {
    /// The name first appears in this version.
    Created,
    /// The name exists in an ancestor and was rebound here.
    Updated,
    /// Tombstone shadowing an ancestor's binding.
    Deleted,
}

/// One named-root binding in a version's own map.
#[derive(Debug, Clone, Copy)]
pub struct RootEntry {
    pub id: Option<PageId>,
    pub status: RootStatus,
}

/// Descriptor of one version.
#[derive(Debug)]
pub struct HistoryNode {
    version: VersionId,
    parent: Option<VersionId>,
    children: Vec<VersionId>,
    status: VersionStatus,
    root: Option<NodeId>,
    roots: HashMap<String, RootEntry>,
}

impl HistoryNode {
    pub fn version(&self) -> VersionId {
        self.version
    }

    pub fn parent(&self) -> Option<VersionId> {
        self.parent
    }

    pub fn children(&self) -> &[VersionId] {
        &self.children
    }

    pub fn status(&self) -> VersionStatus {
        self.status
    }

    /// Directory root this version sees; `None` once rolled back.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn set_root(&mut self, root: Option<NodeId>) {
        self.root = root;
    }

    pub(crate) fn set_status(&mut self, status: VersionStatus) {
        self.status = status;
    }

    pub(crate) fn own_root_entry(&self, name: &str) -> Option<RootEntry> {
        self.roots.get(name).copied()
    }

    pub(crate) fn put_root_entry(&mut self, name: &str, entry: RootEntry) {
        self.roots.insert(name.to_string(), entry);
    }

    pub(crate) fn erase_root_entry(&mut self, name: &str) {
        self.roots.remove(name);
    }
}

/// The graph of all version descriptors of one store.
#[derive(Debug)]
pub struct HistoryGraph {
    nodes: HashMap<VersionId, HistoryNode>,
    genesis: VersionId,
    master: VersionId,
}

impl HistoryGraph {
    /// Builds a graph holding only the genesis version, initially active so
    /// the store can seed it before the first commit.
    pub fn new(genesis: VersionId, root: NodeId) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            genesis,
            HistoryNode {
                version: genesis,
                parent: None,
                children: Vec::new(),
                status: VersionStatus::Active,
                root: Some(root),
                roots: HashMap::new(),
            },
        );
        Self {
            nodes,
            genesis,
            master: genesis,
        }
    }

    pub fn genesis(&self) -> VersionId {
        self.genesis
    }

    /// Most recently committed version.
    pub fn master(&self) -> VersionId {
        self.master
    }

    pub(crate) fn set_master(&mut self, version: VersionId) {
        self.master = version;
    }

    pub fn node(&self, version: VersionId) -> Result<&HistoryNode> {
        self.nodes.get(&version).ok_or_else(|| {
            StoreError::invalid_state(format!("unknown version {version}"))
        })
    }

    pub(crate) fn node_mut(&mut self, version: VersionId) -> Result<&mut HistoryNode> {
        self.nodes.get_mut(&version).ok_or_else(|| {
            StoreError::invalid_state(format!("unknown version {version}"))
        })
    }

    /// All versions, in id order.
    pub fn versions(&self) -> Vec<VersionId> {
        let mut out: Vec<VersionId> = self.nodes.keys().copied().collect();
        out.sort();
        out
    }

    /// Registers a fresh active version branched off `parent`.
    pub(crate) fn add_branch(
        &mut self,
        parent: VersionId,
        version: VersionId,
        root: NodeId,
    ) -> Result<()> {
        if self.nodes.contains_key(&version) {
            return Err(StoreError::corrupt(format!("duplicate version {version}")));
        }
        self.node_mut(parent)?.children.push(version);
        self.nodes.insert(
            version,
            HistoryNode {
                version,
                parent: Some(parent),
                children: Vec::new(),
                status: VersionStatus::Active,
                root: Some(root),
                roots: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Resolves `name` for `version`, falling through the parent chain.
    /// Tombstones stop the walk with "not bound".
    pub fn get_root(&self, version: VersionId, name: &str) -> Result<Option<PageId>> {
        let mut cursor = Some(version);
        while let Some(v) = cursor {
            let node = self.node(v)?;
            if let Some(entry) = node.roots.get(name) {
                return Ok(match entry.status {
                    RootStatus::Deleted => None,
                    _ => entry.id,
                });
            }
            cursor = node.parent;
        }
        Ok(None)
    }

    /// Whether `name` resolves to a root for `version`.
    pub fn has_root(&self, version: VersionId, name: &str) -> Result<bool> {
        Ok(self.get_root(version, name)?.is_some())
    }

    /// Binds or unbinds `name` in `version`'s own map.
    ///
    /// Binding records `Created` when the name is new to the whole chain
    /// and `Updated` when it shadows an ancestor. Unbinding leaves a
    /// `Deleted` tombstone when an ancestor still binds the name and simply
    /// erases the local entry otherwise.
    pub(crate) fn set_root(
        &mut self,
        version: VersionId,
        name: &str,
        id: Option<PageId>,
    ) -> Result<()> {
        let inherited = match self.node(version)?.parent {
            Some(parent) => self.get_root(parent, name)?.is_some(),
            None => false,
        };
        let node = self.node_mut(version)?;
        match id {
            Some(id) => {
                let status = match node.roots.get(name) {
                    Some(entry) if entry.status == RootStatus::Created => RootStatus::Created,
                    Some(_) => RootStatus::Updated,
                    None if inherited => RootStatus::Updated,
                    None => RootStatus::Created,
                };
                node.put_root_entry(name, RootEntry { id: Some(id), status });
            }
            None => {
                if inherited {
                    node.put_root_entry(
                        name,
                        RootEntry {
                            id: None,
                            status: RootStatus::Deleted,
                        },
                    );
                } else {
                    node.erase_root_entry(name);
                }
            }
        }
        Ok(())
    }

    /// Promotes an inherited binding of `name` into `version`'s own map
    /// with `Updated` status, so later root-page rewrites stay local to
    /// this version. No-op when the version already owns an entry.
    pub(crate) fn mark_updated(&mut self, version: VersionId, name: &str) -> Result<()> {
        if self.node(version)?.own_root_entry(name).is_some() {
            return Ok(());
        }
        let parent = self.node(version)?.parent;
        let inherited = match parent {
            Some(parent) => self.get_root(parent, name)?,
            None => None,
        };
        if let Some(id) = inherited {
            self.node_mut(version)?.put_root_entry(
                name,
                RootEntry {
                    id: Some(id),
                    status: RootStatus::Updated,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> HistoryGraph {
        HistoryGraph::new(VersionId(1), NodeId(1))
    }

    #[test]
    fn test_branching_bookkeeping() {
        let mut g = graph();
        g.node_mut(VersionId(1)).unwrap().set_status(VersionStatus::Committed);
        g.add_branch(VersionId(1), VersionId(2), NodeId(2)).unwrap();

        assert_eq!(g.node(VersionId(2)).unwrap().parent(), Some(VersionId(1)));
        assert_eq!(g.node(VersionId(1)).unwrap().children(), &[VersionId(2)]);
        assert_eq!(g.node(VersionId(2)).unwrap().status(), VersionStatus::Active);
        assert_eq!(g.versions(), vec![VersionId(1), VersionId(2)]);
    }

    #[test]
    fn test_named_roots_fall_through_parents() {
        let mut g = graph();
        g.set_root(VersionId(1), "catalog", Some(PageId(7))).unwrap();
        g.add_branch(VersionId(1), VersionId(2), NodeId(2)).unwrap();
        g.add_branch(VersionId(2), VersionId(3), NodeId(3)).unwrap();

        // unset in the grandchild: visible via two levels of fall-through
        assert_eq!(g.get_root(VersionId(3), "catalog").unwrap(), Some(PageId(7)));
        assert!(g.has_root(VersionId(3), "catalog").unwrap());
        assert!(!g.has_root(VersionId(3), "other").unwrap());
    }

    #[test]
    fn test_root_statuses() {
        let mut g = graph();
        g.set_root(VersionId(1), "a", Some(PageId(1))).unwrap();
        g.add_branch(VersionId(1), VersionId(2), NodeId(2)).unwrap();

        // brand new name in the child
        g.set_root(VersionId(2), "b", Some(PageId(2))).unwrap();
        let entry = g.node(VersionId(2)).unwrap().own_root_entry("b").unwrap();
        assert_eq!(entry.status, RootStatus::Created);

        // rebinding an inherited name
        g.set_root(VersionId(2), "a", Some(PageId(3))).unwrap();
        let entry = g.node(VersionId(2)).unwrap().own_root_entry("a").unwrap();
        assert_eq!(entry.status, RootStatus::Updated);
        assert_eq!(g.get_root(VersionId(2), "a").unwrap(), Some(PageId(3)));
        // the parent still sees its own binding
        assert_eq!(g.get_root(VersionId(1), "a").unwrap(), Some(PageId(1)));
    }

    #[test]
    fn test_delete_tombstone_shadows_ancestor() {
        let mut g = graph();
        g.set_root(VersionId(1), "a", Some(PageId(1))).unwrap();
        g.add_branch(VersionId(1), VersionId(2), NodeId(2)).unwrap();

        g.set_root(VersionId(2), "a", None).unwrap();
        assert_eq!(g.get_root(VersionId(2), "a").unwrap(), None);
        assert!(!g.has_root(VersionId(2), "a").unwrap());
        let entry = g.node(VersionId(2)).unwrap().own_root_entry("a").unwrap();
        assert_eq!(entry.status, RootStatus::Deleted);
        assert_eq!(g.get_root(VersionId(1), "a").unwrap(), Some(PageId(1)));

        // deleting a purely local name erases it outright
        g.set_root(VersionId(2), "temp", Some(PageId(9))).unwrap();
        g.set_root(VersionId(2), "temp", None).unwrap();
        assert!(g.node(VersionId(2)).unwrap().own_root_entry("temp").is_none());
    }

    #[test]
    fn test_mark_updated_promotes_inherited_entry() {
        let mut g = graph();
        g.set_root(VersionId(1), "a", Some(PageId(1))).unwrap();
        g.add_branch(VersionId(1), VersionId(2), NodeId(2)).unwrap();

        g.mark_updated(VersionId(2), "a").unwrap();
        let entry = g.node(VersionId(2)).unwrap().own_root_entry("a").unwrap();
        assert_eq!(entry.status, RootStatus::Updated);
        assert_eq!(entry.id, Some(PageId(1)));

        // created entries are left alone
        g.set_root(VersionId(2), "b", Some(PageId(2))).unwrap();
        g.mark_updated(VersionId(2), "b").unwrap();
        let entry = g.node(VersionId(2)).unwrap().own_root_entry("b").unwrap();
        assert_eq!(entry.status, RootStatus::Created);
    }
}
