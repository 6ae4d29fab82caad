//! The versioned node directory.
//!
//! Maps logical [`PageId`]s to physical [`PageSlot`]s through a search tree
//! whose nodes are shared structurally between versions. Every mutating
//! operation first takes ownership of the affected root-to-leaf path:
//! nodes stamped with the writing version are mutated in place, anything
//! older is cloned ([`Directory::update_path`]) so that committed versions
//! never observe a change.
//!
//! Reference counts drive reclamation on both levels: a node's count is
//! the number of parent references plus, for roots, the history graph's
//! reference; a leaf entry holds one reference on its page. Dropping a
//! version walks its root with [`Directory::delete_tree`], which cascades
//! deallocation exactly when counts reach zero.

use crate::codec::PayloadCodec;
use crate::error::{Result, StoreError};
use crate::ids::{NodeId, PageId, PagePtr, VersionId};
use crate::page::PageArena;
use crate::tree::node::{Node, NodeType};
use std::collections::HashMap;
use tracing::trace;

/// Physical location of a page as seen by one version: which materialized
/// page object, and which version produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlot {
    pub ptr: PagePtr,
    pub version: VersionId,
}

/// Directory tree node: `PageId` keys over `PageSlot` leaf payloads.
pub type DirNode = Node<PageId, PageSlot>;

/// Wire codec for [`PageSlot`] leaf payloads: pointer then version, both
/// little-endian u64.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlotCodec;

impl PayloadCodec<PageSlot> for SlotCodec {
    fn encode(&self, value: &PageSlot, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&value.ptr.0.to_le_bytes());
        out.extend_from_slice(&value.version.0.to_le_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<PageSlot> {
        if bytes.len() != 16 {
            return Err(StoreError::Codec(format!(
                "page slot must be 16 bytes, got {}",
                bytes.len()
            )));
        }
        let ptr = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let version = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        Ok(PageSlot {
            ptr: PagePtr(ptr),
            version: VersionId(version),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Next,
    Prev,
}

/// Id-keyed arena of directory nodes.
#[derive(Debug)]
struct NodeArena {
    nodes: HashMap<NodeId, DirNode>,
    next_id: u64,
}

impl NodeArena {
    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// The directory proper. Shared by all versions of a store; each version
/// contributes a root node id held in its history descriptor.
#[derive(Debug)]
pub struct Directory {
    arena: NodeArena,
    node_capacity: usize,
    index_block: usize,
}

impl Directory {
    pub fn new(node_capacity: usize, index_block: usize) -> Self {
        Self {
            arena: NodeArena {
                nodes: HashMap::new(),
                next_id: 1,
            },
            node_capacity,
            index_block,
        }
    }

    /// Creates an empty leaf root for a fresh version, already carrying the
    /// history graph's reference.
    pub fn create_root(&mut self, version: VersionId) -> NodeId {
        let id = self.arena.fresh_id();
        let mut root = DirNode::new_leaf(id, version, self.node_capacity, self.index_block);
        root.ref_node();
        self.arena.nodes.insert(id, root);
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&DirNode> {
        self.arena
            .nodes
            .get(&id)
            .ok_or_else(|| StoreError::corrupt(format!("dangling directory {id}")))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut DirNode> {
        self.arena
            .nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::corrupt(format!("dangling directory {id}")))
    }

    /// Number of live nodes, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.arena.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.nodes.is_empty()
    }

    /// Looks `key` up under `root` without touching refcounts.
    pub fn find(&self, root: NodeId, key: PageId) -> Result<Option<PageSlot>> {
        let mut id = root;
        loop {
            let node = self.node(id)?;
            if node.is_leaf() {
                let idx = node.find_key(&key);
                return Ok(if idx < node.size() && node.key(idx) == key {
                    Some(*node.value(idx))
                } else {
                    None
                });
            }
            if node.size() == 0 {
                return Ok(None);
            }
            id = node.find_child(&key);
        }
    }

    /// Binds `key` to `slot` under the tree rooted at `*root`, splitting
    /// full nodes on the way and growing the root if needed (`*root` is
    /// updated in place). Returns the previous slot when the key was
    /// already bound; the caller owns the page reference that slot carried.
    pub fn assign(
        &mut self,
        root: &mut NodeId,
        version: VersionId,
        pages: &PageArena,
        key: PageId,
        slot: PageSlot,
    ) -> Result<Option<PageSlot>> {
        let (mut path, idx) = self.locate(*root, key)?;

        let leaf = self.node(path[0])?;
        if idx < leaf.size() && leaf.key(idx) == key {
            self.update_path(&mut path, version, pages)?;
            let old = self.node_mut(path[0])?.set_value(idx, slot);
            trace!(%key, old_ptr = %old.ptr, new_ptr = %slot.ptr, "slot replaced");
            return Ok(Some(old));
        }

        self.update_path(&mut path, version, pages)?;
        let (path, idx) = if self.node(path[0])?.is_full() {
            self.split_level(root, &mut path, 0, version)?;
            self.locate(*root, key)?
        } else {
            (path, idx)
        };

        self.node_mut(path[0])?.insert_leaf(idx, key, slot);
        self.update_keys_up(&path)?;
        self.node_mut(*root)?.add_meta_size(1);
        trace!(%key, ptr = %slot.ptr, %version, "slot assigned");
        Ok(None)
    }

    /// Unbinds `key` under `*root`, dropping the page reference its slot
    /// held and merging underfull nodes afterwards. Returns `false` when
    /// the key was not bound.
    pub fn remove(
        &mut self,
        root: &mut NodeId,
        version: VersionId,
        pages: &PageArena,
        key: PageId,
    ) -> Result<bool> {
        let (mut path, idx) = self.locate(*root, key)?;
        {
            let leaf = self.node(path[0])?;
            if idx >= leaf.size() || leaf.key(idx) != key {
                return Ok(false);
            }
        }

        self.update_path(&mut path, version, pages)?;
        let slot = *self.node(path[0])?.value(idx);
        self.node_mut(path[0])?.remove_entries(idx, idx + 1);
        pages.unref_page(slot.ptr)?;
        self.update_keys_up(&path)?;
        self.node_mut(*root)?.add_meta_size(-1);
        trace!(%key, ptr = %slot.ptr, %version, "slot removed");

        if self.node(path[0])?.should_merge() {
            self.merge_step(root, path, version, pages)?;
        }
        Ok(true)
    }

    /// Clones `root` for a new branch: the clone is stamped with `version`,
    /// references the same children/pages, and carries the new branch's
    /// history reference.
    pub fn clone_root(
        &mut self,
        root: NodeId,
        version: VersionId,
        pages: &PageArena,
    ) -> Result<NodeId> {
        let clone = self.clone_node(root, version, pages)?;
        self.node_mut(clone)?.ref_node();
        Ok(clone)
    }

    /// Drops one reference from the tree rooted at `root`, cascading
    /// deallocation through nodes and leaf page references that reach zero.
    pub fn delete_tree(&mut self, root: NodeId, pages: &PageArena) -> Result<()> {
        self.release_node(root, pages)
    }

    /// Pre-order walk over every node reachable from `root`.
    pub fn walk_tree(
        &self,
        root: NodeId,
        f: &mut dyn FnMut(&DirNode, usize),
    ) -> Result<()> {
        self.walk_from(root, 0, f)
    }

    fn walk_from(
        &self,
        id: NodeId,
        depth: usize,
        f: &mut dyn FnMut(&DirNode, usize),
    ) -> Result<()> {
        let node = self.node(id)?;
        f(node, depth);
        if node.is_branch() {
            let children: Vec<NodeId> = node.children().to_vec();
            for child in children {
                self.walk_from(child, depth + 1, f)?;
            }
        }
        Ok(())
    }

    // --- path machinery ---

    /// Root-to-leaf path for `key`, leaf first. Also returns the leaf-level
    /// insertion index for `key`.
    fn locate(&self, root: NodeId, key: PageId) -> Result<(Vec<NodeId>, usize)> {
        let mut trail = vec![root];
        let mut id = root;
        loop {
            let node = self.node(id)?;
            if node.is_leaf() {
                let idx = node.find_key(&key);
                trail.reverse();
                return Ok((trail, idx));
            }
            if node.size() == 0 {
                return Err(StoreError::corrupt(format!("empty branch {id} on path")));
            }
            id = node.find_child(&key);
            trail.push(id);
        }
    }

    /// Takes write ownership of `path` for `version`: nodes already stamped
    /// with `version` are left alone, everything below the owned region is
    /// cloned top-first and swapped into its (owned) parent.
    ///
    /// Ownership is top-connected: a node created by this version can only
    /// hang off parents this version also owns, so the path always splits
    /// into a shared lower part and an owned upper part ending at the root.
    fn update_path(
        &mut self,
        path: &mut [NodeId],
        version: VersionId,
        pages: &PageArena,
    ) -> Result<()> {
        let len = path.len();
        if self.node(path[len - 1])?.version() != version {
            return Err(StoreError::corrupt(format!(
                "root {} not owned by writing {version}",
                path[len - 1]
            )));
        }

        let mut first_owned = len - 1;
        while first_owned > 0 && self.node(path[first_owned - 1])?.version() == version {
            first_owned -= 1;
        }

        for level in (0..first_owned).rev() {
            let parent_id = path[level + 1];
            let child_id = path[level];
            let clone_id = self.clone_node(child_id, version, pages)?;
            let pos = self
                .node(parent_id)?
                .find_child_node(child_id)
                .ok_or_else(|| {
                    StoreError::corrupt(format!("{child_id} missing from parent {parent_id}"))
                })?;
            self.node_mut(parent_id)?.set_child(pos, clone_id);
            self.node_mut(clone_id)?.ref_node();
            self.release_node(child_id, pages)?;
            path[level] = clone_id;
        }
        Ok(())
    }

    /// Copies a node under a fresh id, stamped with `version`, refcount 0.
    /// The copy takes its own references on everything it points at.
    fn clone_node(
        &mut self,
        id: NodeId,
        version: VersionId,
        pages: &PageArena,
    ) -> Result<NodeId> {
        let mut clone = self.node(id)?.clone();
        let clone_id = self.arena.fresh_id();
        clone.set_id(clone_id);
        clone.set_version(version);
        clone.clear_refs();

        match clone.node_type() {
            NodeType::Branch => {
                let children: Vec<NodeId> = clone.children().to_vec();
                for child in children {
                    self.node_mut(child)?.ref_node();
                }
            }
            NodeType::Leaf => {
                for slot in clone.values() {
                    pages.ref_page(slot.ptr)?;
                }
            }
        }
        trace!(from = %id, to = %clone_id, %version, "node cloned");
        self.arena.nodes.insert(clone_id, clone);
        Ok(clone_id)
    }

    fn release_node(&mut self, id: NodeId, pages: &PageArena) -> Result<()> {
        let refs = self.node_mut(id)?.unref_node();
        if refs < 0 {
            return Err(StoreError::corrupt(format!(
                "refcount of {id} dropped below zero"
            )));
        }
        if refs > 0 {
            return Ok(());
        }
        let node = self
            .arena
            .nodes
            .remove(&id)
            .ok_or_else(|| StoreError::corrupt(format!("dangling directory {id}")))?;
        trace!(%id, "node deallocated");
        match node.node_type() {
            NodeType::Branch => {
                for child in node.children() {
                    self.release_node(*child, pages)?;
                }
            }
            NodeType::Leaf => {
                for slot in node.values() {
                    pages.unref_page(slot.ptr)?;
                }
            }
        }
        Ok(())
    }

    /// Refreshes branch separators after the node at the bottom of `path`
    /// changed its maximum key. Stops at the first level whose separator is
    /// already right, or when the child is empty (a merge will follow).
    fn update_keys_up(&mut self, path: &[NodeId]) -> Result<()> {
        for level in 0..path.len().saturating_sub(1) {
            let child_id = path[level];
            let child = self.node(child_id)?;
            if child.size() == 0 {
                break;
            }
            let max = child.max_key();
            let parent_id = path[level + 1];
            let pos = self
                .node(parent_id)?
                .find_child_node(child_id)
                .ok_or_else(|| {
                    StoreError::corrupt(format!("{child_id} missing from parent {parent_id}"))
                })?;
            let parent = self.node_mut(parent_id)?;
            if parent.key(pos) == max {
                break;
            }
            parent.set_key(pos, max);
            parent.reindex();
        }
        Ok(())
    }

    // --- splitting ---

    /// Splits the (owned, full) node at `level` of `path` down the middle,
    /// wiring the new right sibling into the parent. A full parent is split
    /// first; a full root grows the tree by one level.
    ///
    /// `path` levels above may be rewired by recursive parent splits, so
    /// callers re-locate afterwards rather than trusting the old path.
    fn split_level(
        &mut self,
        root: &mut NodeId,
        path: &mut Vec<NodeId>,
        level: usize,
        version: VersionId,
    ) -> Result<()> {
        if level + 1 == path.len() {
            self.grow_root(root, path, version)?;
        } else if self.node(path[level + 1])?.is_full() {
            self.split_level(root, path, level + 1, version)?;
            // the parent split may have moved our node under the new sibling
            let mut parent = path[level + 1];
            if self.node(parent)?.find_child_node(path[level]).is_none() {
                let grand = path[level + 2];
                let pos = self
                    .node(grand)?
                    .find_child_node(parent)
                    .ok_or_else(|| {
                        StoreError::corrupt(format!("{parent} missing from parent {grand}"))
                    })?;
                parent = self.node(grand)?.child(pos + 1);
                path[level + 1] = parent;
                if self.node(parent)?.find_child_node(path[level]).is_none() {
                    return Err(StoreError::corrupt(format!(
                        "{} lost after parent split",
                        path[level]
                    )));
                }
            }
        }

        let left_id = path[level];
        let parent_id = path[level + 1];
        let right_id = self.arena.fresh_id();

        let mut left = self
            .arena
            .nodes
            .remove(&left_id)
            .ok_or_else(|| StoreError::corrupt(format!("dangling directory {left_id}")))?;
        let mut right = match left.node_type() {
            NodeType::Branch => {
                DirNode::new_branch(right_id, version, self.node_capacity, self.index_block)
            }
            NodeType::Leaf => {
                DirNode::new_leaf(right_id, version, self.node_capacity, self.index_block)
            }
        };
        let at = left.size() / 2;
        left.split_to(at, &mut right);
        right.ref_node();

        let left_max = left.max_key();
        let right_max = right.max_key();
        self.arena.nodes.insert(left_id, left);
        self.arena.nodes.insert(right_id, right);

        let pos = self
            .node(parent_id)?
            .find_child_node(left_id)
            .ok_or_else(|| {
                StoreError::corrupt(format!("{left_id} missing from parent {parent_id}"))
            })?;
        let parent = self.node_mut(parent_id)?;
        parent.set_key(pos, left_max);
        parent.insert_child(pos + 1, right_max, right_id);
        trace!(left = %left_id, right = %right_id, %version, "node split");
        Ok(())
    }

    /// Grows the tree by one level: a fresh branch root adopts the old root
    /// as its only child and takes over the root metadata. The history
    /// graph's reference transfers to the new root; the old root's count is
    /// unchanged, now meaning "referenced by parent".
    fn grow_root(
        &mut self,
        root: &mut NodeId,
        path: &mut Vec<NodeId>,
        version: VersionId,
    ) -> Result<()> {
        let old_root = *root;
        let new_id = self.arena.fresh_id();
        let mut new_root =
            DirNode::new_branch(new_id, version, self.node_capacity, self.index_block);

        let (meta, max) = {
            let old = self.node(old_root)?;
            (old.meta_size(), old.max_key())
        };
        self.node_mut(old_root)?.set_meta_size(0);
        new_root.set_meta_size(meta);
        new_root.insert_child(0, max, old_root);
        new_root.ref_node();
        self.arena.nodes.insert(new_id, new_root);

        *root = new_id;
        path.push(new_id);
        trace!(old = %old_root, new = %new_id, %version, "root grown");
        Ok(())
    }

    // --- merging ---

    /// Merge pass after a removal. `path` runs from the shrunken node up to
    /// the root; every node on it is owned by `version`. Absorbs the right
    /// neighbor when it fits, otherwise dissolves into the left neighbor,
    /// and cascades to parents that lose children. Single-child branch
    /// roots collapse at the end.
    fn merge_step(
        &mut self,
        root: &mut NodeId,
        path: Vec<NodeId>,
        version: VersionId,
        pages: &PageArena,
    ) -> Result<()> {
        if path.len() == 1 {
            return self.collapse_root(root, version, pages);
        }
        let node_id = path[0];
        if self.node(node_id)?.should_merge() {
            if let Some(mut right) = self.neighbor_path(&path, Direction::Next)? {
                if self
                    .node(node_id)?
                    .can_merge_with(self.node(right[0])?)
                {
                    self.update_path(&mut right, version, pages)?;
                    return self.merge_into(root, path, right, version, pages);
                }
            }
            if let Some(mut left) = self.neighbor_path(&path, Direction::Prev)? {
                if self
                    .node(left[0])?
                    .can_merge_with(self.node(node_id)?)
                {
                    self.update_path(&mut left, version, pages)?;
                    return self.merge_into(root, left, path, version, pages);
                }
            }
        }
        self.collapse_root(root, version, pages)
    }

    /// Absorbs the node at the bottom of `right_path` into the one at the
    /// bottom of `left_path` (both owned, left immediately precedes right
    /// in key order), then cascades upward from the parent that lost a
    /// child.
    fn merge_into(
        &mut self,
        root: &mut NodeId,
        left_path: Vec<NodeId>,
        right_path: Vec<NodeId>,
        version: VersionId,
        pages: &PageArena,
    ) -> Result<()> {
        let left_id = left_path[0];
        let right_id = right_path[0];

        let right = self
            .arena
            .nodes
            .remove(&right_id)
            .ok_or_else(|| StoreError::corrupt(format!("dangling directory {right_id}")))?;
        if right.refs() != 1 {
            return Err(StoreError::corrupt(format!(
                "merging {right_id} with {} references",
                right.refs()
            )));
        }
        self.node_mut(left_id)?.merge_from(right);
        trace!(left = %left_id, right = %right_id, %version, "nodes merged");

        let parent_id = right_path[1];
        let pos = self
            .node(parent_id)?
            .find_child_node(right_id)
            .ok_or_else(|| {
                StoreError::corrupt(format!("{right_id} missing from parent {parent_id}"))
            })?;
        self.node_mut(parent_id)?.remove_entries(pos, pos + 1);
        self.update_keys_up(&left_path)?;

        if self.node(parent_id)?.size() == 0 {
            // the right parent lost its only child; cut it out entirely
            if right_path.len() == 2 {
                return self.collapse_root(root, version, pages);
            }
            let grand_id = right_path[2];
            let pos = self
                .node(grand_id)?
                .find_child_node(parent_id)
                .ok_or_else(|| {
                    StoreError::corrupt(format!("{parent_id} missing from parent {grand_id}"))
                })?;
            self.node_mut(grand_id)?.remove_entries(pos, pos + 1);
            self.release_node(parent_id, pages)?;
            return self.merge_step(root, right_path[2..].to_vec(), version, pages);
        }
        self.merge_step(root, right_path[1..].to_vec(), version, pages)
    }

    /// While the root is a branch with a single child, that child becomes
    /// the root, inheriting the metadata and the history reference. A child
    /// still shared with other versions is cloned first so the active
    /// version keeps owning its root.
    fn collapse_root(
        &mut self,
        root: &mut NodeId,
        version: VersionId,
        pages: &PageArena,
    ) -> Result<()> {
        loop {
            let (child, meta) = {
                let r = self.node(*root)?;
                if r.is_leaf() || r.size() != 1 {
                    return Ok(());
                }
                (r.child(0), r.meta_size())
            };
            if self.node(*root)?.refs() != 1 {
                return Err(StoreError::corrupt(format!(
                    "collapsing root {root} with multiple references"
                )));
            }
            let promoted = if self.node(child)?.version() == version {
                // the child's parent reference becomes the history reference
                self.arena
                    .nodes
                    .remove(root)
                    .ok_or_else(|| StoreError::corrupt(format!("dangling directory {root}")))?;
                child
            } else {
                let clone = self.clone_node(child, version, pages)?;
                self.release_node(*root, pages)?;
                self.node_mut(clone)?.ref_node();
                clone
            };
            self.node_mut(promoted)?.set_meta_size(meta);
            trace!(old = %root, new = %promoted, %version, "root collapsed");
            *root = promoted;
        }
    }

    /// Path to the same-depth neighbor of the node at the bottom of `path`,
    /// sharing `path`'s levels above the divergence point. `None` when the
    /// node is the first/last at its depth.
    fn neighbor_path(
        &self,
        path: &[NodeId],
        dir: Direction,
    ) -> Result<Option<Vec<NodeId>>> {
        for level in 1..path.len() {
            let parent_id = path[level];
            let pos = self
                .node(parent_id)?
                .find_child_node(path[level - 1])
                .ok_or_else(|| {
                    StoreError::corrupt(format!(
                        "{} missing from parent {parent_id}",
                        path[level - 1]
                    ))
                })?;
            let parent = self.node(parent_id)?;
            let sideways = match dir {
                Direction::Next if pos + 1 < parent.size() => Some(parent.child(pos + 1)),
                Direction::Prev if pos > 0 => Some(parent.child(pos - 1)),
                _ => None,
            };
            if let Some(start) = sideways {
                let mut result = path.to_vec();
                let mut id = start;
                for l in (0..level).rev() {
                    result[l] = id;
                    if l > 0 {
                        let node = self.node(id)?;
                        id = match dir {
                            Direction::Next => node.first_child(),
                            Direction::Prev => node.last_child(),
                        };
                    }
                }
                return Ok(Some(result));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BlockAllocator;
    use std::sync::Arc;

    const CAP: usize = 8;
    const IB: usize = 4;

    fn setup() -> (Directory, PageArena) {
        let alloc = Arc::new(BlockAllocator::new(16 << 20));
        (Directory::new(CAP, IB), PageArena::new(alloc))
    }

    fn put(
        dir: &mut Directory,
        pages: &PageArena,
        root: &mut NodeId,
        version: VersionId,
        key: u64,
    ) -> PageSlot {
        let ptr = pages.install(PageId(key), version, 8).unwrap();
        let slot = PageSlot { ptr, version };
        let old = dir
            .assign(root, version, pages, PageId(key), slot)
            .unwrap();
        if let Some(old) = old {
            pages.unref_page(old.ptr).unwrap();
        }
        slot
    }

    /// Recursively validates the structural invariants of one version's
    /// tree and returns its total entry count.
    fn validate(dir: &Directory, pages: &PageArena, id: NodeId) -> usize {
        let node = dir.node(id).unwrap();
        assert!(node.refs() >= 1, "{id} has refcount {}", node.refs());
        let keys = node.keys();
        for w in keys.windows(2) {
            assert!(w[0] < w[1], "keys out of order in {id}");
        }
        // coarse index must match a recomputation
        let mut expect = node.clone();
        expect.reindex();
        assert_eq!(node.index_blocks(), expect.index_blocks(), "stale index in {id}");

        if node.is_leaf() {
            for slot in node.values() {
                assert!(pages.contains(slot.ptr), "leaf {id} points at freed page");
                assert!(pages.refs(slot.ptr).unwrap() >= 1);
            }
            node.size()
        } else {
            assert!(node.size() >= 1, "empty branch {id}");
            let mut total = 0;
            for (i, child) in node.children().iter().enumerate() {
                let child_node = dir.node(*child).unwrap();
                assert_eq!(
                    node.key(i),
                    child_node.max_key(),
                    "separator {i} of {id} disagrees with child max"
                );
                total += validate(dir, pages, *child);
            }
            total
        }
    }

    #[test]
    fn test_insert_find_small() {
        let (mut dir, pages) = setup();
        let mut root = dir.create_root(VersionId(1));

        let slot = put(&mut dir, &pages, &mut root, VersionId(1), 42);
        assert_eq!(dir.find(root, PageId(42)).unwrap(), Some(slot));
        assert_eq!(dir.find(root, PageId(43)).unwrap(), None);
        assert_eq!(dir.node(root).unwrap().meta_size(), 1);
    }

    #[test]
    fn test_bulk_insert_splits_and_finds() {
        let (mut dir, pages) = setup();
        let mut root = dir.create_root(VersionId(1));

        let mut slots = HashMap::new();
        // interleaved order to exercise splits at both ends and the middle
        for k in (0..200).map(|i| ((i * 73) % 200) as u64) {
            slots.insert(k, put(&mut dir, &pages, &mut root, VersionId(1), k));
        }

        assert!(dir.node(root).unwrap().is_branch(), "tree should have grown");
        let total = validate(&dir, &pages, root);
        assert_eq!(total, 200);
        assert_eq!(dir.node(root).unwrap().meta_size(), 200);

        for (k, slot) in &slots {
            assert_eq!(dir.find(root, PageId(*k)).unwrap(), Some(*slot), "key {k}");
        }
        assert_eq!(dir.find(root, PageId(500)).unwrap(), None);
    }

    #[test]
    fn test_reassign_returns_old_slot() {
        let (mut dir, pages) = setup();
        let mut root = dir.create_root(VersionId(1));

        let first = put(&mut dir, &pages, &mut root, VersionId(1), 7);
        let ptr2 = pages.install(PageId(7), VersionId(1), 8).unwrap();
        let second = PageSlot {
            ptr: ptr2,
            version: VersionId(1),
        };
        let old = dir
            .assign(&mut root, VersionId(1), &pages, PageId(7), second)
            .unwrap();
        assert_eq!(old, Some(first));
        pages.unref_page(first.ptr).unwrap();

        assert_eq!(dir.find(root, PageId(7)).unwrap(), Some(second));
        assert_eq!(dir.node(root).unwrap().meta_size(), 1);
        assert!(!pages.contains(first.ptr));
    }

    #[test]
    fn test_remove_merges_back_to_leaf() {
        let (mut dir, pages) = setup();
        let mut root = dir.create_root(VersionId(1));

        for k in 0..100u64 {
            put(&mut dir, &pages, &mut root, VersionId(1), k);
        }
        assert!(dir.node(root).unwrap().is_branch());

        for k in 0..100u64 {
            assert!(dir.remove(&mut root, VersionId(1), &pages, PageId(k)).unwrap());
            if dir.node(root).unwrap().size() > 0 {
                let total = validate(&dir, &pages, root);
                assert_eq!(total as u64, 100 - k - 1);
            }
        }

        let root_node = dir.node(root).unwrap();
        assert!(root_node.is_leaf());
        assert_eq!(root_node.size(), 0);
        assert_eq!(root_node.meta_size(), 0);
        assert_eq!(dir.len(), 1, "only the empty root should remain");
        assert!(pages.is_empty(), "every page reference should be dropped");
    }

    #[test]
    fn test_remove_missing_key() {
        let (mut dir, pages) = setup();
        let mut root = dir.create_root(VersionId(1));
        put(&mut dir, &pages, &mut root, VersionId(1), 1);
        assert!(!dir.remove(&mut root, VersionId(1), &pages, PageId(99)).unwrap());
        assert_eq!(dir.node(root).unwrap().meta_size(), 1);
    }

    #[test]
    fn test_structural_sharing_between_versions() {
        let (mut dir, pages) = setup();
        let v1 = VersionId(1);
        let v2 = VersionId(2);
        let mut root1 = dir.create_root(v1);

        let mut v1_slots = HashMap::new();
        for k in 0..60u64 {
            v1_slots.insert(k, put(&mut dir, &pages, &mut root1, v1, k));
        }
        let nodes_before = dir.len();

        // branch: clone the root only, share everything below
        let mut root2 = dir.clone_root(root1, v2, &pages).unwrap();
        assert_eq!(dir.len(), nodes_before + 1);

        // overwrite one key in the branch
        let new_ptr = pages.install(PageId(10), v2, 8).unwrap();
        let new_slot = PageSlot { ptr: new_ptr, version: v2 };
        let old = dir.assign(&mut root2, v2, &pages, PageId(10), new_slot).unwrap();
        pages.unref_page(old.unwrap().ptr).unwrap();

        // the writer sees its slot, the base version is untouched
        assert_eq!(dir.find(root2, PageId(10)).unwrap(), Some(new_slot));
        assert_eq!(dir.find(root1, PageId(10)).unwrap(), Some(v1_slots[&10]));
        for k in 0..60u64 {
            if k != 10 {
                assert_eq!(dir.find(root2, PageId(k)).unwrap(), Some(v1_slots[&k]));
            }
        }
        validate(&dir, &pages, root1);
        validate(&dir, &pages, root2);

        // only the written path was cloned, not the whole tree
        let mut v2_nodes = 0;
        dir.walk_tree(root2, &mut |node, _| {
            if node.version() == v2 {
                v2_nodes += 1;
            }
        })
        .unwrap();
        let mut depth = 0;
        dir.walk_tree(root2, &mut |node, d| {
            if node.is_leaf() {
                depth = depth.max(d + 1);
            }
        })
        .unwrap();
        assert_eq!(v2_nodes, depth, "exactly one cloned node per level");
    }

    #[test]
    fn test_delete_tree_releases_shared_structure() {
        let (mut dir, pages) = setup();
        let v1 = VersionId(1);
        let v2 = VersionId(2);
        let mut root1 = dir.create_root(v1);
        for k in 0..60u64 {
            put(&mut dir, &pages, &mut root1, v1, k);
        }
        let pages_before = pages.len();
        let nodes_before = dir.len();

        let mut root2 = dir.clone_root(root1, v2, &pages).unwrap();
        let fresh = pages.install(PageId(10), v2, 8).unwrap();
        let old = dir
            .assign(
                &mut root2,
                v2,
                &pages,
                PageId(10),
                PageSlot { ptr: fresh, version: v2 },
            )
            .unwrap();
        pages.unref_page(old.unwrap().ptr).unwrap();

        // dropping the branch returns the directory to its old footprint
        dir.delete_tree(root2, &pages).unwrap();
        assert_eq!(dir.len(), nodes_before);
        assert_eq!(pages.len(), pages_before);
        validate(&dir, &pages, root1);

        // dropping the base version empties everything
        dir.delete_tree(root1, &pages).unwrap();
        assert!(dir.is_empty());
        assert!(pages.is_empty());
    }

    #[test]
    fn test_slot_codec_round_trip() {
        let codec = SlotCodec;
        let slot = PageSlot {
            ptr: PagePtr(0xDEAD_BEEF),
            version: VersionId(42),
        };
        let mut buf = Vec::new();
        codec.encode(&slot, &mut buf).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(codec.decode(&buf).unwrap(), slot);
        assert!(codec.decode(&buf[..8]).is_err());
    }
}
