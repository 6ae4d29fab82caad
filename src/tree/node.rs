//! Directory tree nodes and their intra-node algorithms.
//!
//! A node is a fixed-capacity sorted run of keys plus, depending on shape,
//! either child node ids (branch) or payload values (leaf). On top of the
//! keys sits a coarse index: one entry per block of `index_block` keys
//! holding that block's maximum, which lets [`Node::find_key`] skip whole
//! blocks before scanning within one.
//!
//! Nodes are the unit of structural sharing. A node is mutated only while
//! its refcount is 1 and its version matches the writing snapshot;
//! otherwise the directory clones it first (see
//! [`directory`](crate::tree::directory)).

use crate::codec::PayloadCodec;
use crate::error::{Result, StoreError};
use crate::ids::{NodeId, PageId, VersionId};
use std::fmt;
use std::io::{Read, Write};

/// Key type stored in directory tree nodes.
pub trait NodeKey: Copy + Ord + Default + fmt::Debug {
    /// Writes the key's fixed-width encoding.
    fn encode(&self, w: &mut dyn Write) -> std::io::Result<()>;
    /// Reads one key back.
    fn decode(r: &mut dyn Read) -> std::io::Result<Self>;
}

impl NodeKey for u64 {
    fn encode(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_all(&self.to_le_bytes())
    }

    fn decode(r: &mut dyn Read) -> std::io::Result<Self> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl NodeKey for PageId {
    fn encode(&self, w: &mut dyn Write) -> std::io::Result<()> {
        self.0.encode(w)
    }

    fn decode(r: &mut dyn Read) -> std::io::Result<Self> {
        Ok(PageId(u64::decode(r)?))
    }
}

/// Node shape tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Branch,
    Leaf,
}

/// Shape-specific entry storage, parallel to the key array.
#[derive(Debug, Clone)]
pub enum Entries<V> {
    /// `children[i]` is reachable for keys up to and including `keys[i]`.
    Branch(Vec<NodeId>),
    /// `values[i]` is the payload for `keys[i]`.
    Leaf(Vec<V>),
}

/// One directory tree node.
#[derive(Debug, Clone)]
pub struct Node<K, V> {
    id: NodeId,
    version: VersionId,
    capacity: usize,
    index_block: usize,
    /// Root metadata: total entry count of the tree. Maintained on the
    /// root node only; carried along when the root changes.
    meta_size: i64,
    refs: i64,
    keys: Vec<K>,
    index: Vec<K>,
    entries: Entries<V>,
}

impl<K: NodeKey, V: Clone> Node<K, V> {
    pub fn new_leaf(id: NodeId, version: VersionId, capacity: usize, index_block: usize) -> Self {
        Self {
            id,
            version,
            capacity,
            index_block,
            meta_size: 0,
            refs: 0,
            keys: Vec::with_capacity(capacity),
            index: Vec::new(),
            entries: Entries::Leaf(Vec::with_capacity(capacity)),
        }
    }

    pub fn new_branch(id: NodeId, version: VersionId, capacity: usize, index_block: usize) -> Self {
        Self {
            id,
            version,
            capacity,
            index_block,
            meta_size: 0,
            refs: 0,
            keys: Vec::with_capacity(capacity),
            index: Vec::new(),
            entries: Entries::Branch(Vec::with_capacity(capacity)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    pub(crate) fn set_id(&mut self, id: NodeId) {
        self.id = id;
    }

    pub(crate) fn set_version(&mut self, version: VersionId) {
        self.version = version;
    }

    pub fn node_type(&self) -> NodeType {
        match self.entries {
            Entries::Branch(_) => NodeType::Branch,
            Entries::Leaf(_) => NodeType::Leaf,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.entries, Entries::Leaf(_))
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.entries, Entries::Branch(_))
    }

    pub fn size(&self) -> usize {
        self.keys.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left in this node.
    pub fn remaining(&self) -> usize {
        self.capacity - self.keys.len()
    }

    pub fn is_full(&self) -> bool {
        self.keys.len() == self.capacity
    }

    pub fn has_space(&self) -> bool {
        self.keys.len() < self.capacity
    }

    /// Merge heuristic: half full or less.
    pub fn should_merge(&self) -> bool {
        self.keys.len() <= self.capacity / 2
    }

    pub fn can_merge_with(&self, other: &Self) -> bool {
        self.keys.len() + other.keys.len() <= self.capacity
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn key(&self, idx: usize) -> K {
        self.keys[idx]
    }

    pub fn min_key(&self) -> K {
        self.keys[0]
    }

    pub fn max_key(&self) -> K {
        self.keys[self.keys.len() - 1]
    }

    pub(crate) fn set_key(&mut self, idx: usize, key: K) {
        self.keys[idx] = key;
    }

    /// Root metadata accessors.
    pub fn meta_size(&self) -> i64 {
        self.meta_size
    }

    pub(crate) fn set_meta_size(&mut self, size: i64) {
        self.meta_size = size;
    }

    pub(crate) fn add_meta_size(&mut self, delta: i64) {
        self.meta_size += delta;
    }

    pub fn refs(&self) -> i64 {
        self.refs
    }

    pub(crate) fn ref_node(&mut self) -> i64 {
        self.refs += 1;
        self.refs
    }

    pub(crate) fn unref_node(&mut self) -> i64 {
        self.refs -= 1;
        self.refs
    }

    pub(crate) fn clear_refs(&mut self) {
        self.refs = 0;
    }

    /// Returns the smallest `i` such that `keys[i] >= key`, or `size()` if
    /// no key qualifies. Equal keys resolve to the first matching index.
    ///
    /// The coarse index is consulted first: blocks whose maximum is below
    /// `key` are skipped without touching their keys.
    pub fn find_key(&self, key: &K) -> usize {
        let size = self.keys.len();
        let blocks = self.index.len();

        let mut block = 0usize;
        for b in 0..blocks {
            if *key > self.index[b] {
                block += 1;
            }
        }

        if block >= blocks {
            return size;
        }

        let start = block * self.index_block;
        let end = (start + self.index_block).min(size);
        let mut pos = start;
        for c in start..end {
            if *key > self.keys[c] {
                pos += 1;
            }
        }
        pos
    }

    /// Recomputes the coarse index from scratch in O(size).
    ///
    /// Keys are sorted ascending, so each block's maximum is its last key.
    /// Every structural mutation ends with a reindex; the consistency
    /// checker recomputes the same values and flags any mismatch.
    pub fn reindex(&mut self) {
        self.index.clear();
        let size = self.keys.len();
        if size == 0 {
            return;
        }
        let blocks = (size + self.index_block - 1) / self.index_block;
        for b in 0..blocks {
            let end = ((b + 1) * self.index_block).min(size);
            self.index.push(self.keys[end - 1]);
        }
    }

    pub(crate) fn index_blocks(&self) -> &[K] {
        &self.index
    }

    /// Inserts a leaf entry at `idx`. Precondition: leaf shape, space left.
    pub fn insert_leaf(&mut self, idx: usize, key: K, value: V) {
        debug_assert!(self.has_space());
        match &mut self.entries {
            Entries::Leaf(values) => values.insert(idx, value),
            Entries::Branch(_) => unreachable!("leaf insert on branch node"),
        }
        self.keys.insert(idx, key);
        self.reindex();
    }

    /// Inserts a child reference at `idx`. Precondition: branch shape,
    /// space left. Refcounting of the child is the directory's business.
    pub fn insert_child(&mut self, idx: usize, key: K, child: NodeId) {
        debug_assert!(self.has_space());
        match &mut self.entries {
            Entries::Branch(children) => children.insert(idx, child),
            Entries::Leaf(_) => unreachable!("child insert on leaf node"),
        }
        self.keys.insert(idx, key);
        self.reindex();
    }

    /// Removes entries in `[start, end)` from both parallel arrays.
    pub fn remove_entries(&mut self, start: usize, end: usize) {
        self.keys.drain(start..end);
        match &mut self.entries {
            Entries::Branch(children) => {
                children.drain(start..end);
            }
            Entries::Leaf(values) => {
                values.drain(start..end);
            }
        }
        self.reindex();
    }

    /// Moves entries `[at, size)` into `other` (which must be empty and of
    /// the same shape), truncating `self` to `at` entries.
    pub fn split_to(&mut self, at: usize, other: &mut Self) {
        debug_assert_eq!(other.size(), 0);
        other.keys.extend(self.keys.drain(at..));
        match (&mut self.entries, &mut other.entries) {
            (Entries::Branch(src), Entries::Branch(dst)) => dst.extend(src.drain(at..)),
            (Entries::Leaf(src), Entries::Leaf(dst)) => dst.extend(src.drain(at..)),
            _ => unreachable!("split across node shapes"),
        }
        self.reindex();
        other.reindex();
    }

    /// Appends all of `other`'s entries to `self`. Precondition checked by
    /// [`can_merge_with`](Self::can_merge_with).
    pub fn merge_from(&mut self, mut other: Self) {
        debug_assert!(self.can_merge_with(&other));
        self.keys.append(&mut other.keys);
        match (&mut self.entries, &mut other.entries) {
            (Entries::Branch(dst), Entries::Branch(src)) => dst.append(src),
            (Entries::Leaf(dst), Entries::Leaf(src)) => dst.append(src),
            _ => unreachable!("merge across node shapes"),
        }
        self.reindex();
    }

    /// Branch: the child covering `key` (last child when `key` exceeds
    /// every separator).
    pub fn find_child(&self, key: &K) -> NodeId {
        let mut idx = self.find_key(key);
        if idx == self.keys.len() {
            idx = self.keys.len() - 1;
        }
        self.child(idx)
    }

    /// Branch: position of `child` among this node's children.
    pub fn find_child_node(&self, child: NodeId) -> Option<usize> {
        match &self.entries {
            Entries::Branch(children) => children.iter().position(|c| *c == child),
            Entries::Leaf(_) => None,
        }
    }

    pub fn child(&self, idx: usize) -> NodeId {
        match &self.entries {
            Entries::Branch(children) => children[idx],
            Entries::Leaf(_) => unreachable!("child access on leaf node"),
        }
    }

    pub(crate) fn set_child(&mut self, idx: usize, child: NodeId) {
        match &mut self.entries {
            Entries::Branch(children) => children[idx] = child,
            Entries::Leaf(_) => unreachable!("child access on leaf node"),
        }
    }

    pub fn first_child(&self) -> NodeId {
        self.child(0)
    }

    pub fn last_child(&self) -> NodeId {
        self.child(self.keys.len() - 1)
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.entries {
            Entries::Branch(children) => children,
            Entries::Leaf(_) => &[],
        }
    }

    pub fn value(&self, idx: usize) -> &V {
        match &self.entries {
            Entries::Leaf(values) => &values[idx],
            Entries::Branch(_) => unreachable!("value access on branch node"),
        }
    }

    pub(crate) fn set_value(&mut self, idx: usize, value: V) -> V {
        match &mut self.entries {
            Entries::Leaf(values) => std::mem::replace(&mut values[idx], value),
            Entries::Branch(_) => unreachable!("value access on branch node"),
        }
    }

    pub fn values(&self) -> &[V] {
        match &self.entries {
            Entries::Leaf(values) => values,
            Entries::Branch(_) => &[],
        }
    }

    /// Writes this node to a byte stream.
    ///
    /// Field order is fixed: root-metadata-size, node type tag, node id,
    /// version id, size, refcount, then the occupied index blocks, then the
    /// keys, then children ids (branch) or codec-encoded payloads (leaf).
    pub fn write_to(&self, w: &mut dyn Write, codec: &dyn PayloadCodec<V>) -> Result<()> {
        w.write_all(&self.meta_size.to_le_bytes())?;
        let tag: u8 = match self.node_type() {
            NodeType::Branch => 0,
            NodeType::Leaf => 1,
        };
        w.write_all(&[tag])?;
        w.write_all(&self.id.0.to_le_bytes())?;
        w.write_all(&self.version.0.to_le_bytes())?;
        w.write_all(&(self.keys.len() as u32).to_le_bytes())?;
        w.write_all(&self.refs.to_le_bytes())?;

        for block_max in &self.index {
            block_max.encode(w)?;
        }
        for key in &self.keys {
            key.encode(w)?;
        }

        match &self.entries {
            Entries::Branch(children) => {
                for child in children {
                    w.write_all(&child.0.to_le_bytes())?;
                }
            }
            Entries::Leaf(values) => {
                let mut buf = Vec::new();
                for value in values {
                    buf.clear();
                    codec.encode(value, &mut buf)?;
                    w.write_all(&(buf.len() as u32).to_le_bytes())?;
                    w.write_all(&buf)?;
                }
            }
        }
        Ok(())
    }

    /// Reads a node back from a byte stream written by
    /// [`write_to`](Self::write_to). `capacity` and `index_block` are node
    /// size-class parameters and are not part of the wire format.
    pub fn read_from(
        r: &mut dyn Read,
        capacity: usize,
        index_block: usize,
        codec: &dyn PayloadCodec<V>,
    ) -> Result<Self> {
        let meta_size = read_i64(r)?;
        let tag = read_u8(r)?;
        let id = NodeId(read_u64(r)?);
        let version = VersionId(read_u64(r)?);
        let size = read_u32(r)? as usize;
        let refs = read_i64(r)?;

        if size > capacity {
            return Err(StoreError::corrupt(format!(
                "serialized node {id} has size {size} over capacity {capacity}"
            )));
        }

        let blocks = if size == 0 {
            0
        } else {
            (size + index_block - 1) / index_block
        };
        let mut index = Vec::with_capacity(blocks);
        for _ in 0..blocks {
            index.push(K::decode(r)?);
        }
        let mut keys = Vec::with_capacity(capacity);
        for _ in 0..size {
            keys.push(K::decode(r)?);
        }

        let entries = match tag {
            0 => {
                let mut children = Vec::with_capacity(capacity);
                for _ in 0..size {
                    children.push(NodeId(read_u64(r)?));
                }
                Entries::Branch(children)
            }
            1 => {
                let mut values = Vec::with_capacity(capacity);
                for _ in 0..size {
                    let len = read_u32(r)? as usize;
                    let mut buf = vec![0u8; len];
                    r.read_exact(&mut buf)?;
                    values.push(codec.decode(&buf)?);
                }
                Entries::Leaf(values)
            }
            other => {
                return Err(StoreError::corrupt(format!(
                    "unknown node type tag {other}"
                )))
            }
        };

        Ok(Self {
            id,
            version,
            capacity,
            index_block,
            meta_size,
            refs,
            keys,
            index,
            entries,
        })
    }
}

fn read_u8(r: &mut dyn Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut dyn Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut dyn Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64(r: &mut dyn Read) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}
