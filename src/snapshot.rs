//! Snapshots: the transaction surface of the store.
//!
//! A [`Snapshot`] is a handle on one version. Committed versions are
//! readable and can be [`branch`](Snapshot::branch)ed; the branch is a new
//! active version that sees everything its parent committed and can be
//! written through [`get_for_update`](Snapshot::get_for_update),
//! [`create`](Snapshot::create) and [`remove`](Snapshot::remove) until it
//! is committed or rolled back. Writes never touch shared state: the first
//! write to an inherited page clones it, and the directory path leading to
//! it, under the writing version.
//!
//! Pages are handed out as [`PageGuard`]s backed by the snapshot's bounded
//! guard pool: each distinct page pins one pool slot and one page
//! reference, shared by all guard handles for that page.

use crate::error::{Result, StoreError};
use crate::guard::{GuardPool, GuardState};
use crate::history::VersionStatus;
use crate::ids::{NodeId, PageId, PagePtr, VersionId};
use crate::store::StoreShared;
use crate::tree::directory::PageSlot;
use crate::tree::node::NodeType;
use crate::tree::DirNode;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// State shared between a [`Snapshot`] and its outstanding [`PageGuard`]s.
pub(crate) struct SnapInner {
    store: Arc<StoreShared>,
    version: VersionId,
    guards: Mutex<GuardPool>,
}

/// Handle on one version of the store.
pub struct Snapshot {
    inner: Arc<SnapInner>,
}

/// Visitor for [`Snapshot::walk`]. All methods default to no-ops so a
/// walker only implements the levels it cares about.
pub trait SnapshotWalker {
    fn begin_snapshot(&mut self, _version: VersionId) {}
    fn branch_node(&mut self, _node: &DirNode, _depth: usize) {}
    fn leaf_node(&mut self, _node: &DirNode, _depth: usize) {}
    fn page(&mut self, _id: PageId, _slot: PageSlot, _data: &[u8]) {}
    fn end_snapshot(&mut self, _version: VersionId) {}
}

impl Snapshot {
    pub(crate) fn new(store: Arc<StoreShared>, version: VersionId) -> Self {
        let capacity = store.config.guard_pool_capacity;
        Self {
            inner: Arc::new(SnapInner {
                store,
                version,
                guards: Mutex::new(GuardPool::new(capacity)),
            }),
        }
    }

    pub fn version(&self) -> VersionId {
        self.inner.version
    }

    pub fn status(&self) -> Result<VersionStatus> {
        let history = self.inner.store.history.read();
        Ok(history.node(self.inner.version)?.status())
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.status()? == VersionStatus::Active)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status()? {
            VersionStatus::Active => Ok(()),
            other => Err(StoreError::invalid_state(format!(
                "{} is {other:?}, not writable",
                self.inner.version
            ))),
        }
    }

    fn root(&self) -> Result<NodeId> {
        let history = self.inner.store.history.read();
        history
            .node(self.inner.version)?
            .root()
            .ok_or_else(|| {
                StoreError::invalid_state(format!(
                    "{} has been rolled back",
                    self.inner.version
                ))
            })
    }

    fn dir_find(&self, id: PageId) -> Result<Option<PageSlot>> {
        let root = self.root()?;
        let dir = self.inner.store.dir.read();
        dir.find(root, id)
    }

    /// Runs a mutating directory operation under this version's root,
    /// writing the (possibly grown or collapsed) root back afterwards.
    fn with_dir_mut<R>(
        &self,
        f: impl FnOnce(&mut crate::tree::Directory, &mut NodeId) -> Result<R>,
    ) -> Result<R> {
        let store = &self.inner.store;
        let mut history = store.history.write();
        let mut root = history
            .node(self.inner.version)?
            .root()
            .ok_or_else(|| {
                StoreError::invalid_state(format!(
                    "{} has been rolled back",
                    self.inner.version
                ))
            })?;
        let result = {
            let mut dir = store.dir.write();
            f(&mut dir, &mut root)?
        };
        history.node_mut(self.inner.version)?.set_root(Some(root));
        Ok(result)
    }

    fn make_guard(&self, idx: usize, id: PageId) -> PageGuard {
        PageGuard {
            snap: self.inner.clone(),
            idx,
            id,
        }
    }

    /// Read access to a page. Pages owned by this version come back
    /// writable; inherited ones come back read-only until
    /// [`get_for_update`](Self::get_for_update) clones them.
    pub fn get(&self, id: PageId) -> Result<PageGuard> {
        let mut guards = self.inner.guards.lock();
        if let Some(idx) = guards.lookup(id) {
            guards.ref_slot(idx);
            return Ok(self.make_guard(idx, id));
        }
        if guards.in_use() == guards.capacity() {
            return Err(StoreError::GuardPoolExhausted(guards.capacity()));
        }

        let slot = self.dir_find(id)?.ok_or(StoreError::PageNotFound(id))?;
        let state = if slot.version == self.inner.version {
            GuardState::Update
        } else {
            GuardState::Read
        };
        self.inner.store.pages.ref_page(slot.ptr)?;
        let idx = guards.acquire(id, slot.ptr, state)?;
        Ok(self.make_guard(idx, id))
    }

    /// Write access to a page. The first call for an inherited page clones
    /// it under this version and repoints the directory; every already
    /// outstanding guard for the page follows the upgrade.
    pub fn get_for_update(&self, id: PageId) -> Result<PageGuard> {
        self.ensure_active()?;
        let store = &self.inner.store;
        let version = self.inner.version;
        let mut guards = self.inner.guards.lock();

        if let Some(idx) = guards.lookup(id) {
            let (state, old_ptr) = {
                let slot = guards.get(idx)?;
                (slot.state, slot.ptr)
            };
            if state == GuardState::Update {
                guards.ref_slot(idx);
                return Ok(self.make_guard(idx, id));
            }
            // upgrade a read pin: clone, repoint the directory, swap the pin
            let new_ptr = store.pages.clone_page(old_ptr, version)?;
            let old_entry = self.with_dir_mut(|dir, root| {
                dir.assign(
                    root,
                    version,
                    &store.pages,
                    id,
                    PageSlot {
                        ptr: new_ptr,
                        version,
                    },
                )
            })?;
            if let Some(old) = old_entry {
                store.pages.unref_page(old.ptr)?;
            }
            store.pages.ref_page(new_ptr)?;
            store.pages.unref_page(old_ptr)?;
            let slot = guards.get_mut(idx)?;
            slot.ptr = new_ptr;
            slot.state = GuardState::Update;
            guards.ref_slot(idx);
            debug!(%id, %version, from = %old_ptr, to = %new_ptr, "page cloned for update");
            return Ok(self.make_guard(idx, id));
        }

        if guards.in_use() == guards.capacity() {
            return Err(StoreError::GuardPoolExhausted(guards.capacity()));
        }
        let slot = self.dir_find(id)?.ok_or(StoreError::PageNotFound(id))?;
        let ptr = if slot.version == version {
            slot.ptr
        } else {
            let new_ptr = store.pages.clone_page(slot.ptr, version)?;
            let old_entry = self.with_dir_mut(|dir, root| {
                dir.assign(
                    root,
                    version,
                    &store.pages,
                    id,
                    PageSlot {
                        ptr: new_ptr,
                        version,
                    },
                )
            })?;
            if let Some(old) = old_entry {
                store.pages.unref_page(old.ptr)?;
            }
            debug!(%id, %version, from = %slot.ptr, to = %new_ptr, "page cloned for update");
            new_ptr
        };
        store.pages.ref_page(ptr)?;
        let idx = guards.acquire(id, ptr, GuardState::Update)?;
        Ok(self.make_guard(idx, id))
    }

    /// Creates a fresh page of `size` bytes (the configured default when 0)
    /// and returns a writable guard on it. Fails with `OutOfMemory` before
    /// anything is registered.
    pub fn create(&self, size: usize) -> Result<PageGuard> {
        self.ensure_active()?;
        let store = &self.inner.store;
        let version = self.inner.version;
        let size = if size == 0 {
            store.config.default_page_size
        } else {
            size
        };

        let mut guards = self.inner.guards.lock();
        if guards.in_use() == guards.capacity() {
            return Err(StoreError::GuardPoolExhausted(guards.capacity()));
        }

        let id = store.fresh_page_id();
        // the install's initial reference becomes the directory's
        let ptr = store.pages.install(id, version, size)?;
        self.with_dir_mut(|dir, root| {
            dir.assign(root, version, &store.pages, id, PageSlot { ptr, version })
        })?;
        store.pages.ref_page(ptr)?;
        let idx = guards.acquire(id, ptr, GuardState::Update)?;
        debug!(%id, %ptr, size, %version, "page created");
        Ok(self.make_guard(idx, id))
    }

    /// Unbinds `id` from this version. Outstanding guards keep their pins;
    /// the physical page goes away once the last reference drops.
    pub fn remove(&self, id: PageId) -> Result<()> {
        self.ensure_active()?;
        let store = &self.inner.store;
        let version = self.inner.version;
        let mut guards = self.inner.guards.lock();

        let removed =
            self.with_dir_mut(|dir, root| dir.remove(root, version, &store.pages, id))?;
        if !removed {
            return Err(StoreError::PageNotFound(id));
        }
        guards.unindex(id);
        debug!(%id, %version, "page removed");
        Ok(())
    }

    /// Resizes the page behind an update guard taken from this snapshot.
    pub fn resize(&self, guard: &PageGuard, new_size: usize) -> Result<()> {
        self.ensure_active()?;
        if !Arc::ptr_eq(&guard.snap, &self.inner) {
            return Err(StoreError::invalid_state(
                "guard belongs to a different snapshot",
            ));
        }
        let guards = self.inner.guards.lock();
        let slot = guards.get(guard.idx)?;
        if slot.state != GuardState::Update {
            return Err(StoreError::invalid_state(format!(
                "{} is not held for update",
                guard.id
            )));
        }
        self.inner.store.pages.resize(slot.ptr, new_size)
    }

    /// Commits this version: it becomes immutable, branchable, and the new
    /// master.
    pub fn commit(&self) -> Result<VersionId> {
        self.ensure_active()?;
        let mut history = self.inner.store.history.write();
        history
            .node_mut(self.inner.version)?
            .set_status(VersionStatus::Committed);
        history.set_master(self.inner.version);
        debug!(version = %self.inner.version, "committed");
        Ok(self.inner.version)
    }

    /// Discards this version. Every node and page reference it privately
    /// holds is released; structure shared with ancestors survives.
    pub fn rollback(&self) -> Result<()> {
        self.ensure_active()?;
        let store = &self.inner.store;
        let mut guards = self.inner.guards.lock();
        let pins = guards.drain();

        let root = {
            let mut history = store.history.write();
            let node = history.node_mut(self.inner.version)?;
            let root = node.root().ok_or_else(|| {
                StoreError::corrupt(format!("{} has no root", self.inner.version))
            })?;
            node.set_status(VersionStatus::RolledBack);
            node.set_root(None);
            root
        };
        {
            let mut dir = store.dir.write();
            dir.delete_tree(root, &store.pages)?;
        }
        for pin in pins {
            store.pages.unref_page(pin.ptr)?;
        }
        debug!(version = %self.inner.version, "rolled back");
        Ok(())
    }

    /// Branches a new active version off this (committed) one. The new
    /// version starts from a clone of this version's directory root and
    /// shares everything below it.
    pub fn branch(&self) -> Result<Snapshot> {
        let store = &self.inner.store;
        {
            let history = store.history.read();
            let status = history.node(self.inner.version)?.status();
            if status != VersionStatus::Committed {
                return Err(StoreError::invalid_state(format!(
                    "cannot branch {}: version is {status:?}",
                    self.inner.version
                )));
            }
        }
        let version = store.fresh_version();
        let mut history = store.history.write();
        let parent_root = history
            .node(self.inner.version)?
            .root()
            .ok_or_else(|| {
                StoreError::corrupt(format!("{} has no root", self.inner.version))
            })?;
        let root = {
            let mut dir = store.dir.write();
            dir.clone_root(parent_root, version, &store.pages)?
        };
        history.add_branch(self.inner.version, version, root)?;
        drop(history);
        debug!(parent = %self.inner.version, %version, "branched");
        Ok(Snapshot::new(store.clone(), version))
    }

    // --- named roots ---

    /// Resolves a named root, falling through to ancestor versions.
    pub fn get_root(&self, name: &str) -> Result<Option<PageId>> {
        let history = self.inner.store.history.read();
        history.get_root(self.inner.version, name)
    }

    pub fn has_root(&self, name: &str) -> Result<bool> {
        let history = self.inner.store.history.read();
        history.has_root(self.inner.version, name)
    }

    /// Binds (`Some`) or unbinds (`None`) a named root in this version.
    pub fn set_root(&self, name: &str, id: Option<PageId>) -> Result<()> {
        self.ensure_active()?;
        let mut history = self.inner.store.history.write();
        history.set_root(self.inner.version, name, id)
    }

    /// Records that an inherited named root is being updated by this
    /// version without rebinding it to a new page id.
    pub fn mark_updated(&self, name: &str) -> Result<()> {
        self.ensure_active()?;
        let mut history = self.inner.store.history.write();
        history.mark_updated(self.inner.version, name)
    }

    // --- diagnostics ---

    /// Physical location of `id` as seen by this version.
    pub fn occupant(&self, id: PageId) -> Result<(PagePtr, VersionId)> {
        let slot = self.dir_find(id)?.ok_or(StoreError::PageNotFound(id))?;
        Ok((slot.ptr, slot.version))
    }

    /// Verifies the structural invariants of everything this version can
    /// see. Violations are logged and reported as `Ok(false)`; `Err` is
    /// reserved for being unable to run the check at all.
    pub fn check(&self) -> Result<bool> {
        let store = &self.inner.store;
        let root = self.root()?;
        let history = store.history.read();
        let dir = store.dir.read();

        let mut ok = true;
        let total = self.check_node(&dir, &history, root, None, &mut ok)?;
        let meta = dir.node(root)?.meta_size();
        if meta != total as i64 {
            error!(
                version = %self.inner.version,
                meta, total, "root metadata disagrees with leaf entry count"
            );
            ok = false;
        }
        Ok(ok)
    }

    fn check_node(
        &self,
        dir: &crate::tree::Directory,
        history: &crate::history::HistoryGraph,
        id: NodeId,
        expected_max: Option<PageId>,
        ok: &mut bool,
    ) -> Result<usize> {
        let store = &self.inner.store;
        let node = dir.node(id)?;

        if node.refs() < 1 {
            self.flag(id, ok, format!("refcount {} below one", node.refs()));
        }
        for w in node.keys().windows(2) {
            if w[0] >= w[1] {
                self.flag(id, ok, format!("keys out of order: {} then {}", w[0], w[1]));
            }
        }
        let mut recomputed = node.clone();
        recomputed.reindex();
        if node.index_blocks() != recomputed.index_blocks() {
            self.flag(id, ok, "coarse index disagrees with keys".to_string());
        }
        if let Some(expected) = expected_max {
            if node.size() == 0 || node.max_key() != expected {
                self.flag(
                    id,
                    ok,
                    format!("parent separator {expected} disagrees with max key"),
                );
            }
        }
        match history.node(node.version()) {
            Ok(desc) => {
                if desc.status() == VersionStatus::RolledBack {
                    self.flag(id, ok, format!("stamped with rolled back {}", node.version()));
                }
            }
            Err(_) => self.flag(id, ok, format!("stamped with unknown {}", node.version())),
        }

        match node.node_type() {
            NodeType::Branch => {
                let pairs: Vec<(PageId, NodeId)> = node
                    .keys()
                    .iter()
                    .copied()
                    .zip(node.children().iter().copied())
                    .collect();
                let mut total = 0;
                for (sep, child) in pairs {
                    total += self.check_node(dir, history, child, Some(sep), ok)?;
                }
                Ok(total)
            }
            NodeType::Leaf => {
                for (key, slot) in node.keys().iter().zip(node.values()) {
                    if !store.pages.contains(slot.ptr) {
                        self.flag(id, ok, format!("{key} points at missing {}", slot.ptr));
                        continue;
                    }
                    if store.pages.refs(slot.ptr)? < 1 {
                        self.flag(id, ok, format!("{key} points at unreferenced {}", slot.ptr));
                    }
                }
                Ok(node.size())
            }
        }
    }

    fn flag(&self, node: NodeId, ok: &mut bool, msg: String) {
        error!(version = %self.inner.version, %node, "{msg}");
        *ok = false;
    }

    /// Drives `visitor` over this version's directory tree and pages.
    pub fn walk(&self, visitor: &mut dyn SnapshotWalker) -> Result<()> {
        let store = &self.inner.store;
        let root = self.root()?;
        let dir = store.dir.read();
        visitor.begin_snapshot(self.inner.version);
        self.walk_node(&dir, root, 0, visitor)?;
        visitor.end_snapshot(self.inner.version);
        Ok(())
    }

    fn walk_node(
        &self,
        dir: &crate::tree::Directory,
        id: NodeId,
        depth: usize,
        visitor: &mut dyn SnapshotWalker,
    ) -> Result<()> {
        let node = dir.node(id)?;
        match node.node_type() {
            NodeType::Branch => {
                visitor.branch_node(node, depth);
                let children: Vec<NodeId> = node.children().to_vec();
                for child in children {
                    self.walk_node(dir, child, depth + 1, visitor)?;
                }
            }
            NodeType::Leaf => {
                visitor.leaf_node(node, depth);
                let entries: Vec<(PageId, PageSlot)> = node
                    .keys()
                    .iter()
                    .copied()
                    .zip(node.values().iter().copied())
                    .collect();
                for (key, slot) in entries {
                    self.inner
                        .store
                        .pages
                        .with_data(slot.ptr, |data| visitor.page(key, slot, data))?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        // a snapshot dropped while still active loses its work, loudly
        if let Ok(VersionStatus::Active) = self.status() {
            warn!(
                version = %self.inner.version,
                "active snapshot dropped without commit, rolling back"
            );
            if let Err(err) = self.rollback() {
                error!(version = %self.inner.version, %err, "implicit rollback failed");
            }
        }
    }
}

/// Shared handle on one pinned page.
///
/// Cloning is cheap: clones share the pool slot and its pin. The pin is
/// released when the last handle for the page drops.
pub struct PageGuard {
    snap: Arc<SnapInner>,
    idx: usize,
    id: PageId,
}

impl PageGuard {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn state(&self) -> Result<GuardState> {
        let guards = self.snap.guards.lock();
        Ok(guards.get(self.idx)?.state)
    }

    /// Current payload size in bytes.
    pub fn len(&self) -> Result<usize> {
        let guards = self.snap.guards.lock();
        let ptr = guards.get(self.idx)?.ptr;
        self.snap.store.pages.size(ptr)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Runs `f` over the page bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let guards = self.snap.guards.lock();
        let ptr = guards.get(self.idx)?.ptr;
        self.snap.store.pages.with_data(ptr, f)
    }

    /// Runs `f` over the page bytes mutably. Fails with `InvalidState` on a
    /// read-only guard, or once the owning snapshot stopped being active;
    /// take the page through [`Snapshot::get_for_update`] first.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let guards = self.snap.guards.lock();
        let slot = guards.get(self.idx)?;
        if slot.state != GuardState::Update {
            return Err(StoreError::invalid_state(format!(
                "{} is not held for update",
                self.id
            )));
        }
        let status = self.snap.store.history.read().node(self.snap.version)?.status();
        if status != VersionStatus::Active {
            return Err(StoreError::invalid_state(format!(
                "{} is {status:?}, not writable",
                self.snap.version
            )));
        }
        let ptr = slot.ptr;
        self.snap.store.pages.with_data_mut(ptr, f)
    }
}

impl Clone for PageGuard {
    fn clone(&self) -> Self {
        self.snap.guards.lock().ref_slot(self.idx);
        Self {
            snap: self.snap.clone(),
            idx: self.idx,
            id: self.id,
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let released = self.snap.guards.lock().unref_slot(self.idx);
        if let Some(slot) = released {
            if let Err(err) = self.snap.store.pages.unref_page(slot.ptr) {
                // Drop cannot propagate; surface the refcounting bug in logs
                error!(id = %slot.id, ptr = %slot.ptr, %err, "failed to unpin page");
            }
        }
    }
}
