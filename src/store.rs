//! The store: top-level owner of pages, directory, and history.
//!
//! A [`Store`] wires the shared components together and hands out
//! [`Snapshot`]s. The genesis version is committed at construction, so
//! `store.master()?.branch()?` is immediately available as the first
//! writable snapshot.

use crate::alloc::BlockAllocator;
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::history::{HistoryGraph, VersionStatus};
use crate::ids::{PageId, VersionId};
use crate::page::PageArena;
use crate::snapshot::Snapshot;
use crate::tree::Directory;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Components shared by the store and every snapshot spawned from it.
pub(crate) struct StoreShared {
    pub(crate) config: Config,
    pub(crate) alloc: Arc<BlockAllocator>,
    pub(crate) pages: PageArena,
    pub(crate) dir: RwLock<Directory>,
    pub(crate) history: RwLock<HistoryGraph>,
    next_page_id: AtomicU64,
    next_version: AtomicU64,
}

impl StoreShared {
    pub(crate) fn fresh_page_id(&self) -> PageId {
        PageId(self.next_page_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn fresh_version(&self) -> VersionId {
        VersionId(self.next_version.fetch_add(1, Ordering::Relaxed))
    }
}

/// An in-memory multi-version page store.
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    /// Builds a store with an empty, already committed genesis version.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let alloc = Arc::new(BlockAllocator::new(config.memory_ceiling));
        let pages = PageArena::new(alloc.clone());
        let mut dir = Directory::new(config.node_capacity, config.index_block);

        let genesis = VersionId(1);
        let root = dir.create_root(genesis);
        let mut history = HistoryGraph::new(genesis, root);
        history.node_mut(genesis)?.set_status(VersionStatus::Committed);

        info!(
            node_capacity = config.node_capacity,
            memory_ceiling = config.memory_ceiling,
            "store created"
        );
        Ok(Self {
            shared: Arc::new(StoreShared {
                config,
                alloc,
                pages,
                dir: RwLock::new(dir),
                history: RwLock::new(history),
                next_page_id: AtomicU64::new(1),
                next_version: AtomicU64::new(2),
            }),
        })
    }

    /// [`Store::new`] with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(Config::default())
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Read-only snapshot of the most recently committed version.
    pub fn master(&self) -> Result<Snapshot> {
        let master = self.shared.history.read().master();
        Ok(Snapshot::new(self.shared.clone(), master))
    }

    /// Convenience for `master()?.branch()?`: a fresh writable snapshot on
    /// top of the latest committed state.
    pub fn branch(&self) -> Result<Snapshot> {
        self.master()?.branch()
    }

    /// Read-only snapshot of an arbitrary committed version.
    pub fn snapshot(&self, version: VersionId) -> Result<Snapshot> {
        let status = self.shared.history.read().node(version)?.status();
        if status != VersionStatus::Committed {
            return Err(StoreError::invalid_state(format!(
                "cannot open {version}: version is {status:?}"
            )));
        }
        Ok(Snapshot::new(self.shared.clone(), version))
    }

    /// All version ids the history graph knows about, in id order.
    pub fn versions(&self) -> Vec<VersionId> {
        self.shared.history.read().versions()
    }

    pub fn status(&self, version: VersionId) -> Result<VersionStatus> {
        Ok(self.shared.history.read().node(version)?.status())
    }

    /// Bytes currently charged for page payloads.
    pub fn memory_in_use(&self) -> usize {
        self.shared.alloc.in_use()
    }

    /// Live physical pages across all versions.
    pub fn page_count(&self) -> usize {
        self.shared.pages.len()
    }
}
