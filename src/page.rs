//! Physical page storage.
//!
//! The arena owns every materialized page object, keyed by [`PagePtr`].
//! Pages are reference counted: one reference per directory entry pointing
//! at the page plus one per live guard-pool pin. A page's memory is charged
//! against the block allocator on install and released when its refcount
//! reaches zero.

use crate::alloc::{Allocation, BlockAllocator};
use crate::error::{Result, StoreError};
use crate::ids::{PageId, PagePtr, VersionId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// One materialized page.
#[derive(Debug)]
struct Page {
    id: PageId,
    version: VersionId,
    refs: i64,
    data: Vec<u8>,
    charge: Allocation,
}

/// Arena of physical pages, shared by all snapshots of a store.
#[derive(Debug)]
pub struct PageArena {
    pages: DashMap<PagePtr, Page>,
    next_ptr: AtomicU64,
    alloc: Arc<BlockAllocator>,
}

impl PageArena {
    pub fn new(alloc: Arc<BlockAllocator>) -> Self {
        Self {
            pages: DashMap::new(),
            next_ptr: AtomicU64::new(1),
            alloc,
        }
    }

    fn fresh_ptr(&self) -> PagePtr {
        PagePtr(self.next_ptr.fetch_add(1, Ordering::Relaxed))
    }

    /// Materializes a new zero-filled page of `size` bytes with an initial
    /// refcount of 1. Fails with `OutOfMemory` before anything is stored.
    pub fn install(&self, id: PageId, version: VersionId, size: usize) -> Result<PagePtr> {
        let charge = self.alloc.allocate(size)?;
        let ptr = self.fresh_ptr();
        self.pages.insert(
            ptr,
            Page {
                id,
                version,
                refs: 1,
                data: vec![0u8; size],
                charge,
            },
        );
        trace!(%id, %ptr, size, "page installed");
        Ok(ptr)
    }

    /// Copy-on-write clone: a new physical page with the same logical id
    /// and a copy of the data, stamped with `version`, refcount 1.
    pub fn clone_page(&self, ptr: PagePtr, version: VersionId) -> Result<PagePtr> {
        let (id, data) = {
            let page = self
                .pages
                .get(&ptr)
                .ok_or_else(|| StoreError::corrupt(format!("clone of unknown {ptr}")))?;
            (page.id, page.data.clone())
        };
        let charge = self.alloc.allocate(data.len())?;
        let new_ptr = self.fresh_ptr();
        self.pages.insert(
            new_ptr,
            Page {
                id,
                version,
                refs: 1,
                data,
                charge,
            },
        );
        trace!(%id, from = %ptr, to = %new_ptr, %version, "page cloned");
        Ok(new_ptr)
    }

    pub fn ref_page(&self, ptr: PagePtr) -> Result<i64> {
        let mut page = self
            .pages
            .get_mut(&ptr)
            .ok_or_else(|| StoreError::corrupt(format!("ref of unknown {ptr}")))?;
        page.refs += 1;
        Ok(page.refs)
    }

    /// Drops one reference. At zero the page is removed and its memory
    /// charge released; a negative count is a refcounting bug and reported
    /// as `ConsistencyViolation`.
    pub fn unref_page(&self, ptr: PagePtr) -> Result<i64> {
        let refs = {
            let mut page = self
                .pages
                .get_mut(&ptr)
                .ok_or_else(|| StoreError::corrupt(format!("unref of unknown {ptr}")))?;
            page.refs -= 1;
            page.refs
        };
        if refs < 0 {
            return Err(StoreError::corrupt(format!(
                "refcount of {ptr} dropped below zero"
            )));
        }
        if refs == 0 {
            if let Some((_, page)) = self.pages.remove(&ptr) {
                trace!(id = %page.id, %ptr, "page deallocated");
                self.alloc.free(page.charge);
            }
        }
        Ok(refs)
    }

    pub fn contains(&self, ptr: PagePtr) -> bool {
        self.pages.contains_key(&ptr)
    }

    pub fn refs(&self, ptr: PagePtr) -> Result<i64> {
        self.pages
            .get(&ptr)
            .map(|p| p.refs)
            .ok_or_else(|| StoreError::corrupt(format!("refs of unknown {ptr}")))
    }

    pub fn version(&self, ptr: PagePtr) -> Result<VersionId> {
        self.pages
            .get(&ptr)
            .map(|p| p.version)
            .ok_or_else(|| StoreError::corrupt(format!("version of unknown {ptr}")))
    }

    pub fn size(&self, ptr: PagePtr) -> Result<usize> {
        self.pages
            .get(&ptr)
            .map(|p| p.data.len())
            .ok_or_else(|| StoreError::corrupt(format!("size of unknown {ptr}")))
    }

    /// Runs `f` over the page's bytes.
    pub fn with_data<R>(&self, ptr: PagePtr, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let page = self
            .pages
            .get(&ptr)
            .ok_or_else(|| StoreError::corrupt(format!("read of unknown {ptr}")))?;
        Ok(f(&page.data))
    }

    /// Runs `f` over the page's bytes mutably.
    pub fn with_data_mut<R>(&self, ptr: PagePtr, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut page = self
            .pages
            .get_mut(&ptr)
            .ok_or_else(|| StoreError::corrupt(format!("write of unknown {ptr}")))?;
        Ok(f(&mut page.data))
    }

    /// Resizes the page payload, re-charging the allocator for the new
    /// size. On `OutOfMemory` the page is untouched. Grown space is
    /// zero-filled; shrinking truncates.
    pub fn resize(&self, ptr: PagePtr, new_size: usize) -> Result<()> {
        let new_charge = self.alloc.allocate(new_size)?;
        let mut page = match self.pages.get_mut(&ptr) {
            Some(page) => page,
            None => {
                self.alloc.free(new_charge);
                return Err(StoreError::corrupt(format!("resize of unknown {ptr}")));
            }
        };
        page.data.resize(new_size, 0);
        let old_charge = std::mem::replace(&mut page.charge, new_charge);
        drop(page);
        self.alloc.free(old_charge);
        Ok(())
    }

    /// Number of live pages, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
