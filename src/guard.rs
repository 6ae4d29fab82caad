//! Bounded page guard pool.
//!
//! Each snapshot owns one pool of at most `guard_pool_capacity` slots. A
//! slot pins one physical page (holding one page reference) and is shared
//! by every [`PageGuard`](crate::snapshot::PageGuard) handle for the same
//! logical page: re-acquiring a page already in the pool bumps the slot's
//! count instead of taking a second pin. The pool never grows; running out
//! of slots is reported as [`StoreError::GuardPoolExhausted`].

use crate::error::{Result, StoreError};
use crate::ids::{PageId, PagePtr};
use std::collections::HashMap;

/// Access mode a guard slot was acquired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// The pinned page belongs to an older version; writes must go through
    /// copy-on-write first.
    Read,
    /// The pinned page is owned by the snapshot and writable in place.
    Update,
}

/// One occupied pool slot.
#[derive(Debug)]
pub(crate) struct GuardSlot {
    pub id: PageId,
    pub ptr: PagePtr,
    pub state: GuardState,
    refs: usize,
}

/// Fixed-capacity pool of page guard slots, indexed by logical page id.
#[derive(Debug)]
pub(crate) struct GuardPool {
    capacity: usize,
    slots: Vec<Option<GuardSlot>>,
    free: Vec<usize>,
    by_id: HashMap<PageId, usize>,
}

impl GuardPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            capacity,
            slots,
            free: (0..capacity).rev().collect(),
            by_id: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupied slot count.
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    /// Index of the slot already pinning `id`, if any.
    pub fn lookup(&self, id: PageId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Claims a free slot for a newly pinned page, with a handle count of 1.
    pub fn acquire(&mut self, id: PageId, ptr: PagePtr, state: GuardState) -> Result<usize> {
        let idx = self
            .free
            .pop()
            .ok_or(StoreError::GuardPoolExhausted(self.capacity))?;
        self.slots[idx] = Some(GuardSlot {
            id,
            ptr,
            state,
            refs: 1,
        });
        self.by_id.insert(id, idx);
        Ok(idx)
    }

    /// Bumps the handle count of an occupied slot.
    pub fn ref_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.refs += 1;
        }
    }

    /// Drops one handle. When the last handle goes, the slot is freed and
    /// returned so the caller can release the page pin it carried.
    pub fn unref_slot(&mut self, idx: usize) -> Option<GuardSlot> {
        let remaining = {
            let slot = self.slots[idx].as_mut()?;
            slot.refs -= 1;
            slot.refs
        };
        if remaining > 0 {
            return None;
        }
        let slot = self.slots[idx].take()?;
        self.free.push(idx);
        if self.by_id.get(&slot.id) == Some(&idx) {
            self.by_id.remove(&slot.id);
        }
        Some(slot)
    }

    /// Forgets the id index entry for a removed page. Outstanding handles
    /// keep their pin; future lookups no longer find the slot.
    pub fn unindex(&mut self, id: PageId) {
        self.by_id.remove(&id);
    }

    pub fn get(&self, idx: usize) -> Result<&GuardSlot> {
        self.slots[idx]
            .as_ref()
            .ok_or_else(|| StoreError::corrupt(format!("vacant guard slot {idx}")))
    }

    pub fn get_mut(&mut self, idx: usize) -> Result<&mut GuardSlot> {
        self.slots[idx]
            .as_mut()
            .ok_or_else(|| StoreError::corrupt(format!("vacant guard slot {idx}")))
    }

    /// Drains every occupied slot, returning them so the caller can drop
    /// the page pins. Used when a snapshot winds down.
    pub fn drain(&mut self) -> Vec<GuardSlot> {
        let mut out = Vec::new();
        for idx in 0..self.capacity {
            if let Some(slot) = self.slots[idx].take() {
                self.free.push(idx);
                out.push(slot);
            }
        }
        self.by_id.clear();
        out
    }
}
