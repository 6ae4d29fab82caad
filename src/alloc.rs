//! Block allocator with an enforced memory ceiling.
//!
//! Page payload memory is charged against a fixed ceiling; an allocation
//! that would exceed it is rejected with `OutOfMemory` rather than
//! overcommitting. Directory tree nodes are not budgeted here, so
//! structural operations (split, merge, clone) have no internal allocation
//! failure points; a page-level `OutOfMemory` always surfaces before any
//! directory mutation.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;

/// Receipt for one charged allocation. Returned by
/// [`BlockAllocator::allocate`] and consumed by [`BlockAllocator::free`]
/// so that every charge has exactly one matching release.
#[derive(Debug)]
pub struct Allocation {
    size: usize,
}

impl Allocation {
    /// Number of bytes this allocation charged.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Byte-counting allocator enforcing a hard ceiling.
#[derive(Debug)]
pub struct BlockAllocator {
    ceiling: usize,
    in_use: Mutex<usize>,
}

impl BlockAllocator {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            in_use: Mutex::new(0),
        }
    }

    /// Charges `size` bytes against the ceiling.
    ///
    /// Fails with `OutOfMemory` if the charge would exceed the ceiling;
    /// nothing is charged in that case.
    pub fn allocate(&self, size: usize) -> Result<Allocation> {
        let mut in_use = self.in_use.lock();
        if in_use.saturating_add(size) > self.ceiling {
            return Err(StoreError::OutOfMemory {
                requested: size,
                in_use: *in_use,
                ceiling: self.ceiling,
            });
        }
        *in_use += size;
        Ok(Allocation { size })
    }

    /// Releases a previously charged allocation.
    pub fn free(&self, alloc: Allocation) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(alloc.size);
    }

    /// Bytes currently charged.
    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    /// The configured ceiling.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}
