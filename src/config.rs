//! Store configuration options.
//!
//! [`Config`] controls the shape of the versioned node directory, the
//! memory ceiling enforced by the block allocator, and the size of the
//! per-snapshot page guard pool.
//!
//! # Example
//!
//! ```rust
//! use arbor::Config;
//!
//! let mut config = Config::default();
//! config.memory_ceiling = 16 << 20;
//! ```

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Configuration options for an arbor store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum number of entries per directory tree node.
    ///
    /// A node splits when an insert hits this capacity and becomes a merge
    /// candidate when it drops to half of it.
    pub node_capacity: usize,

    /// Number of keys summarized by one entry of a node's coarse index.
    ///
    /// Searches scan the index to locate a covering block, then scan within
    /// the block, so this trades index size against scan length.
    pub index_block: usize,

    /// Byte ceiling enforced by the block allocator for page payloads.
    ///
    /// An allocation that would exceed the ceiling fails with
    /// `OutOfMemory` instead of overcommitting.
    pub memory_ceiling: usize,

    /// Capacity of each snapshot's page guard pool.
    ///
    /// The pool hands out at most this many distinct pinned pages per
    /// snapshot; `acquire` beyond it fails rather than growing.
    pub guard_pool_capacity: usize,

    /// Page payload size used by `create` when no explicit size is given.
    pub default_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_capacity: 32,
            index_block: 8,
            memory_ceiling: 64 << 20,
            guard_pool_capacity: 256,
            default_page_size: 8192,
        }
    }
}

impl Config {
    /// Tiny nodes and a small ceiling. Forces frequent splits and merges,
    /// which makes structural bugs surface quickly; intended for tests and
    /// debugging, not production use.
    pub fn compact() -> Self {
        Self {
            node_capacity: 8,
            index_block: 4,
            memory_ceiling: 1 << 20,
            guard_pool_capacity: 32,
            default_page_size: 256,
        }
    }

    /// Validates the configuration, returning `InvalidState` on nonsense
    /// values (zero capacities, index block larger than the node).
    pub fn validate(&self) -> Result<()> {
        if self.node_capacity < 4 {
            return Err(StoreError::invalid_state(
                "node_capacity must be at least 4",
            ));
        }
        if self.index_block == 0 || self.index_block > self.node_capacity {
            return Err(StoreError::invalid_state(
                "index_block must be in 1..=node_capacity",
            ));
        }
        if self.guard_pool_capacity == 0 {
            return Err(StoreError::invalid_state(
                "guard_pool_capacity must be nonzero",
            ));
        }
        if self.default_page_size == 0 {
            return Err(StoreError::invalid_state(
                "default_page_size must be nonzero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
        Config::compact().validate().unwrap();
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = Config::default();
        config.index_block = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.index_block = config.node_capacity + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node_capacity = 2;
        assert!(config.validate().is_err());
    }
}
