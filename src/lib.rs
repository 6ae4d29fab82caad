//! arbor: an embeddable multi-version page store.
//!
//! The engine keeps logical pages under a copy-on-write search tree (the
//! node directory) whose nodes are shared structurally between versions.
//! Versions form a branching history: committing a snapshot freezes it,
//! branching a committed version opens a new writable one, and rolling
//! back releases exactly the structure the abandoned version created.
//! Reference counts on both tree nodes and pages drive reclamation, so
//! dropping a version never copies and never leaks.
//!
//! ```rust
//! use arbor::{Config, Store};
//!
//! # fn main() -> arbor::Result<()> {
//! let store = Store::new(Config::default())?;
//!
//! let txn = store.branch()?;
//! let page = txn.create(0)?;
//! page.write(|data| data[0] = 42)?;
//! let id = page.id();
//! txn.set_root("answer", Some(id))?;
//! drop(page);
//! txn.commit()?;
//!
//! let reader = store.master()?;
//! let page = reader.get(reader.get_root("answer")?.unwrap())?;
//! assert_eq!(page.read(|data| data[0])?, 42);
//! # Ok(())
//! # }
//! ```

pub mod alloc;
pub mod codec;
pub mod config;
pub mod error;
pub mod guard;
pub mod history;
pub mod ids;
pub mod logging;
pub mod page;
pub mod snapshot;
pub mod store;
pub mod tree;

pub use codec::{PayloadCodec, RawCodec};
pub use config::Config;
pub use error::{Result, StoreError};
pub use guard::GuardState;
pub use history::{RootStatus, VersionStatus};
pub use ids::{NodeId, PageId, PagePtr, VersionId};
pub use logging::init_logging;
pub use snapshot::{PageGuard, Snapshot, SnapshotWalker};
pub use store::Store;
pub use tree::{DirNode, PageSlot};
