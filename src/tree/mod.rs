//! The versioned node directory: a copy-on-write search tree mapping
//! logical page ids to physical page slots, with reference-counted
//! structural sharing across versions.

pub mod directory;
pub mod node;

pub use directory::{Directory, DirNode, PageSlot, SlotCodec};
pub use node::{Entries, Node, NodeKey, NodeType};
