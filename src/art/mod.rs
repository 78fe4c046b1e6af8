//! Adaptive Radix Tree: node families, locking, and the tree algorithms
//! that tie them together (spec.md §3, §4).

pub(crate) mod leaf;
pub(crate) mod lock;
pub(crate) mod node16;
pub(crate) mod node256;
pub(crate) mod node4;
pub(crate) mod node48;
pub(crate) mod node_header;
pub(crate) mod pointer;
mod tree;

pub use tree::{ChildKind, InsertOutcome, RemoveOutcome, Tree};
