//! The virtual tree and its inverse index
//!
//! Both trees live in their own named segments so a grown tree can be
//! republished under a new segment name without touching the
//! configuration segment.

mod inverse;
mod node;
mod tree;

pub use inverse::InverseTree;
pub use node::{NodeFlags, NodeKind};
pub use tree::{ChildEntry, Lookup, PrefixMatch, RemovedEntry, VirtualTree};
