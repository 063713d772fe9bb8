//! Named shared memory segments and the cross-process mutex
//!
//! Every piece of cross-process state lives in one of three named
//! segments (configuration plus the two trees), mapped by each attached
//! process at an arbitrary base address. Intra-segment references are
//! therefore offsets, never pointers, and all allocation goes through
//! the segment-scoped allocator.

mod alloc;
mod mutex;
mod segment;

pub use mutex::{InstanceMutex, MutexGuard};
pub use segment::SharedSegment;
