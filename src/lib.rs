//! hookvfs - user-space virtual filesystem core
//!
//! Presents an augmented view of the host filesystem to a set of
//! cooperating processes without touching the on-disk layout. Real
//! source trees are layered over a base tree in a shared virtual tree;
//! intercepted filesystem calls translate their virtual paths through
//! the redirection engine and forward to the genuine host calls with
//! real paths. All cross-process state lives in named shared memory
//! segments guarded by one instance mutex.

pub mod config;
pub mod context;
pub mod error;
pub mod handles;
pub mod params;
pub mod paths;
pub mod propagate;
pub mod redirect;
pub mod shm;
pub mod tree;

pub use config::InstanceConfig;
pub use context::HookContext;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::InstanceConfig;
    pub use crate::context::HookContext;
    pub use crate::error::{Error, Result};
    pub use crate::paths::VirtualPath;
    pub use crate::redirect::{OpClass, Resolution};
}
