//! Keylock Core Library
//!
//! Key-scoped mutual exclusion for tokio applications:
//! - One lazily created lock per key, independent of every other key
//! - Unbounded and bounded (timeout / immediate) acquisition
//! - Release through a single-use [`Unlock`] capability
//! - Lock lifecycle events and optional eviction of idle keys

pub mod config;
pub mod error;
pub mod locking;

pub use config::KeyLockConfig;
pub use error::{KeyLockError, LockResult};
pub use locking::{IMMEDIATE, KeyLock, LockEvent, LockEventType, LockStatus, Unlock};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::KeyLockConfig;
    pub use crate::error::{KeyLockError, LockResult};
    pub use crate::locking::{IMMEDIATE, KeyLock, Unlock};
}
