//! Key-scoped locking
//!
//! A [`KeyLock`] hands out an independent lock per key, created on first
//! use, so callers can serialize work on named resources without declaring
//! them up front and without contention on one key touching any other.
//!
//! # Architecture
//!
//! - **Registry**: [`KeyLock`] owns the key -> lock map
//! - **Capability**: [`Unlock`] releases exactly one hold
//! - **Events**: [`LockEvent`] stream for observing lock activity
//!
//! # Example
//!
//! ```no_run
//! use keylock::{KeyLock, KeyLockError, IMMEDIATE};
//! use std::time::Duration;
//!
//! # async fn run() {
//! let keylock = KeyLock::new();
//!
//! let unlock = keylock.acquire("invoice:42").await;
//!
//! // Another caller gives up instead of waiting
//! let attempt = keylock.acquire_with_timeout("invoice:42", IMMEDIATE).await;
//! assert_eq!(attempt.unwrap_err(), KeyLockError::Timeout);
//!
//! unlock.unlock();
//!
//! let unlock = keylock
//!     .acquire_with_timeout("invoice:42", Duration::from_millis(50))
//!     .await
//!     .expect("key was released");
//! unlock.unlock();
//! # }
//! ```

pub mod event;
pub mod registry;
pub mod types;
pub mod unlock;

// Re-export main types
pub use event::{LockEvent, LockEventType};
pub use registry::KeyLock;
pub use types::{IMMEDIATE, LockStatus, saturating_millis};
pub use unlock::Unlock;
