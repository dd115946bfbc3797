//! Error types for keylock

use thiserror::Error;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, KeyLockError>;

/// Lock errors
///
/// Waiting for a key is the only operation that can fail, so there is a
/// single variant. Compare it like a sentinel:
///
/// ```
/// # use keylock::KeyLockError;
/// # let err = KeyLockError::Timeout;
/// if err == KeyLockError::Timeout {
///     // retry later
/// }
/// ```
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyLockError {
    /// The wait budget elapsed before the key became free.
    ///
    /// The caller holds nothing and owes no release.
    #[error("timeout")]
    Timeout,
}

impl KeyLockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "E300",
        }
    }

    /// Whether this is a lock-acquisition timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
