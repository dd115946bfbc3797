//! Lock status and shared constants

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A zero wait budget: `acquire_with_timeout(key, IMMEDIATE)` succeeds only
/// if the key is free at the instant of the call and never yields.
pub const IMMEDIATE: Duration = Duration::ZERO;

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Observed state of a registered key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Nobody holds, awaits, or is resolving the key
    Idle,
    /// The key is held, awaited, or being resolved by at least one caller
    InUse,
}

impl LockStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InUse => "in_use",
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
