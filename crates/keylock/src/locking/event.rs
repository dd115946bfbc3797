//! Lock lifecycle events
//!
//! Events are published on a broadcast channel obtained from
//! [`KeyLock::subscribe`](super::KeyLock::subscribe).

use super::types::saturating_millis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

/// Type of lock event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventType {
    /// A key was seen for the first time and its lock created
    Created,
    /// A hold was granted
    Acquired,
    /// A hold was released
    Released,
    /// A bounded wait expired without a hold
    TimedOut,
    /// An idle key was evicted by `prune`
    Pruned,
}

impl LockEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Acquired => "acquired",
            Self::Released => "released",
            Self::TimedOut => "timed_out",
            Self::Pruned => "pruned",
        }
    }
}

impl std::fmt::Display for LockEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A lock event for one key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent<K> {
    /// The key the event concerns
    pub key: K,
    /// Type of event
    pub event_type: LockEventType,
    /// Wait time for `acquired`/`timed_out`, hold time for `released`
    pub elapsed_ms: Option<u64>,
    /// When the event occurred
    pub created_at: DateTime<Utc>,
}

impl<K> LockEvent<K> {
    /// Create a new lock event
    pub fn new(key: K, event_type: LockEventType, elapsed: Option<Duration>) -> Self {
        Self {
            key,
            event_type,
            elapsed_ms: elapsed.map(saturating_millis),
            created_at: Utc::now(),
        }
    }

    pub fn created(key: K) -> Self {
        Self::new(key, LockEventType::Created, None)
    }

    pub fn acquired(key: K, waited: Duration) -> Self {
        Self::new(key, LockEventType::Acquired, Some(waited))
    }

    pub fn released(key: K, held: Duration) -> Self {
        Self::new(key, LockEventType::Released, Some(held))
    }

    pub fn timed_out(key: K, waited: Duration) -> Self {
        Self::new(key, LockEventType::TimedOut, Some(waited))
    }

    pub fn pruned(key: K) -> Self {
        Self::new(key, LockEventType::Pruned, None)
    }
}

/// Sending half shared by the registry and every outstanding [`Unlock`](super::Unlock)
pub(crate) type EventSender<K> = broadcast::Sender<LockEvent<K>>;

/// Publish an event, skipping the work entirely when nobody listens
pub(crate) fn publish<K>(tx: &EventSender<K>, event: impl FnOnce() -> LockEvent<K>) {
    if tx.receiver_count() > 0 {
        // Receivers may drop between the check and the send
        let _ = tx.send(event());
    }
}
