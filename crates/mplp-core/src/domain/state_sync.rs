//! Versioned cross-module state
//!
//! Each `(module, state_key)` pair holds the latest value and a version that
//! starts at 1 and grows by one per write. Every write emits a
//! [`StateSyncEvent`] which is appended to the store's log and fanned out to
//! [`StateSubscriber`]s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::CoreError;

/// Subscribing with this key receives every key of the module
pub const WILDCARD_KEY: &str = "*";

/// Value object: state key scoped by module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    /// Owning module
    pub module: String,
    /// Key within the module
    pub key: String,
}

impl StateKey {
    /// Create a new state key
    pub fn new(module: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            key: key.into(),
        }
    }

    /// The module-wide wildcard key
    pub fn wildcard(module: impl Into<String>) -> Self {
        Self::new(module, WILDCARD_KEY)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.key)
    }
}

/// Latest value stored under a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Current value
    pub value: Value,
    /// Version of the current value
    pub version: u64,
    /// When the value was written
    pub updated_at: DateTime<Utc>,
}

/// Immutable record of one state write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncEvent {
    /// Event ID
    pub id: String,
    /// Module that owns the key
    pub source_module: String,
    /// Key within the module
    pub state_key: String,
    /// Value before the write
    pub old_value: Option<Value>,
    /// Value after the write
    pub new_value: Value,
    /// When the write happened
    pub timestamp: DateTime<Utc>,
    /// Per-key version produced by the write
    pub version: u64,
    /// 1-based position in the store's event log
    pub sequence: u64,
}

/// Filter for [`StateSyncEvent`] queries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncEventFilter {
    /// Only events from this module
    pub module: Option<String>,
    /// Only events for this key
    pub state_key: Option<String>,
}

impl SyncEventFilter {
    /// Filter on a module
    pub fn module(module: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            state_key: None,
        }
    }

    /// Filter on a single key
    pub fn key(module: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            state_key: Some(state_key.into()),
        }
    }

    /// Whether an event passes the filter
    pub fn matches(&self, event: &StateSyncEvent) -> bool {
        self.module
            .as_deref()
            .map_or(true, |m| m == event.source_module)
            && self
                .state_key
                .as_deref()
                .map_or(true, |k| k == event.state_key)
    }
}

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Listener notified after every write to a subscribed key
///
/// Delivery is fire-and-forget: errors are logged by the store and never
/// affect the write or other subscribers.
#[async_trait]
pub trait StateSubscriber: Send + Sync {
    /// Called with the event of each write
    async fn on_state_change(&self, event: &StateSyncEvent) -> Result<(), CoreError>;
}

/// Adapter turning a synchronous closure into a [`StateSubscriber`]
pub struct FnSubscriber<F>(pub F);

#[async_trait]
impl<F> StateSubscriber for FnSubscriber<F>
where
    F: Fn(&StateSyncEvent) -> Result<(), CoreError> + Send + Sync,
{
    async fn on_state_change(&self, event: &StateSyncEvent) -> Result<(), CoreError> {
        (self.0)(event)
    }
}
