//! In-memory versioned state store with change fan-out

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::state_sync::{
    StateEntry, StateKey, StateSubscriber, StateSyncEvent, SubscriptionId, SyncEventFilter,
    WILDCARD_KEY,
};
use crate::CoreError;

struct Subscription {
    id: SubscriptionId,
    subscriber: Arc<dyn StateSubscriber>,
}

/// Versioned key/value state shared between modules
///
/// Writes to one key are serialized by the key's map entry; the event is
/// appended to the log while that entry is held, so per-key versions appear
/// in the log in order. Subscribers are notified after all locks are released.
pub struct StateStore {
    entries: DashMap<StateKey, StateEntry>,
    events: RwLock<Vec<StateSyncEvent>>,
    subscriptions: DashMap<StateKey, Vec<Subscription>>,
    next_subscription: AtomicU64,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            events: RwLock::new(Vec::new()),
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Write a value, bump the key's version and notify subscribers
    ///
    /// Returns the event describing the write. Subscriber failures are logged
    /// and never surface here.
    pub async fn set_state(
        &self,
        module: &str,
        state_key: &str,
        value: Value,
    ) -> Result<StateSyncEvent, CoreError> {
        validate_key(module, state_key)?;
        let key = StateKey::new(module, state_key);

        let event = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let old_value = std::mem::replace(&mut entry.value, value.clone());
                entry.version += 1;
                entry.updated_at = Utc::now();
                self.append_event(&key, Some(old_value), value, entry.version)
            }
            Entry::Vacant(vacant) => {
                let event = self.append_event(&key, None, value.clone(), 1);
                vacant.insert(StateEntry {
                    value,
                    version: 1,
                    updated_at: event.timestamp,
                });
                event
            }
        };

        debug!(
            module = %module,
            state_key = %state_key,
            version = event.version,
            sequence = event.sequence,
            "State updated"
        );

        self.notify(&key, &event).await;
        Ok(event)
    }

    /// Current value of a key
    pub fn get_state(&self, module: &str, state_key: &str) -> Option<Value> {
        self.entries
            .get(&StateKey::new(module, state_key))
            .map(|e| e.value.clone())
    }

    /// Current value, version and update time of a key
    pub fn get_entry(&self, module: &str, state_key: &str) -> Option<StateEntry> {
        self.entries
            .get(&StateKey::new(module, state_key))
            .map(|e| e.value().clone())
    }

    /// Current version of a key
    pub fn get_state_version(&self, module: &str, state_key: &str) -> Option<u64> {
        self.entries
            .get(&StateKey::new(module, state_key))
            .map(|e| e.version)
    }

    /// Keys written by a module, sorted
    pub fn keys(&self, module: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().module == module)
            .map(|e| e.key().key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Subscribe to a key, or to every key of a module with `"*"`
    pub fn subscribe_to_state(
        &self,
        module: &str,
        state_key: &str,
        subscriber: Arc<dyn StateSubscriber>,
    ) -> Result<SubscriptionId, CoreError> {
        if module.is_empty() || state_key.is_empty() {
            return Err(CoreError::ValidationError(
                "Subscriptions need a module and a state key".to_string(),
            ));
        }

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .entry(StateKey::new(module, state_key))
            .or_default()
            .push(Subscription { id, subscriber });

        debug!(module = %module, state_key = %state_key, subscription = id.0, "Subscribed to state");
        Ok(id)
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.subscriptions.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.iter().map(|e| e.value().len()).sum()
    }

    /// Logged events matching the filter, in log order
    pub fn get_sync_events(&self, filter: &SyncEventFilter) -> Vec<StateSyncEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Number of logged events
    pub fn event_count(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check the log against the current entries
    ///
    /// Per key, logged versions must run 1, 2, 3... and the newest logged
    /// value must match the stored one. The log is snapshotted first, so an
    /// entry that has moved ahead of the snapshot counts as consistent.
    pub fn validate_state_consistency(&self) -> bool {
        let snapshot: Vec<StateSyncEvent> = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut latest: HashMap<StateKey, &StateSyncEvent> = HashMap::new();
        for (index, event) in snapshot.iter().enumerate() {
            if event.sequence != index as u64 + 1 {
                warn!(sequence = event.sequence, "Event log sequence gap");
                return false;
            }
            let key = StateKey::new(&event.source_module, &event.state_key);
            let expected = latest.get(&key).map(|e| e.version + 1).unwrap_or(1);
            if event.version != expected {
                warn!(key = %key, version = event.version, expected, "Version gap in event log");
                return false;
            }
            latest.insert(key, event);
        }

        for (key, event) in latest {
            let Some(entry) = self.entries.get(&key) else {
                warn!(key = %key, "Logged key missing from store");
                return false;
            };
            if entry.version < event.version
                || (entry.version == event.version && entry.value != event.new_value)
            {
                warn!(key = %key, "Stored value diverges from event log");
                return false;
            }
        }

        true
    }

    /// Health check
    pub fn health_check(&self) -> bool {
        !self.events.is_poisoned()
    }

    fn append_event(
        &self,
        key: &StateKey,
        old_value: Option<Value>,
        new_value: Value,
        version: u64,
    ) -> StateSyncEvent {
        let mut log = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let event = StateSyncEvent {
            id: Uuid::new_v4().to_string(),
            source_module: key.module.clone(),
            state_key: key.key.clone(),
            old_value,
            new_value,
            timestamp: Utc::now(),
            version,
            sequence: log.len() as u64 + 1,
        };
        log.push(event.clone());
        event
    }

    async fn notify(&self, key: &StateKey, event: &StateSyncEvent) {
        // Copy the subscriber list so no map guard is held while notifying
        let mut targets: Vec<(SubscriptionId, Arc<dyn StateSubscriber>)> = Vec::new();
        for lookup in [key.clone(), StateKey::wildcard(&key.module)] {
            if let Some(subs) = self.subscriptions.get(&lookup) {
                targets.extend(subs.iter().map(|s| (s.id, s.subscriber.clone())));
            }
        }
        targets.sort_by_key(|(id, _)| *id);

        for (id, subscriber) in targets {
            let delivery = AssertUnwindSafe(subscriber.on_state_change(event)).catch_unwind();
            match delivery.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    subscription = id.0,
                    key = %key,
                    error = %e,
                    "State subscriber failed"
                ),
                Err(_) => error!(subscription = id.0, key = %key, "State subscriber panicked"),
            }
        }
    }
}

fn validate_key(module: &str, state_key: &str) -> Result<(), CoreError> {
    if module.is_empty() || state_key.is_empty() {
        return Err(CoreError::ValidationError(
            "State writes need a module and a state key".to_string(),
        ));
    }
    if state_key == WILDCARD_KEY {
        return Err(CoreError::ValidationError(format!(
            "'{}' is reserved for subscriptions",
            WILDCARD_KEY
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::state_sync::FnSubscriber;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<StateSyncEvent>>>, Arc<dyn StateSubscriber>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscriber: Arc<dyn StateSubscriber> = Arc::new(FnSubscriber(move |e: &StateSyncEvent| -> Result<(), CoreError> {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        }));
        (seen, subscriber)
    }

    #[tokio::test]
    async fn test_versions_increase_per_key() {
        let store = StateStore::new();

        let first = store.set_state("plan", "p1", json!("draft")).await.unwrap();
        let second = store.set_state("plan", "p1", json!("active")).await.unwrap();
        let other = store.set_state("plan", "p2", json!("draft")).await.unwrap();

        assert_eq!(first.version, 1);
        assert!(first.old_value.is_none());
        assert_eq!(second.version, 2);
        assert_eq!(second.old_value, Some(json!("draft")));
        assert_eq!(other.version, 1);
        assert_eq!(other.sequence, 3);

        assert_eq!(store.get_state("plan", "p1"), Some(json!("active")));
        assert_eq!(store.get_state_version("plan", "p1"), Some(2));
        assert_eq!(store.get_state_version("plan", "missing"), None);
        assert_eq!(store.keys("plan"), vec!["p1".to_string(), "p2".to_string()]);
        assert!(store.validate_state_consistency());
    }

    #[tokio::test]
    async fn test_rejects_empty_and_wildcard_keys() {
        let store = StateStore::new();
        assert!(matches!(
            store.set_state("", "k", json!(1)).await,
            Err(CoreError::ValidationError(_))
        ));
        assert!(store.set_state("plan", "*", json!(1)).await.is_err());
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_and_wildcards() {
        let store = StateStore::new();
        let (exact, exact_sub) = recorder();
        let (wildcard, wildcard_sub) = recorder();

        store.subscribe_to_state("plan", "p1", exact_sub).unwrap();
        store
            .subscribe_to_state("plan", WILDCARD_KEY, wildcard_sub)
            .unwrap();

        store.set_state("plan", "p1", json!(1)).await.unwrap();
        store.set_state("plan", "p2", json!(2)).await.unwrap();
        store.set_state("role", "r1", json!(3)).await.unwrap();

        assert_eq!(exact.lock().unwrap().len(), 1);
        let wildcard_keys: Vec<String> = wildcard
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.state_key.clone())
            .collect();
        assert_eq!(wildcard_keys, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let store = StateStore::new();
        let failing: Arc<dyn StateSubscriber> = Arc::new(FnSubscriber(|_: &StateSyncEvent| -> Result<(), CoreError> {
            Err(CoreError::Other("subscriber down".to_string()))
        }));
        let panicking: Arc<dyn StateSubscriber> =
            Arc::new(FnSubscriber(|_: &StateSyncEvent| -> Result<(), CoreError> {
                panic!("subscriber bug")
            }));
        let (seen, healthy) = recorder();

        store.subscribe_to_state("context", "c1", failing).unwrap();
        store.subscribe_to_state("context", "c1", panicking).unwrap();
        store.subscribe_to_state("context", "c1", healthy).unwrap();

        let event = store.set_state("context", "c1", json!("ok")).await.unwrap();
        assert_eq!(event.version, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(store.get_state("context", "c1"), Some(json!("ok")));
    }

    /// Reads its own key and mirrors the value under another key
    struct Mirror {
        store: std::sync::Weak<StateStore>,
        observed: Mutex<Vec<(Option<Value>, Option<u64>)>>,
    }

    #[async_trait::async_trait]
    impl StateSubscriber for Mirror {
        async fn on_state_change(&self, event: &StateSyncEvent) -> Result<(), CoreError> {
            let store = self
                .store
                .upgrade()
                .ok_or_else(|| CoreError::Other("store dropped".to_string()))?;
            let current = store.get_state(&event.source_module, &event.state_key);
            let mirrored = store
                .set_state("mirror", &event.state_key, event.new_value.clone())
                .await?;
            self.observed
                .lock()
                .unwrap()
                .push((current, Some(mirrored.version)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_subscriber_can_reenter_the_store() {
        let store = Arc::new(StateStore::new());
        let mirror = Arc::new(Mirror {
            store: Arc::downgrade(&store),
            observed: Mutex::new(Vec::new()),
        });
        store.subscribe_to_state("plan", "p1", mirror.clone()).unwrap();

        let write = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            store.set_state("plan", "p1", json!("draft")),
        );
        write.await.expect("set_state deadlocked").unwrap();
        store.set_state("plan", "p1", json!("active")).await.unwrap();

        assert_eq!(
            *mirror.observed.lock().unwrap(),
            vec![
                (Some(json!("draft")), Some(1)),
                (Some(json!("active")), Some(2)),
            ]
        );
        assert_eq!(store.get_state("mirror", "p1"), Some(json!("active")));
        assert_eq!(store.get_state_version("mirror", "p1"), Some(2));
        assert_eq!(store.event_count(), 4);
        assert!(store.validate_state_consistency());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let store = StateStore::new();
        let (seen, subscriber) = recorder();
        let id = store.subscribe_to_state("trace", "t1", subscriber).unwrap();
        assert_eq!(store.subscription_count(), 1);

        store.set_state("trace", "t1", json!(1)).await.unwrap();
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set_state("trace", "t1", json!(2)).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_event_filters() {
        let store = StateStore::new();
        store.set_state("plan", "p1", json!(1)).await.unwrap();
        store.set_state("role", "r1", json!(2)).await.unwrap();
        store.set_state("plan", "p1", json!(3)).await.unwrap();

        assert_eq!(store.get_sync_events(&SyncEventFilter::default()).len(), 3);
        let plan = store.get_sync_events(&SyncEventFilter::key("plan", "p1"));
        assert_eq!(
            plan.iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            store
                .get_sync_events(&SyncEventFilter::module("role"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_consistency_detects_divergence() {
        let store = StateStore::new();
        store.set_state("plan", "p1", json!(1)).await.unwrap();
        assert!(store.validate_state_consistency());

        if let Some(mut entry) = store.entries.get_mut(&StateKey::new("plan", "p1")) {
            entry.value = json!("tampered");
        }
        assert!(!store.validate_state_consistency());
    }
}
