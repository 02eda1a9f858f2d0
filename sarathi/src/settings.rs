//! Settings store consumed by the controller.
//!
//! Persistence belongs to the host application; the controller only needs
//! key lookup, writes, an explicit save and a notification when saved
//! values change.

use crate::error::Result;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Called after `save` with each key whose value changed since the last save
pub type SettingsObserver = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Handle returned by [`SettingsStore::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value);

    fn save(&self) -> Result<()>;

    fn subscribe(&self, observer: SettingsObserver) -> SubscriptionId;

    /// Returns false if `id` was not subscribed
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// In-memory store; `save` only notifies observers
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<Map<String, Value>>,
    dirty: Mutex<BTreeSet<String>>,
    observers: Mutex<Vec<(SubscriptionId, SettingsObserver)>>,
    next_subscription: AtomicU64,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `values`, none of them pending notification
    pub fn with_values(values: Map<String, Value>) -> Self {
        Self {
            values: Mutex::new(values),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.lock().clone()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = self.values.lock();
        if values.get(key) != Some(&value) {
            values.insert(key.to_string(), value);
            self.dirty.lock().insert(key.to_string());
        }
    }

    fn save(&self) -> Result<()> {
        let changed: Vec<(String, Value)> = {
            let values = self.values.lock();
            let mut dirty = self.dirty.lock();
            let changed = dirty
                .iter()
                .filter_map(|key| values.get(key).map(|v| (key.clone(), v.clone())))
                .collect();
            dirty.clear();
            changed
        };
        let observers: Vec<SettingsObserver> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for (key, value) in &changed {
            tracing::debug!("Setting '{}' saved", key);
            for observer in &observers {
                observer(key, value);
            }
        }
        Ok(())
    }

    fn subscribe(&self, observer: SettingsObserver) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_notifies_changed_keys_once() {
        let settings = MemorySettings::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        settings.subscribe(Arc::new(move |key, value| {
            sink.lock().push((key.to_string(), value.clone()));
        }));

        settings.set("tick", json!(0.05));
        settings.save().unwrap();
        settings.save().unwrap();
        assert_eq!(*seen.lock(), vec![("tick".to_string(), json!(0.05))]);

        // writing the same value again is not a change
        settings.set("tick", json!(0.05));
        settings.save().unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(settings.get("tick"), Some(json!(0.05)));
    }

    #[test]
    fn test_unsubscribed_observer_is_not_notified() {
        let settings = MemorySettings::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let id = settings.subscribe(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(settings.observer_count(), 1);

        assert!(settings.unsubscribe(id));
        assert!(!settings.unsubscribe(id));
        assert_eq!(settings.observer_count(), 0);

        settings.set("tick", json!(0.2));
        settings.save().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
