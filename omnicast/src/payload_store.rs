use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::model::MediaPayload;

struct PayloadEntry {
    payload: MediaPayload,
    registered_at: DateTime<Utc>,
    last_access: Instant,
    fetch_count: u64,
}

/// Registered payloads, keyed by the opaque id that appears in served URLs.
pub struct PayloadStore {
    entries: Mutex<HashMap<String, PayloadEntry>>,
}

impl PayloadStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a payload and returns its id. Passing a hint reuses that id
    /// and replaces whatever it pointed at.
    pub fn register(&self, hint: Option<&str>, payload: MediaPayload) -> String {
        let id = match hint {
            Some(hint) => hint.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let mut entries = self.entries.lock().unwrap();
        let replaced = entries
            .insert(
                id.clone(),
                PayloadEntry {
                    payload,
                    registered_at: Utc::now(),
                    last_access: Instant::now(),
                    fetch_count: 0,
                },
            )
            .is_some();
        debug!(payload = %id, replaced, "Payload registered");
        id
    }

    /// Looks a payload up for serving, refreshing its idle clock.
    pub fn resolve(&self, id: &str) -> Option<MediaPayload> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(id).map(|entry| {
            entry.last_access = Instant::now();
            entry.fetch_count += 1;
            entry.payload.clone()
        })
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }

    /// Age of a registration, if present.
    pub fn registered_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().unwrap().get(id).map(|e| e.registered_at)
    }

    pub fn fetch_count(&self, id: &str) -> Option<u64> {
        self.entries.lock().unwrap().get(id).map(|e| e.fetch_count)
    }

    /// Evicts every payload idle for longer than `timeout`; returns the
    /// evicted ids.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_access) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
            debug!(payload = %id, "Idle payload evicted");
        }
        expired
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for PayloadStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PayloadSource;

    #[test]
    fn register_resolve_unregister() {
        let store = PayloadStore::new();
        let id = store.register(None, MediaPayload::from_url("http://example.com/a.mp3"));

        let payload = store.resolve(&id).unwrap();
        assert!(matches!(payload.source, PayloadSource::Url(_)));
        assert_eq!(store.fetch_count(&id), Some(1));

        assert!(store.unregister(&id));
        assert!(store.resolve(&id).is_none());
        assert!(!store.unregister(&id));
    }

    #[test]
    fn hint_replaces_existing_entry() {
        let store = PayloadStore::new();
        store.register(Some("track"), MediaPayload::from_bytes(vec![1u8]));
        store.register(Some("track"), MediaPayload::from_bytes(vec![2u8, 3]));

        assert_eq!(store.len(), 1);
        let payload = store.resolve("track").unwrap();
        assert_eq!(payload.size, Some(2));
        // The replacement starts with a fresh fetch count.
        assert_eq!(store.fetch_count("track"), Some(1));
    }

    #[test]
    fn sweep_evicts_only_idle_entries() {
        let store = PayloadStore::new();
        let stale = store.register(None, MediaPayload::from_bytes(vec![0u8]));
        std::thread::sleep(Duration::from_millis(50));
        let fresh = store.register(None, MediaPayload::from_bytes(vec![0u8]));

        let evicted = store.sweep_idle(Duration::from_millis(25));
        assert_eq!(evicted, vec![stale.clone()]);
        assert!(store.resolve(&stale).is_none());
        assert!(store.resolve(&fresh).is_some());
    }

    #[test]
    fn resolve_refreshes_the_idle_clock() {
        let store = PayloadStore::new();
        let id = store.register(None, MediaPayload::from_bytes(vec![0u8]));

        std::thread::sleep(Duration::from_millis(40));
        store.resolve(&id).unwrap();
        let evicted = store.sweep_idle(Duration::from_millis(25));
        assert!(evicted.is_empty());
    }
}
