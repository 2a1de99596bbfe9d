use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::marker::ReportMap;
use crate::models::{ContentId, Count};

pub const DEFAULT_NAMESPACE: &str = "sfrc_flags";
const MAX_WINDOW_ENTRIES: usize = 50_000;

#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ReportMap>>;

    /// Records one report of `content_id` under `key` and returns the new
    /// count. `ttl` only applies when the entry is created.
    async fn increment(&self, key: &str, content_id: ContentId, ttl: Duration) -> Result<Count>;
}

pub fn window_key(namespace: &str, address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(address.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct WindowEntry {
    reports: ReportMap,
    expires_at: DateTime<Utc>,
}

pub struct InMemoryWindowStore {
    entries: Mutex<HashMap<String, WindowEntry>>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
}

impl InMemoryWindowStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, MAX_WINDOW_ENTRIES)
    }

    pub fn with_capacity(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            max_entries,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.entries
            .lock()
            .await
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.expires_at)
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn get(&self, key: &str) -> Result<Option<ReportMap>> {
        let now = self.clock.now();
        let mut guard = self.entries.lock().await;
        match guard.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.reports.clone())),
            Some(_) => {
                guard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn increment(&self, key: &str, content_id: ContentId, ttl: Duration) -> Result<Count> {
        let now = self.clock.now();
        let mut guard = self.entries.lock().await;
        if guard.len() >= self.max_entries && !guard.contains_key(key) {
            let before = guard.len();
            guard.retain(|_, e| e.expires_at > now);
            debug!(
                pruned = before - guard.len(),
                remaining = guard.len(),
                "pruned expired window entries"
            );
            while guard.len() >= self.max_entries {
                let Some(oldest) = guard
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                guard.remove(&oldest);
                warn!("window store full, evicted entry closest to expiry");
            }
        }

        let live = guard.get(key).is_some_and(|e| e.expires_at > now);
        if !live {
            let mut reports = ReportMap::new();
            let count = reports.increment(content_id);
            guard.insert(
                key.to_string(),
                WindowEntry {
                    reports,
                    expires_at: now + ttl,
                },
            );
            return Ok(count);
        }

        match guard.get_mut(key) {
            Some(entry) => Ok(entry.reports.increment(content_id)),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn id(n: u64) -> ContentId {
        ContentId::new(n).expect("positive id")
    }

    fn store() -> (Arc<ManualClock>, InMemoryWindowStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryWindowStore::new(clock.clone());
        (clock, store)
    }

    #[test]
    fn key_depends_only_on_namespace_and_address() {
        let a = window_key(DEFAULT_NAMESPACE, "10.0.0.1");
        assert_eq!(a, window_key(DEFAULT_NAMESPACE, "10.0.0.1"));
        assert_ne!(a, window_key(DEFAULT_NAMESPACE, "10.0.0.2"));
        assert_ne!(a, window_key("other", "10.0.0.1"));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn creates_then_increments() {
        let (_clock, store) = store();
        let key = window_key(DEFAULT_NAMESPACE, "1.2.3.4");
        assert!(store.get(&key).await.unwrap().is_none());

        assert_eq!(store.increment(&key, id(7), Duration::days(1)).await.unwrap(), 1);
        assert_eq!(store.increment(&key, id(7), Duration::days(1)).await.unwrap(), 2);
        assert_eq!(store.increment(&key, id(8), Duration::days(1)).await.unwrap(), 1);

        let reports = store.get(&key).await.unwrap().expect("entry");
        assert_eq!(reports.count(id(7)), 2);
        assert_eq!(reports.count(id(8)), 1);
    }

    #[tokio::test]
    async fn increments_do_not_extend_expiry() {
        let (clock, store) = store();
        let key = window_key(DEFAULT_NAMESPACE, "1.2.3.4");
        let window = Duration::hours(24);
        let created = clock.now();

        store.increment(&key, id(1), window).await.unwrap();
        for _ in 0..5 {
            clock.advance(Duration::hours(4));
            store.increment(&key, id(1), window).await.unwrap();
        }
        assert_eq!(store.expires_at(&key).await, Some(created + window));

        clock.advance(Duration::hours(4));
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_recreated_fresh() {
        let (clock, store) = store();
        let key = window_key(DEFAULT_NAMESPACE, "1.2.3.4");
        store.increment(&key, id(1), Duration::hours(1)).await.unwrap();
        store.increment(&key, id(1), Duration::hours(1)).await.unwrap();

        clock.advance(Duration::hours(2));
        assert_eq!(store.increment(&key, id(1), Duration::hours(1)).await.unwrap(), 1);
        assert_eq!(store.expires_at(&key).await, Some(clock.now() + Duration::hours(1)));
    }

    #[tokio::test]
    async fn prunes_expired_entries_when_full() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryWindowStore::with_capacity(clock.clone(), 2);
        store.increment("a", id(1), Duration::minutes(1)).await.unwrap();
        store.increment("b", id(1), Duration::minutes(1)).await.unwrap();
        clock.advance(Duration::minutes(5));
        store.increment("c", id(1), Duration::minutes(1)).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn evicts_soonest_expiry_when_full_of_live_entries() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryWindowStore::with_capacity(clock.clone(), 2);
        store.increment("a", id(1), Duration::hours(1)).await.unwrap();
        store.increment("b", id(1), Duration::hours(2)).await.unwrap();
        store.increment("b", id(2), Duration::hours(2)).await.unwrap();
        assert_eq!(store.len().await, 2);

        store.increment("c", id(1), Duration::hours(3)).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let (_clock, store) = store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment("shared", id(3), Duration::days(1)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let reports = store.get("shared").await.unwrap().expect("entry");
        assert_eq!(reports.count(id(3)), 16);
    }
}
