//! Profile and relay-list cache
//!
//! A [`FeedCache`] keeps one record per key in memory, in front of an optional
//! persistent [`CacheStore`]. Every update is classified as new, updated,
//! refresh or unchanged. Store writes are serialized through a [`WorkQueue`]
//! and never block the caller; a store that fails is dropped and the cache
//! carries on in memory.

use crate::error::{ClientError, Result};
use crate::outbox::RelayDirectory;
use crate::queue::WorkQueue;
use async_trait::async_trait;
use nostr::{Event, Metadata, RelayEntry, RelayListMetadata};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// A cacheable record derived from a source event.
pub trait CachedRecord: Clone + Send + Sync + 'static {
    /// Cache key, e.g. the author's pubkey
    fn key(&self) -> &str;
    /// `created_at` of the source event
    fn created(&self) -> u64;
    /// When this client stored the record (unix seconds)
    fn loaded(&self) -> u64;
    /// Same domain payload, ignoring timestamps
    fn same_payload(&self, other: &Self) -> bool;
}

/// Pluggable persistent key-value store.
#[async_trait]
pub trait CacheStore<T: CachedRecord>: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<T>>;
    async fn put(&self, record: T) -> anyhow::Result<()>;
    async fn bulk_get(&self, keys: &[String]) -> anyhow::Result<Vec<T>>;
    async fn bulk_put(&self, records: Vec<T>) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

/// In-process store, mostly useful for tests and as a reference backend.
pub struct MemoryStore<T> {
    records: Mutex<HashMap<String, T>>,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: CachedRecord> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T: CachedRecord> CacheStore<T> for MemoryStore<T> {
    async fn get(&self, key: &str) -> anyhow::Result<Option<T>> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn put(&self, record: T) -> anyhow::Result<()> {
        self.records.lock().insert(record.key().to_string(), record);
        Ok(())
    }

    async fn bulk_get(&self, keys: &[String]) -> anyhow::Result<Vec<T>> {
        let records = self.records.lock();
        Ok(keys.iter().filter_map(|k| records.get(k).cloned()).collect())
    }

    async fn bulk_put(&self, records: Vec<T>) -> anyhow::Result<()> {
        let mut stored = self.records.lock();
        for record in records {
            stored.insert(record.key().to_string(), record);
        }
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.records.lock().clear();
        Ok(())
    }
}

/// How an incoming record relates to the cached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// Nothing cached for the key
    New,
    /// Newer source event
    Updated,
    /// Same source timestamp, different payload
    Refresh,
    /// Older or identical; discarded
    NoChange,
}

impl UpdateType {
    /// Whether the record was stored.
    pub fn is_stored(&self) -> bool {
        !matches!(self, UpdateType::NoChange)
    }
}

/// Classify `incoming` against `existing`.
pub fn classify_update<T: CachedRecord>(existing: Option<&T>, incoming: &T) -> UpdateType {
    match existing {
        None => UpdateType::New,
        Some(current) if incoming.created() > current.created() => UpdateType::Updated,
        Some(current)
            if incoming.created() == current.created() && !incoming.same_payload(current) =>
        {
            UpdateType::Refresh
        }
        Some(_) => UpdateType::NoChange,
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Records kept in memory before the least recently used one is dropped
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    /// False once the backing store failed (or when there is none)
    pub store_available: bool,
}

struct MemoryState<T> {
    records: HashMap<String, T>,
    /// Keys in access order, oldest first
    lru_queue: VecDeque<String>,
}

impl<T: CachedRecord> MemoryState<T> {
    /// Linear in the number of cached keys. Fine for the default
    /// `max_entries`; a linked hash map would be needed far beyond it.
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru_queue.iter().position(|k| k == key) {
            self.lru_queue.remove(pos);
        }
        self.lru_queue.push_back(key.to_string());
    }

    fn insert(&mut self, record: T, max_entries: usize) {
        let key = record.key().to_string();
        self.records.insert(key.clone(), record);
        self.touch(&key);
        while self.records.len() > max_entries.max(1) {
            let Some(old) = self.lru_queue.pop_front() else {
                break;
            };
            self.records.remove(&old);
        }
    }
}

/// Memory cache with an optional write-behind store.
pub struct FeedCache<T: CachedRecord> {
    name: String,
    config: CacheConfig,
    memory: Mutex<MemoryState<T>>,
    store: Option<Arc<dyn CacheStore<T>>>,
    store_ok: Arc<AtomicBool>,
    hits: AtomicU64,
    misses: AtomicU64,
    queue: WorkQueue,
}

/// Mark the store unusable; logs only the first time.
fn degrade(store_ok: &AtomicBool, name: &str, error: &anyhow::Error) {
    if store_ok.swap(false, Ordering::SeqCst) {
        warn!(
            "Cache store for {} failed, continuing in memory only: {:#}",
            name, error
        );
    }
}

impl<T: CachedRecord> FeedCache<T> {
    /// Memory-only cache.
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self::build(name.into(), config, None)
    }

    /// Cache backed by `store`.
    pub fn with_store(
        name: impl Into<String>,
        config: CacheConfig,
        store: Arc<dyn CacheStore<T>>,
    ) -> Self {
        Self::build(name.into(), config, Some(store))
    }

    fn build(name: String, config: CacheConfig, store: Option<Arc<dyn CacheStore<T>>>) -> Self {
        Self {
            queue: WorkQueue::new(format!("{}-cache", name)),
            store_ok: Arc::new(AtomicBool::new(store.is_some())),
            name,
            config,
            memory: Mutex::new(MemoryState {
                records: HashMap::new(),
                lru_queue: VecDeque::new(),
            }),
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classify and apply `record`. Stored records are written behind to the
    /// backing store.
    pub fn update(&self, record: T) -> UpdateType {
        let update = {
            let mut memory = self.memory.lock();
            let update = classify_update(memory.records.get(record.key()), &record);
            if update.is_stored() {
                memory.insert(record.clone(), self.config.max_entries);
            }
            update
        };

        if update.is_stored() {
            debug!("{} cache {:?} for {}", self.name, update, record.key());
            self.write_behind(record);
        }
        update
    }

    fn write_behind(&self, record: T) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if !self.store_ok.load(Ordering::SeqCst) {
            return;
        }

        let store_ok = self.store_ok.clone();
        let name = self.name.clone();
        // Not awaited: the job keeps its place in the queue either way.
        drop(self.queue.enqueue(async move {
            if !store_ok.load(Ordering::SeqCst) {
                return Ok(());
            }
            store.put(record).await.map_err(|e| {
                degrade(&store_ok, &name, &e);
                ClientError::Cache(e.to_string())
            })
        }));
    }

    /// Load `keys` missing from memory out of the backing store.
    pub async fn buffer(&self, keys: &[String]) -> usize {
        let Some(store) = self.store.clone() else {
            return 0;
        };
        if !self.store_ok.load(Ordering::SeqCst) {
            return 0;
        }

        let missing: Vec<String> = {
            let memory = self.memory.lock();
            keys.iter()
                .filter(|k| !memory.records.contains_key(k.as_str()))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return 0;
        }

        match store.bulk_get(&missing).await {
            Ok(records) => {
                let mut loaded = 0;
                let mut memory = self.memory.lock();
                for record in records {
                    if classify_update(memory.records.get(record.key()), &record).is_stored() {
                        memory.insert(record, self.config.max_entries);
                        loaded += 1;
                    }
                }
                debug!("Buffered {} {} records from store", loaded, self.name);
                loaded
            }
            Err(e) => {
                degrade(&self.store_ok, &self.name, &e);
                0
            }
        }
    }

    /// Cached record for `key`, counted as a hit or miss.
    pub fn get(&self, key: &str) -> Option<T> {
        let found = {
            let mut memory = self.memory.lock();
            let found = memory.records.get(key).cloned();
            if found.is_some() {
                memory.touch(key);
            }
            found
        };
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Cached record without touching stats or recency.
    pub fn peek(&self, key: &str) -> Option<T> {
        self.memory.lock().records.get(key).cloned()
    }

    /// Whether a record for `key` is held in memory.
    pub fn contains(&self, key: &str) -> bool {
        self.memory.lock().records.contains_key(key)
    }

    /// True when nothing is cached for `key` or the record was loaded more
    /// than `max_age` ago.
    pub fn is_stale(&self, key: &str, max_age: Duration) -> bool {
        let cutoff = now_secs().saturating_sub(max_age.as_secs());
        self.memory
            .lock()
            .records
            .get(key)
            .is_none_or(|record| record.loaded() < cutoff)
    }

    /// A backing store is attached and has not failed.
    pub fn has_store(&self) -> bool {
        self.store.is_some() && self.store_ok.load(Ordering::SeqCst)
    }

    /// All cached records, sorted by key.
    pub fn snapshot(&self) -> Vec<T> {
        let mut records: Vec<T> = self.memory.lock().records.values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));
        records
    }

    pub fn len(&self) -> usize {
        self.memory.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything, in memory and in the store.
    pub fn clear(&self) {
        {
            let mut memory = self.memory.lock();
            memory.records.clear();
            memory.lru_queue.clear();
        }

        if let Some(store) = self.store.clone()
            && self.store_ok.load(Ordering::SeqCst)
        {
            let store_ok = self.store_ok.clone();
            let name = self.name.clone();
            drop(self.queue.enqueue(async move {
                store.clear().await.map_err(|e| {
                    degrade(&store_ok, &name, &e);
                    ClientError::Cache(e.to_string())
                })
            }));
        }
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) -> Result<()> {
        self.queue.enqueue(async { Ok(()) }).await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            store_available: self.store_ok.load(Ordering::SeqCst),
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Cached kind 0 profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub pubkey: String,
    pub metadata: Metadata,
    pub created: u64,
    pub loaded: u64,
}

impl MetadataRecord {
    pub fn from_event(event: &Event) -> Result<Self> {
        let metadata =
            Metadata::from_event(event).map_err(|e| ClientError::InvalidEvent(e.to_string()))?;
        Ok(Self {
            pubkey: event.pubkey.clone(),
            metadata,
            created: event.created_at,
            loaded: now_secs(),
        })
    }
}

impl CachedRecord for MetadataRecord {
    fn key(&self) -> &str {
        &self.pubkey
    }

    fn created(&self) -> u64 {
        self.created
    }

    fn loaded(&self) -> u64 {
        self.loaded
    }

    fn same_payload(&self, other: &Self) -> bool {
        self.metadata == other.metadata
    }
}

/// Cached relay list of one author, from kind 10002 tags or kind 3 content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayListRecord {
    pub pubkey: String,
    pub relays: Vec<RelayEntry>,
    pub created: u64,
    pub loaded: u64,
}

impl RelayListRecord {
    pub fn from_event(event: &Event) -> Result<Self> {
        let list = RelayListMetadata::from_event(event)
            .map_err(|e| ClientError::InvalidEvent(e.to_string()))?;
        Ok(Self {
            pubkey: event.pubkey.clone(),
            relays: list.relays,
            created: event.created_at,
            loaded: now_secs(),
        })
    }

    pub fn write_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_write())
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn read_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_read())
            .map(|r| r.url.clone())
            .collect()
    }
}

impl CachedRecord for RelayListRecord {
    fn key(&self) -> &str {
        &self.pubkey
    }

    fn created(&self) -> u64 {
        self.created
    }

    fn loaded(&self) -> u64 {
        self.loaded
    }

    fn same_payload(&self, other: &Self) -> bool {
        self.relays == other.relays
    }
}

impl RelayDirectory for FeedCache<RelayListRecord> {
    fn write_relays(&self, pubkey: &str) -> Option<Vec<String>> {
        self.peek(pubkey).map(|r| r.write_relays())
    }

    fn read_relays(&self, pubkey: &str) -> Option<Vec<String>> {
        self.peek(pubkey).map(|r| r.read_relays())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{RelayMarker, create_relay_tag};
    use pretty_assertions::assert_eq;

    fn relay_list(pubkey: &str, created_at: u64, relays: &[&str]) -> Event {
        Event {
            id: format!("{}-{}", pubkey, created_at),
            pubkey: pubkey.to_string(),
            created_at,
            kind: 10002,
            tags: relays
                .iter()
                .map(|r| create_relay_tag(*r, Some(RelayMarker::Write)))
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    fn record(pubkey: &str, created_at: u64, relays: &[&str]) -> RelayListRecord {
        RelayListRecord::from_event(&relay_list(pubkey, created_at, relays)).unwrap()
    }

    struct FailingStore;

    #[async_trait]
    impl CacheStore<RelayListRecord> for FailingStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<RelayListRecord>> {
            anyhow::bail!("store offline")
        }
        async fn put(&self, _record: RelayListRecord) -> anyhow::Result<()> {
            anyhow::bail!("store offline")
        }
        async fn bulk_get(&self, _keys: &[String]) -> anyhow::Result<Vec<RelayListRecord>> {
            anyhow::bail!("store offline")
        }
        async fn bulk_put(&self, _records: Vec<RelayListRecord>) -> anyhow::Result<()> {
            anyhow::bail!("store offline")
        }
        async fn clear(&self) -> anyhow::Result<()> {
            anyhow::bail!("store offline")
        }
    }

    #[test]
    fn test_update_classification_sequence() {
        let cache = FeedCache::new("relays", CacheConfig::default());
        let updates: Vec<UpdateType> = [
            record("alice", 5, &["wss://a.com"]),
            record("alice", 5, &["wss://a.com", "wss://b.com"]),
            record("alice", 3, &["wss://c.com"]),
            record("alice", 10, &["wss://d.com"]),
        ]
        .into_iter()
        .map(|r| cache.update(r))
        .collect();

        assert_eq!(
            updates,
            vec![
                UpdateType::New,
                UpdateType::Refresh,
                UpdateType::NoChange,
                UpdateType::Updated
            ]
        );
        assert_eq!(
            cache.peek("alice").unwrap().write_relays(),
            vec!["wss://d.com".to_string()]
        );
    }

    #[test]
    fn test_identical_record_is_no_change() {
        let cache = FeedCache::new("relays", CacheConfig::default());
        assert_eq!(cache.update(record("bob", 1, &["wss://a.com"])), UpdateType::New);
        assert_eq!(cache.update(record("bob", 1, &["wss://a.com"])), UpdateType::NoChange);
    }

    #[test]
    fn test_stats_and_eviction() {
        let cache = FeedCache::new("relays", CacheConfig { max_entries: 2 });
        cache.update(record("a", 1, &[]));
        cache.update(record("b", 1, &[]));
        assert!(cache.get("a").is_some());
        cache.update(record("c", 1, &[]));

        assert!(cache.get("b").is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 2);
        assert!(!stats.store_available);

        let keys: Vec<String> = cache.snapshot().into_iter().map(|r| r.pubkey).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn test_metadata_record() {
        let event = Event {
            id: "id".to_string(),
            pubkey: "alice".to_string(),
            created_at: 7,
            kind: 0,
            tags: vec![],
            content: r#"{"name":"alice","about":""}"#.to_string(),
            sig: String::new(),
        };
        let record = MetadataRecord::from_event(&event).unwrap();
        assert_eq!(record.key(), "alice");
        assert_eq!(record.created(), 7);
        assert_eq!(record.metadata.name.as_deref(), Some("alice"));
        assert_eq!(record.metadata.about, None);

        let note = Event { kind: 1, ..event };
        assert!(MetadataRecord::from_event(&note).is_err());
    }

    #[test]
    fn test_cache_as_relay_directory() {
        let cache = FeedCache::new("relays", CacheConfig::default());
        cache.update(record("alice", 1, &["wss://a.com"]));

        let directory: &dyn RelayDirectory = &cache;
        assert_eq!(directory.write_relays("alice"), Some(vec!["wss://a.com".to_string()]));
        assert_eq!(directory.write_relays("bob"), None);
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn test_write_behind_and_buffer() {
        let store: Arc<MemoryStore<RelayListRecord>> = Arc::new(MemoryStore::new());
        let cache =
            FeedCache::<RelayListRecord>::with_store("relays", CacheConfig::default(), store.clone());
        cache.update(record("alice", 1, &["wss://a.com"]));
        cache.update(record("bob", 1, &["wss://b.com"]));
        cache.flush().await.unwrap();
        assert_eq!(store.len(), 2);

        let fresh =
            FeedCache::<RelayListRecord>::with_store("relays", CacheConfig::default(), store.clone());
        let loaded = fresh
            .buffer(&["alice".to_string(), "carol".to_string()])
            .await;
        assert_eq!(loaded, 1);
        assert!(fresh.peek("alice").is_some());
        assert!(fresh.peek("bob").is_none());

        fresh.clear();
        fresh.flush().await.unwrap();
        assert!(fresh.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_staleness_follows_loaded_time() {
        let cache = FeedCache::new("relays", CacheConfig::default());
        let day = Duration::from_secs(86_400);
        assert!(cache.is_stale("alice", day));

        cache.update(record("alice", 1, &["wss://a.com"]));
        assert!(!cache.is_stale("alice", day));

        let mut old = record("bob", 1, &["wss://b.com"]);
        old.loaded = now_secs() - 2 * 86_400;
        cache.update(old);
        assert!(cache.contains("bob"));
        assert!(cache.is_stale("bob", day));
        assert!(!cache.has_store());
    }

    #[tokio::test]
    async fn test_failing_store_degrades_to_memory() {
        let cache = FeedCache::with_store(
            "relays",
            CacheConfig::default(),
            Arc::new(FailingStore) as Arc<dyn CacheStore<RelayListRecord>>,
        );
        assert!(cache.stats().store_available);

        assert_eq!(cache.update(record("alice", 1, &["wss://a.com"])), UpdateType::New);
        cache.flush().await.unwrap();

        assert!(!cache.stats().store_available);
        assert!(!cache.has_store());
        assert_eq!(cache.update(record("alice", 2, &["wss://b.com"])), UpdateType::Updated);
        assert_eq!(cache.buffer(&["bob".to_string()]).await, 0);
        assert_eq!(cache.len(), 1);
    }
}
