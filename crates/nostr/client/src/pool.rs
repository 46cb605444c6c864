//! Relay pool: the query engine.
//!
//! The pool owns every [`RelayConnection`], turns [`RequestBuilder`]s into
//! per-relay REQs (via the outbox router or explicit relay hints), merges the
//! resulting events into [`NoteStore`]s and offers broadcast and one-shot
//! writes.
//!
//! All pool state sits behind one mutex. Entry points mutate it synchronously
//! and never hold it across an `.await`. Connections report back over a
//! channel drained by a dispatcher task, so there is no connection to pool
//! back-pointer.
//!
//! Two background loaders keep the caches warm: one holds a profile query
//! open for tracked pubkeys, the other fetches relay lists for the authors
//! that queries mention. Both read the persistent store first and only ask
//! relays for keys that are missing or expired.

use crate::cache::{CacheConfig, FeedCache, MetadataRecord, RelayListRecord};
use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::outbox::{OutboxConfig, OutboxRouter, RelayDirectory, RelayShard, publish_relays};
use crate::relay::{
    ConnectionEvent, ConnectionState, ConnectionStats, RelayConfig, RelayConnection,
    RelayNotification, RelaySettings, normalize_relay_url,
};
use crate::relay_info::{RelayInfoCache, RelayInfoConfig};
use crate::signer::{EventSigner, sign_checked};
use crate::store::{DEFAULT_NOTIFY_WINDOW, NoteStore, Snapshot, StoreKind};
use crate::DEFAULT_RELAYS;
use crate::subscription::{RelayProgress, RequestBuilder, SubscriptionTracker, generate_subscription_id};
use futures::future::join_all;
use nostr::{Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, RELAY_LIST_METADATA_KIND, RelayInformation, verify_event_id};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Caller-facing query id.
pub type QueryId = u64;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Relays used when a request has no hints and an author has no relay list
    pub default_relays: Vec<String>,
    /// Settings for every connection the pool opens
    pub relay: RelayConfig,
    pub outbox: OutboxConfig,
    pub relay_info: RelayInfoConfig,
    pub cache: CacheConfig,
    /// Coalescing window for note store notifications
    pub notify_window: Duration,
    /// How often idle connections are looked for
    pub cleanup_interval: Duration,
    /// How long an on-demand connection may sit unused before it is closed
    pub idle_grace: Duration,
    /// Queries are treated as complete after this long without EOSE
    pub query_timeout: Duration,
    /// Upper bound on waiting for a relay's OK
    pub write_timeout: Duration,
    /// Fetch NIP-11 documents for new connections
    pub fetch_relay_info: bool,
    /// Profiles loaded longer ago than this are fetched again
    pub profile_expiry: Duration,
    /// Relay lists loaded longer ago than this are fetched again
    pub relay_list_expiry: Duration,
    /// How long a key that relays had nothing for is left alone
    pub not_found_retry: Duration,
    /// How often the loaders look for expired keys
    pub loader_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            relay: RelayConfig::default(),
            outbox: OutboxConfig::default(),
            relay_info: RelayInfoConfig::default(),
            cache: CacheConfig::default(),
            notify_window: DEFAULT_NOTIFY_WINDOW,
            cleanup_interval: Duration::from_secs(5),
            idle_grace: Duration::from_secs(30),
            query_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            fetch_relay_info: true,
            profile_expiry: Duration::from_secs(6 * 60 * 60),
            relay_list_expiry: Duration::from_secs(12 * 60 * 60),
            not_found_retry: Duration::from_secs(5 * 60),
            loader_interval: Duration::from_secs(2),
        }
    }
}

/// Events emitted by the relay pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A connection changed state
    RelayStatus {
        relay_url: String,
        state: ConnectionState,
    },
    /// Notice from a relay
    Notice { relay_url: String, message: String },
    /// The relay ended a subscription with CLOSED
    SubscriptionClosed {
        relay_url: String,
        subscription_id: String,
        message: String,
    },
    /// Every relay of a subscription has finished sending stored events
    AllEose { subscription_id: String },
    /// An event whose id does not match its content was dropped
    InvalidEvent { relay_url: String, event_id: String },
}

/// Outcome of a write to one relay. Rejections are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayWriteResult {
    pub relay: String,
    pub ok: bool,
    pub message: String,
}

struct ConnEntry {
    conn: RelayConnection,
    /// Opened by `connect_to_relay`; never closed for idleness
    explicit: bool,
}

/// One REQ set on the wire, possibly shared by several callers.
struct PhysicalSub {
    /// Request id, for logs
    label: String,
    fingerprint: String,
    store: NoteStore,
    filters: Vec<Filter>,
    hints: Vec<String>,
    /// Empty until routed
    shards: HashMap<String, Vec<Filter>>,
    tracker: SubscriptionTracker,
    leave_open: bool,
    timeout: Duration,
    refs: usize,
    finished: bool,
}

/// The two cache loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loader {
    /// Profiles of tracked pubkeys, on a query that stays open
    Metadata,
    /// Relay lists of queried authors, fetched once per expiry
    RelayLists,
}

impl Loader {
    const ALL: [Loader; 2] = [Loader::Metadata, Loader::RelayLists];

    fn name(self) -> &'static str {
        match self {
            Loader::Metadata => "metadata",
            Loader::RelayLists => "relay-lists",
        }
    }

    fn kinds(self) -> Vec<u16> {
        match self {
            Loader::Metadata => vec![KIND_METADATA],
            Loader::RelayLists => vec![RELAY_LIST_METADATA_KIND, KIND_CONTACTS],
        }
    }

    fn leave_open(self) -> bool {
        self == Loader::Metadata
    }
}

#[derive(Default)]
struct LoaderState {
    /// Wanted keys and their reference counts
    wanted: HashMap<String, usize>,
    /// Keys being read back from the cache store
    buffering: HashSet<String>,
    /// Keys a finished fetch returned nothing for
    not_found: HashMap<String, Instant>,
    query: Option<QueryId>,
    /// Authors of `query`
    requested: BTreeSet<String>,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<String, ConnEntry>,
    /// Keyed by wire subscription id
    physicals: HashMap<String, PhysicalSub>,
    /// fingerprint -> subscription id, for live subscriptions only
    coalesce: HashMap<String, String>,
    queries: HashMap<QueryId, String>,
    metadata: LoaderState,
    relay_loader: LoaderState,
    next_query: QueryId,
    shut_down: bool,
}

impl PoolState {
    fn loader(&mut self, loader: Loader) -> &mut LoaderState {
        match loader {
            Loader::Metadata => &mut self.metadata,
            Loader::RelayLists => &mut self.relay_loader,
        }
    }
}

/// A registered query before it is wrapped in a handle.
struct OpenedQuery {
    id: QueryId,
    subscription_id: String,
    store: NoteStore,
}

/// Follow-up work after routing, done without the state lock.
#[derive(Default)]
struct Routed {
    created: Vec<String>,
    /// Set when REQs went out
    timeout: Option<Duration>,
    /// Set when no relay took the subscription
    unrouted: Option<NoteStore>,
    /// Finished loader query to release
    release: Option<QueryId>,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    router: OutboxRouter,
    profiles: Arc<FeedCache<MetadataRecord>>,
    relay_lists: Arc<FeedCache<RelayListRecord>>,
    relay_info: RelayInfoCache,
    conn_tx: mpsc::UnboundedSender<RelayNotification>,
    events_tx: broadcast::Sender<PoolEvent>,
    invalid_events: AtomicU64,
    /// Serialize loader refreshes; taken before `state`, metadata first
    metadata_refresh: Mutex<()>,
    relay_list_refresh: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A pool of Nostr relay connections. Cheap to clone.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

/// A registered query, released on drop. The store stays usable after
/// cancelling.
#[derive(Debug)]
pub struct QueryHandle {
    id: QueryId,
    subscription_id: String,
    store: NoteStore,
    pool: Weak<PoolInner>,
}

impl QueryHandle {
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Wire subscription id; shared by coalesced queries.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn store(&self) -> &NoteStore {
        &self.store
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    /// Release this query. Safe to call more than once.
    pub fn cancel(&self) -> bool {
        match self.pool.upgrade() {
            Some(pool) => pool.cancel_query(self.id),
            None => false,
        }
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl RelayPool {
    /// Create a pool with in-memory caches. Must be called within a Tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let profiles = Arc::new(FeedCache::new("profiles", config.cache.clone()));
        let relay_lists = Arc::new(FeedCache::new("relay-lists", config.cache.clone()));
        Self::with_caches(config, profiles, relay_lists)
    }

    /// Create a pool around caches the caller owns (e.g. with persistent stores).
    pub fn with_caches(
        config: PoolConfig,
        profiles: Arc<FeedCache<MetadataRecord>>,
        relay_lists: Arc<FeedCache<RelayListRecord>>,
    ) -> Self {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(1024);

        let inner = Arc::new(PoolInner {
            router: OutboxRouter::new(config.outbox.clone()),
            relay_info: RelayInfoCache::new(config.relay_info.clone()),
            config,
            state: Mutex::new(PoolState::default()),
            profiles,
            relay_lists,
            conn_tx,
            events_tx,
            invalid_events: AtomicU64::new(0),
            metadata_refresh: Mutex::new(()),
            relay_list_refresh: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        });

        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&inner), conn_rx));
        let cleanup = tokio::spawn(cleanup(
            Arc::downgrade(&inner),
            inner.config.cleanup_interval,
        ));
        let loaders = tokio::spawn(load(
            Arc::downgrade(&inner),
            inner.config.loader_interval,
        ));
        inner.tasks.lock().extend([dispatcher, cleanup, loaders]);

        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Subscribe to pool events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn profiles(&self) -> &Arc<FeedCache<MetadataRecord>> {
        &self.inner.profiles
    }

    pub fn relay_lists(&self) -> &Arc<FeedCache<RelayListRecord>> {
        &self.inner.relay_lists
    }

    /// Events dropped because their id did not match their content.
    pub fn invalid_events(&self) -> u64 {
        self.inner.invalid_events.load(Ordering::Relaxed)
    }

    /// Register a query and send its REQs.
    ///
    /// A request equal to one that is still live (same filters after
    /// normalization, same delivery options, same store kind) shares its
    /// subscription and store instead of sending new REQs.
    ///
    /// Authors in the filters whose relay lists are unknown or expired are
    /// handed to the relay-list loader. When the relay-list cache has a
    /// store, routing waits until the missing lists were read back from it.
    pub fn query(&self, kind: StoreKind, request: RequestBuilder) -> Result<QueryHandle> {
        let opened = self.inner.open_query(kind, request, true)?;
        Ok(QueryHandle {
            id: opened.id,
            subscription_id: opened.subscription_id,
            store: opened.store,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Release a query. Returns false if it was not registered.
    pub fn cancel_query(&self, id: QueryId) -> bool {
        self.inner.cancel_query(id)
    }

    /// Number of distinct subscriptions held (coalesced queries count once).
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().physicals.len()
    }

    /// Send `event` to every open, writable connection in parallel.
    pub async fn broadcast(&self, event: &Event) -> Result<Vec<RelayWriteResult>> {
        check_event(event)?;

        let targets: Vec<RelayConnection> = self
            .inner
            .state
            .lock()
            .connections
            .values()
            .filter(|e| e.conn.is_open() && e.conn.settings().write)
            .map(|e| e.conn.clone())
            .collect();

        if targets.is_empty() {
            warn!("Broadcast of {} found no writable relays", event.id);
            return Ok(Vec::new());
        }

        info!("Broadcasting event {} to {} relays", event.id, targets.len());
        let timeout = self.inner.config.write_timeout;
        Ok(join_all(targets.iter().map(|conn| write_with(conn, event, timeout))).await)
    }

    /// Publish `event` to one relay and wait for its answer. A connection
    /// opened for this is closed afterwards unless something else uses it.
    pub async fn write_once(&self, url: &str, event: &Event) -> Result<RelayWriteResult> {
        check_event(event)?;
        self.inner.write_to(url, event).await
    }

    /// Sign `template` and publish it following the outbox model, plus every
    /// open writable connection.
    pub async fn publish(
        &self,
        signer: &dyn EventSigner,
        template: EventTemplate,
    ) -> Result<(Event, Vec<RelayWriteResult>)> {
        let event = sign_checked(signer, template).await?;

        let targets: BTreeSet<String> = {
            let state = self.inner.state.lock();
            let fallback = self.inner.fallback_relays(&state);
            let mut targets: BTreeSet<String> =
                publish_relays(&*self.inner.relay_lists, &event, &fallback)
                    .into_iter()
                    .collect();
            targets.extend(
                state
                    .connections
                    .iter()
                    .filter(|(_, e)| e.conn.is_open() && e.conn.settings().write)
                    .map(|(url, _)| url.clone()),
            );
            targets
        };
        if targets.is_empty() {
            warn!("No relays to publish {} to", event.id);
        }

        let inner = &self.inner;
        let results = join_all(targets.into_iter().map(|url| {
            let event = &event;
            async move {
                inner.write_to(&url, event).await.unwrap_or_else(|e| RelayWriteResult {
                    relay: url.clone(),
                    ok: false,
                    message: e.to_string(),
                })
            }
        }))
        .await;

        Ok((event, results))
    }

    /// Keep `pubkey`'s profile loaded. Calls are counted; the author stays
    /// tracked until `untrack_metadata` was called as often.
    ///
    /// A profile found in the cache store and loaded within
    /// `profile_expiry` is not requested from relays.
    pub fn track_metadata(&self, pubkey: &str) -> Result<()> {
        let buffer = {
            let mut state = self.inner.state.lock();
            let loader = &mut state.metadata;
            let count = loader.wanted.entry(pubkey.to_string()).or_insert(0);
            *count += 1;
            if *count > 1 {
                return Ok(());
            }
            let buffer = self.inner.profiles.has_store() && !self.inner.profiles.contains(pubkey);
            if buffer {
                loader.buffering.insert(pubkey.to_string());
            }
            buffer
        };
        if buffer {
            self.inner
                .spawn_buffer(Loader::Metadata, vec![pubkey.to_string()], None);
            Ok(())
        } else {
            self.inner.refresh_loader(Loader::Metadata)
        }
    }

    pub fn untrack_metadata(&self, pubkey: &str) -> Result<()> {
        let last = {
            let mut state = self.inner.state.lock();
            let wanted = &mut state.metadata.wanted;
            match wanted.get_mut(pubkey) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    wanted.remove(pubkey);
                    true
                }
                None => false,
            }
        };
        if last {
            self.inner.refresh_loader(Loader::Metadata)?;
        }
        Ok(())
    }

    /// Pubkeys currently tracked, sorted.
    pub fn tracked_metadata(&self) -> Vec<String> {
        let mut pubkeys: Vec<String> = self
            .inner
            .state
            .lock()
            .metadata
            .wanted
            .keys()
            .cloned()
            .collect();
        pubkeys.sort();
        pubkeys
    }

    /// Cached profile for `pubkey`.
    pub fn metadata(&self, pubkey: &str) -> Option<MetadataRecord> {
        self.inner.profiles.get(pubkey)
    }

    /// Open (or adopt) a connection that stays up until `disconnect_relay`.
    pub fn connect_to_relay(&self, url: &str, settings: RelaySettings) -> Result<RelayConnection> {
        let (conn, created) = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(ClientError::ConnectionClosed("pool is shut down".to_string()));
            }
            self.inner.ensure_connection(&mut state, url, true)?
        };
        conn.set_settings(settings);
        if created {
            self.inner.spawn_relay_info(conn.url().to_string());
        }
        Ok(conn)
    }

    /// Close and forget a connection. Its pending subscriptions are cancelled.
    pub fn disconnect_relay(&self, url: &str) -> bool {
        let Ok(url) = normalize_relay_url(url) else {
            return false;
        };
        let removed = self.inner.state.lock().connections.remove(&url);
        match removed {
            Some(entry) => {
                info!("Disconnecting relay: {}", url);
                entry.conn.close();
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, url: &str) -> Option<RelayConnection> {
        self.inner.connection(url)
    }

    /// Relay information document, fetched on first use.
    pub async fn relay_info(&self, url: &str) -> Option<Arc<RelayInformation>> {
        self.inner.relay_info.get(url).await
    }

    pub fn connection_stats(&self) -> HashMap<String, ConnectionStats> {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .map(|(url, e)| (url.clone(), e.conn.stats()))
            .collect()
    }

    pub fn relay_states(&self) -> HashMap<String, ConnectionState> {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .map(|(url, e)| (url.clone(), e.conn.state()))
            .collect()
    }

    /// Get all relay URLs in the pool.
    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.inner.state.lock().connections.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Close every connection and stop background tasks.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

fn check_event(event: &Event) -> Result<()> {
    if verify_event_id(event) {
        Ok(())
    } else {
        Err(ClientError::InvalidEvent(format!(
            "id {} does not match event content",
            event.id
        )))
    }
}

async fn write_with(conn: &RelayConnection, event: &Event, timeout: Duration) -> RelayWriteResult {
    let relay = conn.url().to_string();
    match tokio::time::timeout(timeout, conn.publish(event)).await {
        Ok(Ok(confirmation)) => RelayWriteResult {
            relay,
            ok: confirmation.accepted,
            message: confirmation.message,
        },
        Ok(Err(e)) => RelayWriteResult {
            relay,
            ok: false,
            message: e.to_string(),
        },
        Err(_) => RelayWriteResult {
            relay,
            ok: false,
            message: format!("no OK after {:?}", timeout),
        },
    }
}

async fn dispatch(pool: Weak<PoolInner>, mut rx: mpsc::UnboundedReceiver<RelayNotification>) {
    while let Some(notification) = rx.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.handle_notification(notification);
    }
    debug!("Pool dispatcher stopped");
}

async fn cleanup(pool: Weak<PoolInner>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.close_idle();
    }
}

async fn load(pool: Weak<PoolInner>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        for loader in Loader::ALL {
            if let Err(e) = inner.refresh_loader(loader) {
                debug!("Refreshing {} failed: {}", loader.name(), e);
            }
        }
    }
}

impl PoolInner {
    fn connection(&self, url: &str) -> Option<RelayConnection> {
        let url = normalize_relay_url(url).ok()?;
        self.state.lock().connections.get(&url).map(|e| e.conn.clone())
    }

    /// Configured fallback, else default relays, else whatever is connected.
    fn fallback_relays(&self, state: &PoolState) -> Vec<String> {
        if !self.config.outbox.fallback_relays.is_empty() {
            return self.config.outbox.fallback_relays.clone();
        }
        if !self.config.default_relays.is_empty() {
            return self.config.default_relays.clone();
        }
        let mut connected: Vec<String> = state.connections.keys().cloned().collect();
        connected.sort();
        connected
    }

    fn ensure_connection(
        &self,
        state: &mut PoolState,
        url: &str,
        explicit: bool,
    ) -> Result<(RelayConnection, bool)> {
        let url = normalize_relay_url(url)?;
        if let Some(entry) = state.connections.get_mut(&url)
            && !entry.conn.is_closed()
        {
            entry.explicit |= explicit;
            let conn = entry.conn.clone();
            conn.connect()?;
            return Ok((conn, false));
        }

        let conn = RelayConnection::new(&url, self.config.relay.clone(), self.conn_tx.clone())?;
        conn.connect()?;
        info!("Adding relay to pool: {}", url);
        state.connections.insert(
            url,
            ConnEntry {
                conn: conn.clone(),
                explicit,
            },
        );
        Ok((conn, true))
    }

    fn spawn_relay_info(self: &Arc<Self>, url: String) {
        if !self.config.fetch_relay_info {
            return;
        }
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(inner) = pool.upgrade() else {
                return;
            };
            let Some(info) = inner.relay_info.get(&url).await else {
                return;
            };
            if let Some(max) = info.max_subscriptions()
                && let Some(conn) = inner.connection(&url)
            {
                debug!("Relay {} allows {} subscriptions", url, max);
                conn.set_max_subscriptions(max);
            }
        });
    }

    fn plan(&self, state: &PoolState, hints: &[String], filters: &[Filter]) -> Vec<RelayShard> {
        if !hints.is_empty() {
            return hints
                .iter()
                .filter_map(|relay| match normalize_relay_url(relay) {
                    Ok(relay) => Some(relay),
                    Err(e) => {
                        warn!("Ignoring relay hint {}: {}", relay, e);
                        None
                    }
                })
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|relay| RelayShard {
                    relay,
                    filters: filters.to_vec(),
                })
                .collect();
        }

        let fallback = self.fallback_relays(state);
        self.router
            .route(&*self.relay_lists as &dyn RelayDirectory, filters, &fallback)
    }

    /// Register a query. `load_relay_lists` hands stale authors to the
    /// relay-list loader; that loader's own fetches pass false.
    fn open_query(
        self: &Arc<Self>,
        kind: StoreKind,
        request: RequestBuilder,
        load_relay_lists: bool,
    ) -> Result<OpenedQuery> {
        let filters = request.build();
        if filters.is_empty() {
            return Err(ClientError::EmptyRequest);
        }
        let fingerprint = format!("{:?}|{}", kind, request.fingerprint());
        let hints = request.relay_hints();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(ClientError::ConnectionClosed("pool is shut down".to_string()));
        }
        let id = state.next_query;
        state.next_query += 1;

        if let Some(sub_id) = state.coalesce.get(&fingerprint).cloned()
            && let Some(physical) = state.physicals.get_mut(&sub_id)
        {
            physical.refs += 1;
            let store = physical.store.clone();
            state.queries.insert(id, sub_id.clone());
            debug!("Query {} joins subscription {}", request.id(), sub_id);
            return Ok(OpenedQuery {
                id,
                subscription_id: sub_id,
                store,
            });
        }

        let authors: BTreeSet<String> = if hints.is_empty() {
            filters
                .iter()
                .filter_map(|f| f.authors.as_ref())
                .flatten()
                .cloned()
                .collect()
        } else {
            BTreeSet::new()
        };
        // Lists sitting in the store must be in memory before routing.
        let unbuffered: Vec<String> = if self.relay_lists.has_store() {
            authors
                .iter()
                .filter(|a| !self.relay_lists.contains(a))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let mut wants_relay_lists = false;
        if load_relay_lists {
            let loader = &mut state.relay_loader;
            for author in &authors {
                if !loader.wanted.contains_key(author)
                    && self
                        .relay_lists
                        .is_stale(author, self.config.relay_list_expiry)
                {
                    loader.wanted.insert(author.clone(), 1);
                    wants_relay_lists = true;
                }
            }
            loader.buffering.extend(unbuffered.iter().cloned());
        }

        let subscription_id = generate_subscription_id();
        let store = NoteStore::new(kind, self.config.notify_window);
        state.physicals.insert(
            subscription_id.clone(),
            PhysicalSub {
                label: request.id().to_string(),
                fingerprint: fingerprint.clone(),
                store: store.clone(),
                filters,
                hints,
                shards: HashMap::new(),
                tracker: SubscriptionTracker::new(subscription_id.clone()),
                leave_open: request.is_leave_open(),
                timeout: request.timeout_value().unwrap_or(self.config.query_timeout),
                refs: 1,
                finished: false,
            },
        );
        state.coalesce.insert(fingerprint, subscription_id.clone());
        state.queries.insert(id, subscription_id.clone());

        let deferred = !unbuffered.is_empty();
        let routed = if deferred {
            debug!(
                "Query {} waits for {} relay lists from the store",
                request.id(),
                unbuffered.len()
            );
            None
        } else {
            Some(self.route_locked(state, &subscription_id))
        };
        drop(guard);

        if let Some(routed) = routed {
            self.after_route(&subscription_id, routed);
        }
        if deferred {
            self.spawn_buffer(Loader::RelayLists, unbuffered, Some(subscription_id.clone()));
        } else if wants_relay_lists
            && let Err(e) = self.refresh_loader(Loader::RelayLists)
        {
            debug!("Refreshing relay lists failed: {}", e);
        }

        Ok(OpenedQuery {
            id,
            subscription_id,
            store,
        })
    }

    /// Plan a registered subscription and queue its REQs.
    fn route_locked(&self, state: &mut PoolState, subscription_id: &str) -> Routed {
        let (plan, label) = match state.physicals.get(subscription_id) {
            Some(physical) => (
                self.plan(state, &physical.hints, &physical.filters),
                physical.label.clone(),
            ),
            None => return Routed::default(),
        };
        if plan.is_empty() {
            warn!("No relays to send query {} to", label);
        }

        let mut created = Vec::new();
        let mut sent = Vec::new();
        for shard in plan {
            let conn = match self.ensure_connection(state, &shard.relay, false) {
                Ok((conn, fresh)) => {
                    if fresh {
                        created.push(conn.url().to_string());
                    }
                    conn
                }
                Err(e) => {
                    warn!("Skipping relay {} for {}: {}", shard.relay, label, e);
                    continue;
                }
            };
            if let Err(e) = conn.send(subscription_id, shard.filters.clone()) {
                warn!("Failed to send {} to {}: {}", subscription_id, shard.relay, e);
                continue;
            }
            sent.push(shard);
        }

        let Some(physical) = state.physicals.get_mut(subscription_id) else {
            return Routed {
                created,
                ..Default::default()
            };
        };
        for shard in sent {
            physical.tracker.add_relay(shard.relay.clone());
            physical.shards.insert(shard.relay, shard.filters);
        }
        debug!(
            "Query {} sent as {} to {} relays",
            label,
            subscription_id,
            physical.tracker.relay_count()
        );
        if physical.tracker.relay_count() > 0 {
            return Routed {
                created,
                timeout: Some(physical.timeout),
                ..Default::default()
            };
        }

        physical.finished = true;
        let store = physical.store.clone();
        let fingerprint = physical.fingerprint.clone();
        if state.coalesce.get(&fingerprint).map(String::as_str) == Some(subscription_id) {
            state.coalesce.remove(&fingerprint);
        }
        Routed {
            created,
            timeout: None,
            unrouted: Some(store),
            release: self.loader_finished(state, subscription_id),
        }
    }

    fn after_route(self: &Arc<Self>, subscription_id: &str, routed: Routed) {
        for url in routed.created {
            self.spawn_relay_info(url);
        }
        if let Some(store) = routed.unrouted {
            store.set_loading(false);
        }
        if let Some(id) = routed.release {
            self.cancel_query(id);
        }
        if let Some(timeout) = routed.timeout {
            let pool = Arc::downgrade(self);
            let sub_id = subscription_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = pool.upgrade() {
                    inner.force_eose(&sub_id);
                }
            });
        }
    }

    /// Route a subscription whose relay lists were being buffered.
    fn route(self: &Arc<Self>, subscription_id: &str) {
        let routed = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            self.route_locked(&mut state, subscription_id)
        };
        self.after_route(subscription_id, routed);
    }

    fn cancel_query(&self, id: QueryId) -> bool {
        let mut state = self.state.lock();
        let Some(sub_id) = state.queries.remove(&id) else {
            return false;
        };

        let released = match state.physicals.get_mut(&sub_id) {
            Some(physical) => {
                physical.refs = physical.refs.saturating_sub(1);
                physical.refs == 0
            }
            None => false,
        };
        if !released {
            return true;
        }

        if let Some(physical) = state.physicals.remove(&sub_id) {
            if state.coalesce.get(&physical.fingerprint) == Some(&sub_id) {
                state.coalesce.remove(&physical.fingerprint);
            }
            for relay in physical.tracker.relays() {
                if let Some(entry) = state.connections.get(relay) {
                    entry.conn.close_subscription(&sub_id);
                }
            }
            debug!("Closed subscription {}", sub_id);
        }
        true
    }

    fn handle_notification(&self, notification: RelayNotification) {
        let RelayNotification { relay_url, event } = notification;
        match event {
            ConnectionEvent::StatusChanged(state) => {
                let _ = self.events_tx.send(PoolEvent::RelayStatus { relay_url, state });
            }
            ConnectionEvent::Event {
                subscription_id,
                event,
            } => self.handle_event(&relay_url, &subscription_id, event),
            ConnectionEvent::Eose { subscription_id } => {
                self.mark_progress(&relay_url, &subscription_id, RelayProgress::Eose);
            }
            ConnectionEvent::EoseTimeout { subscription_id } => {
                self.mark_progress(&relay_url, &subscription_id, RelayProgress::TimedOut);
            }
            ConnectionEvent::Closed {
                subscription_id,
                message,
            } => {
                self.mark_progress(&relay_url, &subscription_id, RelayProgress::Closed);
                let _ = self.events_tx.send(PoolEvent::SubscriptionClosed {
                    relay_url,
                    subscription_id,
                    message,
                });
            }
            ConnectionEvent::SubscriptionCancelled { subscription_id } => {
                self.mark_progress(&relay_url, &subscription_id, RelayProgress::Closed);
            }
            ConnectionEvent::Ok {
                event_id, success, ..
            } => {
                debug!("OK {} from {}: {}", event_id, relay_url, success);
            }
            ConnectionEvent::Notice { message } => {
                let _ = self.events_tx.send(PoolEvent::Notice { relay_url, message });
            }
        }
    }

    fn handle_event(&self, relay_url: &str, subscription_id: &str, event: Event) {
        if !verify_event_id(&event) {
            self.invalid_events.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Dropping event {} from {}: id does not match content",
                event.id, relay_url
            );
            let _ = self.events_tx.send(PoolEvent::InvalidEvent {
                relay_url: relay_url.to_string(),
                event_id: event.id,
            });
            return;
        }

        let store = {
            let state = self.state.lock();
            let Some(physical) = state.physicals.get(subscription_id) else {
                debug!("Event for released subscription {}", subscription_id);
                return;
            };
            let matches = physical
                .shards
                .get(relay_url)
                .is_some_and(|filters| filters.iter().any(|f| f.matches(&event)));
            if !matches {
                debug!(
                    "Event {} from {} does not match subscription {}",
                    event.id, relay_url, subscription_id
                );
                return;
            }
            physical.store.clone()
        };

        let event = Arc::new(event);
        store.add(event.clone());
        self.ingest(&event);
    }

    /// Feed profiles and relay lists into the caches.
    fn ingest(&self, event: &Event) {
        match event.kind {
            KIND_METADATA => match MetadataRecord::from_event(event) {
                Ok(record) => {
                    self.profiles.update(record);
                }
                Err(e) => debug!("Unusable profile {}: {}", event.id, e),
            },
            RELAY_LIST_METADATA_KIND | KIND_CONTACTS => match RelayListRecord::from_event(event) {
                Ok(record) if !record.relays.is_empty() || event.kind == RELAY_LIST_METADATA_KIND => {
                    self.relay_lists.update(record);
                }
                Ok(_) => {}
                Err(e) => debug!("Unusable relay list {}: {}", event.id, e),
            },
            _ => {}
        }
    }

    fn mark_progress(&self, relay_url: &str, subscription_id: &str, progress: RelayProgress) {
        let (store, release) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(physical) = state.physicals.get_mut(subscription_id) else {
                return;
            };
            if !physical.tracker.mark(relay_url, progress) {
                return;
            }
            if physical.finished || !physical.tracker.all_eose() {
                return;
            }
            physical.finished = true;

            let store = physical.store.clone();
            if !physical.leave_open {
                let fingerprint = physical.fingerprint.clone();
                let relays: Vec<String> = physical.tracker.relays().cloned().collect();
                if state.coalesce.get(&fingerprint).map(String::as_str) == Some(subscription_id) {
                    state.coalesce.remove(&fingerprint);
                }
                for relay in relays {
                    if let Some(entry) = state.connections.get(&relay) {
                        entry.conn.close_subscription(subscription_id);
                    }
                }
            }
            (store, self.loader_finished(state, subscription_id))
        };

        debug!("All relays finished {}", subscription_id);
        store.set_loading(false);
        let _ = self.events_tx.send(PoolEvent::AllEose {
            subscription_id: subscription_id.to_string(),
        });
        if let Some(id) = release {
            self.cancel_query(id);
        }
    }

    /// Query timeout: relays still pending count as timed out.
    fn force_eose(&self, subscription_id: &str) {
        let pending = match self.state.lock().physicals.get(subscription_id) {
            Some(physical) if !physical.finished => physical.tracker.pending_relays(),
            _ => return,
        };
        if !pending.is_empty() {
            debug!(
                "Query timeout for {}, {} relays still pending",
                subscription_id,
                pending.len()
            );
        }
        for relay in pending {
            self.mark_progress(&relay, subscription_id, RelayProgress::TimedOut);
        }
    }

    async fn write_to(self: &Arc<Self>, url: &str, event: &Event) -> Result<RelayWriteResult> {
        let (conn, created) = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(ClientError::ConnectionClosed("pool is shut down".to_string()));
            }
            self.ensure_connection(&mut state, url, false)?
        };

        let result = write_with(&conn, event, self.config.write_timeout).await;
        if created {
            self.release_if_unused(conn.url());
        }
        Ok(result)
    }

    fn release_if_unused(&self, url: &str) {
        let released = {
            let mut state = self.state.lock();
            let used = state.connections.get(url).is_none_or(|e| e.explicit)
                || state.physicals.values().any(|p| p.tracker.has_relay(url));
            if used {
                None
            } else {
                state.connections.remove(url)
            }
        };
        if let Some(entry) = released {
            debug!("Closing one-shot connection to {}", url);
            entry.conn.close();
        }
    }

    fn close_idle(&self) {
        let idle: Vec<ConnEntry> = {
            let mut state = self.state.lock();
            let grace = self.config.idle_grace;
            let urls: Vec<String> = state
                .connections
                .iter()
                .filter(|(url, e)| {
                    !e.explicit
                        && e.conn.is_idle(grace)
                        && !state.physicals.values().any(|p| p.tracker.has_relay(url))
                })
                .map(|(url, _)| url.clone())
                .collect();
            urls.iter()
                .filter_map(|url| state.connections.remove(url))
                .collect()
        };
        for entry in idle {
            info!("Closing idle connection to {}", entry.conn.url());
            entry.conn.close();
        }
    }

    fn is_stale(&self, loader: Loader, key: &str) -> bool {
        match loader {
            Loader::Metadata => self.profiles.is_stale(key, self.config.profile_expiry),
            Loader::RelayLists => self
                .relay_lists
                .is_stale(key, self.config.relay_list_expiry),
        }
    }

    fn has_record(&self, loader: Loader, key: &str) -> bool {
        match loader {
            Loader::Metadata => self.profiles.contains(key),
            Loader::RelayLists => self.relay_lists.contains(key),
        }
    }

    /// Replace the loader's query when it no longer matches the keys that
    /// need fetching: wanted, not being buffered, not recently found
    /// missing, and without a fresh record.
    ///
    /// The whole refresh runs under the loader's refresh lock, so the query
    /// installed last was built from the latest wanted set.
    fn refresh_loader(self: &Arc<Self>, loader: Loader) -> Result<()> {
        let _serial = match loader {
            Loader::Metadata => self.metadata_refresh.lock(),
            Loader::RelayLists => self.relay_list_refresh.lock(),
        };

        let needed = {
            let mut state = self.state.lock();
            let retry = self.config.not_found_retry;
            let entry = state.loader(loader);
            entry.not_found.retain(|_, since| since.elapsed() < retry);
            let needed: BTreeSet<String> = entry
                .wanted
                .keys()
                .filter(|key| {
                    !entry.buffering.contains(*key)
                        && !entry.not_found.contains_key(*key)
                        && self.is_stale(loader, key)
                })
                .cloned()
                .collect();
            if !loader.leave_open() {
                entry.wanted.retain(|key, _| {
                    needed.contains(key)
                        || entry.requested.contains(key)
                        || entry.buffering.contains(key)
                });
            }

            let covered = needed.is_subset(&entry.requested)
                && entry.requested.iter().all(|key| entry.wanted.contains_key(key));
            if covered {
                return Ok(());
            }
            needed
        };

        // Open the new query before releasing the old one so the shared
        // connections never look idle in between.
        let replacement = if needed.is_empty() {
            None
        } else {
            debug!("Loading {} for {} keys", loader.name(), needed.len());
            let request = RequestBuilder::new(loader.name())
                .filter(
                    Filter::new()
                        .kinds(loader.kinds())
                        .authors(needed.iter().cloned()),
                )
                .leave_open(loader.leave_open());
            Some(
                self.open_query(StoreKind::Replaceable, request, loader == Loader::Metadata)?
                    .id,
            )
        };

        let (previous, release) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let entry = state.loader(loader);
            entry.requested = needed;
            let previous = std::mem::replace(&mut entry.query, replacement);

            // A fetch with no relay to go to is finished before it is installed.
            let finished = replacement
                .and_then(|id| state.queries.get(&id).cloned())
                .filter(|sub_id| state.physicals.get(sub_id).is_some_and(|p| p.finished));
            let release = finished.and_then(|sub_id| self.loader_finished(state, &sub_id));
            (previous, release)
        };
        for id in previous.into_iter().chain(release) {
            self.cancel_query(id);
        }
        Ok(())
    }

    /// Read `keys` back from the loader's cache store, then route the
    /// subscription that waited for them and refresh the loader.
    fn spawn_buffer(self: &Arc<Self>, loader: Loader, keys: Vec<String>, route: Option<String>) {
        let pool = Arc::downgrade(self);
        let profiles = Arc::clone(&self.profiles);
        let relay_lists = Arc::clone(&self.relay_lists);
        tokio::spawn(async move {
            match loader {
                Loader::Metadata => profiles.buffer(&keys).await,
                Loader::RelayLists => relay_lists.buffer(&keys).await,
            };
            let Some(inner) = pool.upgrade() else {
                return;
            };
            {
                let mut state = inner.state.lock();
                let buffering = &mut state.loader(loader).buffering;
                for key in &keys {
                    buffering.remove(key);
                }
            }
            if let Some(subscription_id) = route {
                inner.route(&subscription_id);
            }
            if let Err(e) = inner.refresh_loader(loader) {
                debug!("Refreshing {} failed: {}", loader.name(), e);
            }
        });
    }

    /// A loader's query has every relay's stored events. Requested keys
    /// still without a record are marked not found; a one-shot fetch is
    /// returned for release.
    fn loader_finished(&self, state: &mut PoolState, subscription_id: &str) -> Option<QueryId> {
        for loader in Loader::ALL {
            let Some(id) = state.loader(loader).query else {
                continue;
            };
            if state.queries.get(&id).map(String::as_str) != Some(subscription_id) {
                continue;
            }

            let now = Instant::now();
            let entry = state.loader(loader);
            let missing: Vec<String> = entry
                .requested
                .iter()
                .filter(|key| !self.has_record(loader, key))
                .cloned()
                .collect();
            if !missing.is_empty() {
                debug!("No {} found for {} keys", loader.name(), missing.len());
            }
            for key in missing {
                entry.not_found.insert(key, now);
            }

            if loader.leave_open() {
                return None;
            }
            for key in std::mem::take(&mut entry.requested) {
                entry.wanted.remove(&key);
            }
            return entry.query.take();
        }
        None
    }

    fn shutdown(&self) {
        let (connections, stores) = {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.coalesce.clear();
            state.queries.clear();
            state.metadata = LoaderState::default();
            state.relay_loader = LoaderState::default();
            let stores: Vec<NoteStore> = state.physicals.drain().map(|(_, p)| p.store).collect();
            let connections: Vec<ConnEntry> = state.connections.drain().map(|(_, e)| e).collect();
            (connections, stores)
        };

        info!("Shutting down relay pool ({} connections)", connections.len());
        for entry in connections {
            entry.conn.close();
        }
        for store in stores {
            store.set_loading(false);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for entry in self.state.get_mut().connections.values() {
            entry.conn.close();
        }
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
