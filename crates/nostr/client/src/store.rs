//! Reactive, deduplicating event containers.
//!
//! A [`NoteStore`] holds the result set of one logical query. Every merge
//! policy is commutative: the final state does not depend on the order in
//! which relays deliver events. Change notifications are coalesced so a burst
//! of inbound events produces one callback.

use nostr::{Event, sort_events};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Default coalescing window for change notifications.
pub const DEFAULT_NOTIFY_WINDOW: Duration = Duration::from_millis(500);

/// Merge policy of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Newest event per replaceable key (`kind:pubkey[:d]`)
    Replaceable,
    /// Every matching event, deduplicated by id
    Flat,
    /// Like `Flat`, plus a reference time for paging and "new events" counts
    Collection,
}

/// Immutable view of a store's events, newest first.
pub type Snapshot = Arc<Vec<Arc<Event>>>;

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(Snapshot) + Send + Sync>;

#[derive(Default)]
struct StoreState {
    /// Keyed by replaceable key for `Replaceable`, by id otherwise
    entries: HashMap<String, Arc<Event>>,
    snapshot: Option<Snapshot>,
    loading: bool,
    reference_time: Option<u64>,
    notify_pending: bool,
}

struct StoreInner {
    kind: StoreKind,
    window: Duration,
    state: Mutex<StoreState>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

/// Shared handle to a note store. Clones see the same events.
#[derive(Clone)]
pub struct NoteStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for NoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteStore")
            .field("kind", &self.inner.kind)
            .field("len", &self.len())
            .finish()
    }
}

/// `candidate` wins over `current` for the same replaceable key. Equal
/// timestamps go to the lower id so arrival order never matters.
fn supersedes(candidate: &Event, current: &Event) -> bool {
    candidate.created_at > current.created_at
        || (candidate.created_at == current.created_at && candidate.id < current.id)
}

impl NoteStore {
    /// A store that notifies at most once per `window`. A zero window
    /// notifies synchronously on every change.
    pub fn new(kind: StoreKind, window: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                kind,
                window,
                state: Mutex::new(StoreState {
                    loading: true,
                    ..Default::default()
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.inner.kind
    }

    /// Insert an event. Returns whether the store changed.
    pub fn add(&self, event: Arc<Event>) -> bool {
        let changed = self.inner.insert(event);
        if changed {
            self.inner.schedule_notify();
        }
        changed
    }

    /// Insert many events with at most one notification.
    pub fn add_all(&self, events: impl IntoIterator<Item = Arc<Event>>) -> usize {
        let added = events
            .into_iter()
            .filter(|event| self.inner.insert(event.clone()))
            .count();
        if added > 0 {
            self.inner.schedule_notify();
        }
        added
    }

    /// Current events, newest first (ties by id). Cached until the next change.
    pub fn snapshot(&self) -> Snapshot {
        let mut state = self.inner.state.lock();
        if let Some(snapshot) = &state.snapshot {
            return snapshot.clone();
        }

        let mut events: Vec<Arc<Event>> = state.entries.values().cloned().collect();
        sort_events(&mut events);
        let snapshot = Arc::new(events);
        state.snapshot = Some(snapshot.clone());
        snapshot
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, event_id: &str) -> bool {
        let state = self.inner.state.lock();
        match self.inner.kind {
            StoreKind::Replaceable => state.entries.values().any(|e| e.id == event_id),
            _ => state.entries.contains_key(event_id),
        }
    }

    /// True until every relay has finished sending stored events.
    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    pub fn set_loading(&self, loading: bool) {
        let changed = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.loading, loading) != loading
        };
        if changed {
            self.inner.schedule_notify();
        }
    }

    pub fn reference_time(&self) -> Option<u64> {
        self.inner.state.lock().reference_time
    }

    /// Mark what the consumer has seen; later events count as new.
    pub fn set_reference_time(&self, timestamp: u64) {
        self.inner.state.lock().reference_time = Some(timestamp);
    }

    /// `until` for the next older page: the oldest `created_at` held.
    pub fn next_page_until(&self) -> Option<u64> {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .map(|e| e.created_at)
            .min()
    }

    /// Events newer than the reference time, newest first. Without a
    /// reference time nothing counts as new.
    pub fn newer_than_reference(&self) -> Vec<Arc<Event>> {
        let Some(reference) = self.reference_time() else {
            return Vec::new();
        };
        self.snapshot()
            .iter()
            .take_while(|e| e.created_at > reference)
            .cloned()
            .collect()
    }

    /// Register a change callback.
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(Snapshot) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl StoreInner {
    fn insert(&self, event: Arc<Event>) -> bool {
        let mut state = self.state.lock();
        let key = match self.kind {
            StoreKind::Replaceable => event.replaceable_key(),
            StoreKind::Flat | StoreKind::Collection => event.id.clone(),
        };

        let accept = match state.entries.get(&key) {
            Some(current) => self.kind == StoreKind::Replaceable && supersedes(&event, current),
            None => true,
        };
        if accept {
            state.entries.insert(key, event);
            state.snapshot = None;
        }
        accept
    }

    fn schedule_notify(self: &Arc<Self>) {
        if self.window.is_zero() {
            self.notify_now();
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.notify_now();
            return;
        };

        {
            let mut state = self.state.lock();
            if state.notify_pending {
                return;
            }
            state.notify_pending = true;
        }

        let weak: Weak<StoreInner> = Arc::downgrade(self);
        let deadline = tokio::time::Instant::now() + self.window;
        handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().notify_pending = false;
                inner.notify_now();
            }
        });
    }

    fn notify_now(self: &Arc<Self>) {
        let listeners: Vec<Listener> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        if listeners.is_empty() {
            return;
        }
        let snapshot = NoteStore {
            inner: Arc::clone(self),
        }
        .snapshot();
        debug!("Notifying {} listeners of {} events", listeners.len(), snapshot.len());
        for listener in listeners {
            listener(snapshot.clone());
        }
    }
}
