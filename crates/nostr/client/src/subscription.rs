//! Request descriptions and per-relay subscription progress.
//!
//! A [`RequestBuilder`] says what to fetch (filters) and how to deliver it
//! (keep open, relay hints). Its [`fingerprint`](RequestBuilder::fingerprint)
//! identifies semantically equal requests so the pool can share one physical
//! subscription between callers.

use crate::message::Filter;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Declarative description of one logical query.
#[derive(Debug, Clone, Default)]
pub struct RequestBuilder {
    id: String,
    filters: Vec<Filter>,
    leave_open: bool,
    relays: BTreeSet<String>,
    /// event id -> relay known to hold it
    event_hints: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl RequestBuilder {
    /// Start a request. The id names the caller's query in logs.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a filter; filters in one request are OR'd.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a filter for specific event kinds.
    pub fn kinds(self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.filter(Filter::new().kinds(kinds))
    }

    /// Add a filter for events from specific authors.
    pub fn authors(self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.filter(Filter::new().authors(authors))
    }

    /// Keep receiving live events after EOSE until cancelled.
    pub fn leave_open(mut self, leave_open: bool) -> Self {
        self.leave_open = leave_open;
        self
    }

    /// Send to exactly these relays instead of routing by author.
    pub fn relays(mut self, relays: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.relays.extend(relays.into_iter().map(Into::into));
        self
    }

    /// Fetch one event by id from a relay known to have it.
    pub fn event_with_hint(mut self, event_id: impl Into<String>, relay: impl Into<String>) -> Self {
        self.event_hints.insert(event_id.into(), relay.into());
        self
    }

    /// Override the pool's query timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_leave_open(&self) -> bool {
        self.leave_open
    }

    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    /// Explicit relay targets: `relays(..)` plus every event hint relay, sorted.
    pub fn relay_hints(&self) -> Vec<String> {
        let mut relays: BTreeSet<String> = self.relays.clone();
        relays.extend(self.event_hints.values().cloned());
        relays.into_iter().collect()
    }

    /// The filter set, with hinted event ids gathered into one extra filter.
    pub fn build(&self) -> Vec<Filter> {
        let mut filters = self.filters.clone();
        if !self.event_hints.is_empty() {
            filters.push(Filter::new().ids(self.event_hints.keys().cloned()));
        }
        filters
    }

    /// Canonical identity of this request.
    ///
    /// Filters are normalized, serialized, sorted and deduplicated, so the
    /// order of filters and of values inside them does not matter. The
    /// caller-facing `id` and `timeout` are not part of the identity.
    pub fn fingerprint(&self) -> String {
        let filters: BTreeSet<String> = self
            .build()
            .iter()
            .map(|f| serde_json::to_string(&f.normalized()).unwrap_or_default())
            .collect();

        serde_json::json!({
            "filters": filters,
            "leave_open": self.leave_open,
            "relays": self.relay_hints(),
        })
        .to_string()
    }
}

/// Where one relay stands on one physical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayProgress {
    /// REQ sent (or queued), stored events still coming
    Pending,
    Eose,
    /// No EOSE in time; live events may still arrive
    TimedOut,
    /// CLOSED by the relay or cancelled by the connection
    Closed,
}

/// Tracks which relays a subscription went to and which have finished.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    /// Subscription ID
    pub id: String,
    relays: BTreeMap<String, RelayProgress>,
}

impl SubscriptionTracker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            relays: BTreeMap::new(),
        }
    }

    /// Add a relay to this subscription.
    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        self.relays
            .entry(relay_url.into())
            .or_insert(RelayProgress::Pending);
    }

    /// Forget a relay entirely.
    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
    }

    /// Record progress for a relay. Returns whether anything changed.
    /// Only a pending relay can move on.
    pub fn mark(&mut self, relay_url: &str, progress: RelayProgress) -> bool {
        match self.relays.get_mut(relay_url) {
            Some(current) if *current == RelayProgress::Pending && progress != RelayProgress::Pending => {
                *current = progress;
                true
            }
            _ => false,
        }
    }

    /// Mark EOSE received from a relay.
    pub fn mark_eose(&mut self, relay_url: &str) -> bool {
        self.mark(relay_url, RelayProgress::Eose)
    }

    pub fn progress(&self, relay_url: &str) -> Option<RelayProgress> {
        self.relays.get(relay_url).copied()
    }

    /// Every relay has stopped sending stored events.
    pub fn all_eose(&self) -> bool {
        !self.relays.is_empty()
            && self
                .relays
                .values()
                .all(|p| *p != RelayProgress::Pending)
    }

    pub fn pending_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|(_, p)| **p == RelayProgress::Pending)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Check if a relay has this subscription.
    pub fn has_relay(&self, relay_url: &str) -> bool {
        self.relays.contains_key(relay_url)
    }

    pub fn relays(&self) -> impl Iterator<Item = &String> {
        self.relays.keys()
    }

    /// Get the number of relays with this subscription.
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_generate_subscription_id() {
        let id1 = generate_subscription_id();
        let id2 = generate_subscription_id();
        assert_eq!(id1.len(), 12);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_build_with_event_hints() {
        let request = RequestBuilder::new("thread")
            .kinds([1])
            .event_with_hint("ee", "wss://b.com")
            .event_with_hint("dd", "wss://a.com")
            .relays(["wss://c.com"]);

        assert_eq!(
            request.build(),
            vec![Filter::new().kinds([1]), Filter::new().ids(["dd", "ee"])]
        );
        assert_eq!(
            request.relay_hints(),
            vec!["wss://a.com", "wss://b.com", "wss://c.com"]
        );
    }

    #[test]
    fn test_fingerprint_ignores_order_and_id() {
        let a = RequestBuilder::new("one")
            .filter(Filter::new().authors(["b", "a"]).kinds([1]))
            .filter(Filter::new().tag("t", ["rust"]));
        let b = RequestBuilder::new("two")
            .filter(Filter::new().tag("#t", ["rust"]))
            .filter(Filter::new().kinds([1]).authors(["a", "b", "a"]))
            .timeout(Duration::from_secs(1));

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_delivery() {
        let base = RequestBuilder::new("q").kinds([1]);
        assert_ne!(base.fingerprint(), base.clone().leave_open(true).fingerprint());
        assert_ne!(
            base.fingerprint(),
            base.clone().relays(["wss://a.com"]).fingerprint()
        );
        assert_ne!(
            RequestBuilder::new("q")
                .filter(Filter::new().tag("t", ["Rust"]))
                .fingerprint(),
            RequestBuilder::new("q")
                .filter(Filter::new().tag("t", ["rust"]))
                .fingerprint()
        );
    }

    #[test]
    fn test_tracker_all_eose() {
        let mut tracker = SubscriptionTracker::new("sub");
        assert!(!tracker.all_eose());

        tracker.add_relay("wss://a.com");
        tracker.add_relay("wss://b.com");
        assert!(tracker.mark_eose("wss://a.com"));
        assert!(!tracker.mark_eose("wss://a.com"));
        assert!(!tracker.all_eose());
        assert_eq!(tracker.pending_relays(), vec!["wss://b.com"]);

        assert!(tracker.mark("wss://b.com", RelayProgress::TimedOut));
        assert!(tracker.all_eose());

        // a late EOSE does not rewrite history
        assert!(!tracker.mark_eose("wss://b.com"));
        assert_eq!(tracker.progress("wss://b.com"), Some(RelayProgress::TimedOut));
    }

    #[test]
    fn test_tracker_remove_relay() {
        let mut tracker = SubscriptionTracker::new("sub");
        tracker.add_relay("wss://a.com");
        tracker.add_relay("wss://b.com");
        tracker.mark_eose("wss://a.com");
        tracker.remove_relay("wss://b.com");

        assert!(tracker.all_eose());
        assert!(!tracker.has_relay("wss://b.com"));
        assert_eq!(tracker.relay_count(), 1);
    }
}
