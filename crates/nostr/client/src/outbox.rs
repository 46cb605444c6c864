//! Outbox model for relay selection
//!
//! Implements the NIP-65 outbox model: events FROM a user are fetched from
//! that user's WRITE relays, and an event is published to the author's WRITE
//! relays plus the READ relays of every tagged user.
//!
//! [`OutboxRouter::route`] splits a filter set into per-relay shards so each
//! relay only sees the authors it actually serves. The result is a pure
//! function of the filters and the directory snapshot, which keeps query
//! fingerprints stable.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::relay::normalize_relay_url;
use nostr::{Event, RelayListMetadata};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Source of per-author relay lists.
///
/// `None` means the author's list is unknown; `Some(vec![])` means the author
/// published a list with no relays of that kind. Both route to the fallback.
pub trait RelayDirectory: Send + Sync {
    /// Relays the author publishes to.
    fn write_relays(&self, pubkey: &str) -> Option<Vec<String>>;

    /// Relays the author reads mentions from.
    fn read_relays(&self, _pubkey: &str) -> Option<Vec<String>> {
        None
    }
}

/// In-memory relay directory keyed by pubkey. Keeps the newest list per author.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    lists: RwLock<HashMap<String, (u64, RelayListMetadata)>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an author's relay list directly.
    pub fn insert(&self, pubkey: impl Into<String>, metadata: RelayListMetadata) {
        self.lists.write().insert(pubkey.into(), (0, metadata));
    }

    /// Update from a kind 10002 (or legacy kind 3) event. Older events than
    /// the one held are ignored; returns whether the directory changed.
    pub fn update_from_event(&self, event: &Event) -> Result<bool> {
        let metadata = RelayListMetadata::from_event(event)
            .map_err(|e| ClientError::InvalidEvent(e.to_string()))?;

        let mut lists = self.lists.write();
        if let Some((created_at, _)) = lists.get(&event.pubkey)
            && *created_at > event.created_at
        {
            return Ok(false);
        }
        lists.insert(event.pubkey.clone(), (event.created_at, metadata));
        Ok(true)
    }

    pub fn remove(&self, pubkey: &str) {
        self.lists.write().remove(pubkey);
    }

    pub fn len(&self) -> usize {
        self.lists.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RelayDirectory for MemoryDirectory {
    fn write_relays(&self, pubkey: &str) -> Option<Vec<String>> {
        self.lists
            .read()
            .get(pubkey)
            .map(|(_, list)| list.write_relays())
    }

    fn read_relays(&self, pubkey: &str) -> Option<Vec<String>> {
        self.lists
            .read()
            .get(pubkey)
            .map(|(_, list)| list.read_relays())
    }
}

/// Configuration for outbox routing
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Write relays used per author
    pub pick_n: usize,
    /// Relays for authors without a usable relay list and for author-less filters
    pub fallback_relays: Vec<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            pick_n: 2,
            fallback_relays: vec![],
        }
    }
}

/// The part of a request one relay should receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayShard {
    pub relay: String,
    pub filters: Vec<Filter>,
}

/// Splits filter sets into per-relay shards.
#[derive(Debug, Clone, Default)]
pub struct OutboxRouter {
    config: OutboxConfig,
}

/// Valid, normalized, deduplicated relay URLs in their original order.
fn clean_relays(relays: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    relays
        .into_iter()
        .filter_map(|url| match normalize_relay_url(&url) {
            Ok(url) => Some(url),
            Err(e) => {
                debug!("Skipping relay {}: {}", url, e);
                None
            }
        })
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

impl OutboxRouter {
    pub fn new(config: OutboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Route `filters` to relays.
    ///
    /// Within a filter, every write relay is scored by how many of the
    /// filter's authors list it. Each author goes to its `pick_n` best scored
    /// relays (ties by URL). Authors with no relays go to every fallback
    /// relay, as do filters without authors. `fallback` overrides the
    /// configured fallback set when non-empty.
    pub fn route(
        &self,
        directory: &dyn RelayDirectory,
        filters: &[Filter],
        fallback: &[String],
    ) -> Vec<RelayShard> {
        let fallback = if fallback.is_empty() {
            clean_relays(self.config.fallback_relays.iter().cloned())
        } else {
            clean_relays(fallback.iter().cloned())
        };
        let pick_n = self.config.pick_n.max(1);
        let mut shards: BTreeMap<String, Vec<Filter>> = BTreeMap::new();

        for filter in filters {
            let Some(authors) = filter.authors.as_ref().filter(|a| !a.is_empty()) else {
                for relay in &fallback {
                    push_unique(shards.entry(relay.clone()).or_default(), filter.clone());
                }
                continue;
            };

            let mut relays_by_author: BTreeMap<&str, Vec<String>> = BTreeMap::new();
            let mut score: HashMap<String, usize> = HashMap::new();
            for author in authors {
                if relays_by_author.contains_key(author.as_str()) {
                    continue;
                }
                let relays = clean_relays(directory.write_relays(author).unwrap_or_default());
                for relay in &relays {
                    *score.entry(relay.clone()).or_default() += 1;
                }
                relays_by_author.insert(author.as_str(), relays);
            }

            let mut authors_by_relay: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for (author, mut relays) in relays_by_author {
                if relays.is_empty() {
                    if fallback.is_empty() {
                        warn!("No relay to route author {} to", author);
                    }
                    for relay in &fallback {
                        authors_by_relay
                            .entry(relay.clone())
                            .or_default()
                            .insert(author.to_string());
                    }
                    continue;
                }

                relays.sort_by(|a, b| score[b].cmp(&score[a]).then_with(|| a.cmp(b)));
                for relay in relays.into_iter().take(pick_n) {
                    authors_by_relay
                        .entry(relay)
                        .or_default()
                        .insert(author.to_string());
                }
            }

            for (relay, authors) in authors_by_relay {
                let mut shard_filter = filter.clone();
                shard_filter.authors = Some(authors.into_iter().collect());
                push_unique(shards.entry(relay).or_default(), shard_filter);
            }
        }

        debug!("Routed {} filters to {} relays", filters.len(), shards.len());
        shards
            .into_iter()
            .map(|(relay, filters)| RelayShard { relay, filters })
            .collect()
    }
}

fn push_unique(filters: &mut Vec<Filter>, filter: Filter) {
    if !filters.contains(&filter) {
        filters.push(filter);
    }
}

/// Relays to publish `event` to: the author's WRITE relays plus the READ
/// relays of every `p`-tagged user. Falls back to `fallback` if that is empty.
pub fn publish_relays(
    directory: &dyn RelayDirectory,
    event: &Event,
    fallback: &[String],
) -> Vec<String> {
    let mut relays = directory.write_relays(&event.pubkey).unwrap_or_default();
    for tagged in event.tag_values("p") {
        relays.extend(directory.read_relays(tagged).unwrap_or_default());
    }

    let mut relays = clean_relays(relays);
    if relays.is_empty() {
        relays = clean_relays(fallback.iter().cloned());
    }
    relays.sort();
    relays
}
