//! Nostr relay runtime.
//!
//! This crate provides:
//! - WebSocket connections to Nostr relays with reconnect, subscription
//!   limits and EOSE tracking
//! - NIP-11 relay information fetching and caching
//! - Outbox (gossip) routing of requests to the relays authors write to
//! - A relay pool that coalesces identical queries into one subscription
//!   and merges results into reactive note stores
//! - Profile and relay-list caches with write-behind persistence
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{PoolConfig, RelayPool, RequestBuilder, StoreKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = RelayPool::new(PoolConfig {
//!         default_relays: vec!["wss://relay.damus.io".to_string()],
//!         ..Default::default()
//!     });
//!
//!     let notes = pool.query(
//!         StoreKind::Flat,
//!         RequestBuilder::new("home").kinds([1]).leave_open(true),
//!     )?;
//!
//!     notes.store().subscribe(|snapshot| {
//!         println!("{} notes", snapshot.len());
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     notes.cancel();
//!     pool.shutdown();
//!     Ok(())
//! }
//! ```

mod cache;
mod error;
mod message;
mod outbox;
mod pool;
mod queue;
mod recovery;
mod relay;
mod relay_info;
mod signer;
mod store;
mod subscription;

pub use cache::{
    CacheConfig, CacheStats, CacheStore, CachedRecord, FeedCache, MemoryStore, MetadataRecord,
    RelayListRecord, UpdateType, classify_update,
};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use outbox::{
    MemoryDirectory, OutboxConfig, OutboxRouter, RelayDirectory, RelayShard, publish_relays,
};
pub use pool::{PoolConfig, PoolEvent, QueryHandle, QueryId, RelayPool, RelayWriteResult};
pub use queue::WorkQueue;
pub use recovery::{ExponentialBackoff, Jitter};
pub use relay::{
    ConnectionEvent, ConnectionState, ConnectionStats, PublishConfirmation, RelayConfig,
    RelayConnection, RelayNotification, RelaySettings, normalize_relay_url,
};
pub use relay_info::{NOSTR_JSON, RelayInfoCache, RelayInfoConfig, http_url_for};
pub use signer::{EventSigner, sign_checked};
pub use store::{DEFAULT_NOTIFY_WINDOW, ListenerId, NoteStore, Snapshot, StoreKind};
pub use subscription::{
    RelayProgress, RequestBuilder, SubscriptionTracker, generate_subscription_id,
};

/// Relays used when nothing better is known.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// Create a relay pool with the default configuration, which falls back to
/// [`DEFAULT_RELAYS`]. Must be called within a Tokio runtime.
pub fn default_pool() -> RelayPool {
    RelayPool::new(PoolConfig::default())
}
