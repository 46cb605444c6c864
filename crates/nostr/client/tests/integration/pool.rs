//! Relay pool integration tests

use super::*;
use async_trait::async_trait;
use nostr::{RelayEntry, verify_event_id};
use nostr_client::{
    CacheConfig, CacheStore, ClientError, EventSigner, FeedCache, MemoryStore, PoolConfig,
    RelayListRecord, RelayPool, RelaySettings, RequestBuilder, StoreKind,
};
use std::time::{SystemTime, UNIX_EPOCH};

fn test_config(default_relays: &[&MockRelay]) -> PoolConfig {
    PoolConfig {
        default_relays: default_relays.iter().map(|r| r.url.clone()).collect(),
        fetch_relay_info: false,
        notify_window: Duration::ZERO,
        ..Default::default()
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A freshly loaded relay list.
fn writes_to(pubkey: &str, relays: &[&MockRelay]) -> RelayListRecord {
    RelayListRecord {
        pubkey: pubkey.to_string(),
        relays: relays.iter().map(|r| RelayEntry::write(r.url.clone())).collect(),
        created: 1_700_000_000,
        loaded: now(),
    }
}

struct TestSigner {
    pubkey: String,
}

#[async_trait]
impl EventSigner for TestSigner {
    fn pubkey(&self) -> String {
        self.pubkey.clone()
    }

    async fn sign(&self, template: EventTemplate) -> nostr_client::Result<Event> {
        template
            .into_unsigned(self.pubkey.clone())
            .into_event("00".repeat(64))
            .map_err(|e| ClientError::Signing(e.to_string()))
    }
}

#[tokio::test]
async fn test_query_follows_author_relay_list() {
    let author_relay = MockRelay::start().await;
    let default_relay = MockRelay::start().await;
    let pool = RelayPool::new(test_config(&[&default_relay]));

    let alice = "a1".repeat(32);
    let note = make_event(&alice, 1, 1_700_000_100, "hello from alice");
    author_relay.store(note.clone());
    author_relay.store(make_event(&"b2".repeat(32), 1, 1_700_000_101, "not alice"));
    pool.relay_lists().update(writes_to(&alice, &[&author_relay]));

    let handle = pool
        .query(
            StoreKind::Flat,
            RequestBuilder::new("alice-notes")
                .filter(Filter::new().kinds([1]).authors([alice.as_str()])),
        )
        .unwrap();
    wait_until("query to finish", || !handle.store().is_loading()).await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(*snapshot[0], note);

    assert_eq!(author_relay.received("REQ").len(), 1);
    assert!(default_relay.received("REQ").is_empty());
    wait_until("CLOSE after EOSE", || author_relay.received("CLOSE").len() == 1).await;
    pool.shutdown();
}

#[tokio::test]
async fn test_identical_queries_share_one_req() {
    let relay = MockRelay::start().await;
    let pool = RelayPool::new(test_config(&[&relay]));
    let request = || {
        RequestBuilder::new("feed")
            .filter(Filter::new().kinds([1]).limit(20))
            .leave_open(true)
    };

    let first = pool.query(StoreKind::Flat, request()).unwrap();
    let second = pool.query(StoreKind::Flat, request()).unwrap();
    assert_eq!(first.subscription_id(), second.subscription_id());
    wait_until("EOSE", || !first.store().is_loading()).await;
    assert_eq!(relay.received("REQ").len(), 1);

    first.cancel();
    sleep(Duration::from_millis(100)).await;
    assert!(relay.received("CLOSE").is_empty());

    second.cancel();
    wait_until("CLOSE after last cancel", || relay.received("CLOSE").len() == 1).await;
    assert_eq!(pool.subscription_count(), 0);
    pool.shutdown();
}

#[tokio::test]
async fn test_forged_events_are_dropped() {
    let relay = MockRelay::start().await;
    let pool = RelayPool::new(test_config(&[&relay]));

    let good = make_event(&"c3".repeat(32), 1, 1_700_000_200, "genuine");
    let mut forged = make_event(&"c3".repeat(32), 1, 1_700_000_201, "original");
    forged.content = "rewritten".to_string();
    relay.store(good.clone());
    relay.store(forged);

    let handle = pool
        .query(StoreKind::Flat, RequestBuilder::new("notes").kinds([1]))
        .unwrap();
    wait_until("query to finish", || !handle.store().is_loading()).await;

    assert_eq!(handle.store().len(), 1);
    assert!(handle.store().contains(&good.id));
    assert_eq!(pool.invalid_events(), 1);
    pool.shutdown();
}

#[tokio::test]
async fn test_broadcast_reports_each_relay() {
    let accepting = MockRelay::start().await;
    let rejecting = MockRelay::start().await;
    rejecting.reject_writes();
    let pool = RelayPool::new(test_config(&[]));

    let a = pool
        .connect_to_relay(&accepting.url, RelaySettings::default())
        .unwrap();
    let b = pool
        .connect_to_relay(&rejecting.url, RelaySettings::default())
        .unwrap();
    wait_until("connections to open", || a.is_open() && b.is_open()).await;

    let event = make_event(&"d4".repeat(32), 1, 1_700_000_300, "to everyone");
    let mut results = pool.broadcast(&event).await.unwrap();
    results.sort_by(|x, y| x.relay.cmp(&y.relay));
    assert_eq!(results.len(), 2);

    let accepted = results.iter().find(|r| r.relay == accepting.url).unwrap();
    let rejected = results.iter().find(|r| r.relay == rejecting.url).unwrap();
    assert!(accepted.ok);
    assert!(!rejected.ok);
    assert!(rejected.message.starts_with("blocked"));
    pool.shutdown();
}

#[tokio::test]
async fn test_write_once_releases_its_connection() {
    let relay = MockRelay::start().await;
    let pool = RelayPool::new(test_config(&[]));

    let event = make_event(&"e5".repeat(32), 1, 1_700_000_400, "just once");
    let result = pool.write_once(&relay.url, &event).await.unwrap();
    assert!(result.ok);
    assert_eq!(relay.received("EVENT").len(), 1);
    assert!(pool.relay_urls().is_empty());
    pool.shutdown();
}

#[tokio::test]
async fn test_publish_goes_to_author_write_relays() {
    let outbox = MockRelay::start().await;
    let elsewhere = MockRelay::start().await;
    let pool = RelayPool::new(test_config(&[&elsewhere]));

    let signer = TestSigner {
        pubkey: "f6".repeat(32),
    };
    pool.relay_lists().update(writes_to(&signer.pubkey, &[&outbox]));

    let template = EventTemplate {
        created_at: 1_700_000_500,
        kind: 1,
        tags: vec![],
        content: "published".to_string(),
    };
    let (event, results) = pool.publish(&signer, template).await.unwrap();

    assert!(verify_event_id(&event));
    assert_eq!(results.len(), 1);
    assert!(results[0].ok);
    assert_eq!(outbox.received("EVENT")[0][1]["id"], event.id.as_str());
    assert!(elsewhere.received("EVENT").is_empty());
    pool.shutdown();
}

#[tokio::test]
async fn test_tracked_metadata_fills_profile_cache() {
    let relay = MockRelay::start().await;
    let pool = RelayPool::new(test_config(&[&relay]));

    let bob = "0b".repeat(32);
    relay.store(make_event(&bob, 0, 1_700_000_600, r#"{"name":"bob"}"#));
    pool.relay_lists().update(writes_to(&bob, &[&relay]));

    pool.track_metadata(&bob).unwrap();
    pool.track_metadata(&bob).unwrap();
    wait_until("profile to arrive", || pool.metadata(&bob).is_some()).await;
    assert_eq!(
        pool.metadata(&bob).unwrap().metadata.name.as_deref(),
        Some("bob")
    );
    assert_eq!(relay.received("REQ").len(), 1);

    pool.untrack_metadata(&bob).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(relay.received("CLOSE").is_empty());

    pool.untrack_metadata(&bob).unwrap();
    wait_until("CLOSE after last untrack", || relay.received("CLOSE").len() == 1).await;
    pool.shutdown();
}

#[tokio::test]
async fn test_replaceable_store_keeps_newest() {
    let old_relay = MockRelay::start().await;
    let new_relay = MockRelay::start().await;
    let pool = RelayPool::new(test_config(&[&old_relay, &new_relay]));

    let carol = "c0".repeat(32);
    let older = make_event_with_tags(&carol, 10002, 1_700_000_700, vec![], "");
    let newer = make_event_with_tags(
        &carol,
        10002,
        1_700_000_800,
        vec![vec!["r".to_string(), "wss://carol.example.com".to_string()]],
        "",
    );
    old_relay.store(older);
    new_relay.store(newer.clone());

    let handle = pool
        .query(StoreKind::Replaceable, RequestBuilder::new("lists").kinds([10002]))
        .unwrap();
    wait_until("query to finish", || !handle.store().is_loading()).await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, newer.id);
    assert_eq!(
        pool.relay_lists().peek(&carol).unwrap().write_relays(),
        vec!["wss://carol.example.com".to_string()]
    );
    pool.shutdown();
}

#[tokio::test]
async fn test_persisted_relay_list_drives_routing() {
    let author_relay = MockRelay::start().await;
    let default_relay = MockRelay::start().await;
    let alice = "a7".repeat(32);
    let note = make_event(&alice, 1, 1_700_000_900, "routed from the store");
    author_relay.store(note.clone());

    let store: Arc<MemoryStore<RelayListRecord>> = Arc::new(MemoryStore::new());
    store.put(writes_to(&alice, &[&author_relay])).await.unwrap();
    let relay_lists = Arc::new(FeedCache::<RelayListRecord>::with_store(
        "relay-lists",
        CacheConfig::default(),
        store.clone(),
    ));
    let profiles = Arc::new(FeedCache::new("profiles", CacheConfig::default()));
    let pool = RelayPool::with_caches(test_config(&[&default_relay]), profiles, relay_lists);

    let handle = pool
        .query(
            StoreKind::Flat,
            RequestBuilder::new("alice-notes")
                .filter(Filter::new().kinds([1]).authors([alice.as_str()])),
        )
        .unwrap();
    wait_until("query to finish", || !handle.store().is_loading()).await;

    assert_eq!(handle.snapshot().len(), 1);
    assert_eq!(author_relay.received("REQ").len(), 1);
    assert!(default_relay.received("REQ").is_empty());
    assert!(pool.relay_lists().peek(&alice).is_some());
    pool.shutdown();
}

#[tokio::test]
async fn test_stale_relay_list_is_fetched_again() {
    let author_relay = MockRelay::start().await;
    let pool = RelayPool::new(test_config(&[]));
    let bob = "b7".repeat(32);
    let newer = make_event_with_tags(
        &bob,
        10002,
        1_700_001_000,
        vec![vec!["r".to_string(), author_relay.url.clone()]],
        "",
    );
    author_relay.store(newer);
    pool.relay_lists().update(RelayListRecord {
        loaded: 0,
        ..writes_to(&bob, &[&author_relay])
    });

    let _notes = pool
        .query(
            StoreKind::Flat,
            RequestBuilder::new("bob-notes")
                .filter(Filter::new().kinds([1]).authors([bob.as_str()]))
                .leave_open(true),
        )
        .unwrap();

    wait_until("relay list REQ", || !author_relay.reqs_for_kind(10002).is_empty()).await;
    wait_until("newer relay list", || {
        pool.relay_lists()
            .peek(&bob)
            .is_some_and(|r| r.created == 1_700_001_000)
    })
    .await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(author_relay.reqs_for_kind(10002).len(), 1);
    pool.shutdown();
}
