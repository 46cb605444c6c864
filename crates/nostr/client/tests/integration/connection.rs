//! Single relay connection tests

use super::*;
use nostr_client::{ConnectionEvent, ConnectionState, RelayConfig, RelayConnection, RelayNotification};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn fast_config() -> RelayConfig {
    RelayConfig {
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_delay: Duration::from_millis(200),
        ..Default::default()
    }
}

async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<RelayNotification>,
    mut pick: impl FnMut(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let notification = rx.recv().await.expect("connection dropped its sender");
            if pick(&notification.event) {
                return notification.event;
            }
        }
    })
    .await
    .expect("no matching notification")
}

#[tokio::test]
async fn test_subscription_receives_events_then_eose() {
    let relay = MockRelay::start().await;
    let pubkey = "a1".repeat(32);
    let note = make_event(&pubkey, 1, 1_700_000_000, "stored note");
    relay.store(note.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = RelayConnection::new(&relay.url, fast_config(), tx).unwrap();
    conn.send("feed", vec![Filter::new().kinds([1])]).unwrap();

    let received = next_matching(&mut rx, |e| matches!(e, ConnectionEvent::Event { .. })).await;
    match received {
        ConnectionEvent::Event {
            subscription_id,
            event,
        } => {
            assert_eq!(subscription_id, "feed");
            assert_eq!(event, note);
        }
        other => panic!("unexpected {:?}", other),
    }
    next_matching(&mut rx, |e| matches!(e, ConnectionEvent::Eose { .. })).await;

    assert!(conn.is_open());
    assert_eq!(conn.stats().events_received, 1);
    assert_eq!(conn.stats().latencies().count(), 1);
    conn.close();
}

#[tokio::test]
async fn test_publish_waits_for_ok() {
    let relay = MockRelay::start().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let conn = RelayConnection::new(&relay.url, fast_config(), tx).unwrap();
    conn.connect().unwrap();

    let event = make_event(&"b2".repeat(32), 1, 1_700_000_001, "hello relay");
    let confirmation = conn.publish(&event).await.unwrap();
    assert!(confirmation.accepted);
    assert_eq!(confirmation.event_id, event.id);

    relay.reject_writes();
    let second = make_event(&"b2".repeat(32), 1, 1_700_000_002, "rejected");
    let confirmation = conn.publish(&second).await.unwrap();
    assert!(!confirmation.accepted);
    assert!(confirmation.message.starts_with("blocked"));
    conn.close();
}

#[tokio::test]
async fn test_reconnect_resends_open_subscriptions() {
    let relay = MockRelay::start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = RelayConnection::new(&relay.url, fast_config(), tx).unwrap();

    conn.send("live", vec![Filter::new().kinds([1])]).unwrap();
    next_matching(&mut rx, |e| matches!(e, ConnectionEvent::Eose { .. })).await;

    relay.kick();
    next_matching(&mut rx, |e| {
        matches!(e, ConnectionEvent::StatusChanged(ConnectionState::Errored))
    })
    .await;

    wait_until("REQ to be sent again", || relay.received("REQ").len() == 2).await;
    assert!(conn.has_subscription("live"));
    assert!(conn.stats().disconnects >= 1);

    conn.close_subscription("live");
    wait_until("CLOSE", || relay.received("CLOSE").len() == 1).await;
    conn.close();
}
