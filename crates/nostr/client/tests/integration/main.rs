//! Integration tests for the relay runtime against an in-process mock relay.

mod connection;
mod pool;

use futures::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate};
use nostr_client::Filter;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
struct MockState {
    stored: Mutex<Vec<Event>>,
    received: Mutex<Vec<Value>>,
    reject_writes: AtomicBool,
}

impl MockState {
    fn respond(&self, frame: &Value) -> Vec<Value> {
        match frame.get(0).and_then(Value::as_str) {
            Some("REQ") => {
                let sub_id = frame[1].clone();
                let filters: Vec<Filter> = frame
                    .as_array()
                    .map(|parts| parts[2..].to_vec())
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|f| serde_json::from_value(f).ok())
                    .collect();
                let mut replies: Vec<Value> = self
                    .stored
                    .lock()
                    .iter()
                    .filter(|event| filters.iter().any(|f| f.matches(event)))
                    .map(|event| json!(["EVENT", sub_id, event]))
                    .collect();
                replies.push(json!(["EOSE", sub_id]));
                replies
            }
            Some("EVENT") => {
                let Ok(event) = serde_json::from_value::<Event>(frame[1].clone()) else {
                    return vec![json!(["NOTICE", "invalid: bad event"])];
                };
                if self.reject_writes.load(Ordering::SeqCst) {
                    return vec![json!(["OK", event.id, false, "blocked: test relay"])];
                }
                let id = event.id.clone();
                self.stored.lock().push(event);
                vec![json!(["OK", id, true, ""])]
            }
            _ => Vec::new(),
        }
    }
}

/// Minimal NIP-01 relay: answers REQ from its stored events followed by
/// EOSE, stores EVENTs and confirms them with OK, and records every frame.
pub struct MockRelay {
    pub url: String,
    state: Arc<MockState>,
    kick: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        let (kick, _) = broadcast::channel(4);

        let task = {
            let state = state.clone();
            let kick = kick.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, state.clone(), kick.subscribe()));
                }
            })
        };

        Self {
            url: format!("ws://127.0.0.1:{}", addr.port()),
            state,
            kick,
            task,
        }
    }

    pub fn store(&self, event: Event) {
        self.state.stored.lock().push(event);
    }

    pub fn reject_writes(&self) {
        self.state.reject_writes.store(true, Ordering::SeqCst);
    }

    /// Frames received with the given verb, in arrival order.
    pub fn received(&self, verb: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|frame| frame[0] == verb)
            .cloned()
            .collect()
    }

    /// REQ frames with a filter asking for `kind`.
    pub fn reqs_for_kind(&self, kind: u16) -> Vec<Value> {
        self.received("REQ")
            .into_iter()
            .filter(|frame| {
                frame.as_array().is_some_and(|parts| {
                    parts.iter().skip(2).any(|filter| {
                        filter["kinds"]
                            .as_array()
                            .is_some_and(|kinds| kinds.iter().any(|k| *k == kind))
                    })
                })
            })
            .collect()
    }

    /// Drop every open socket.
    pub fn kick(&self) {
        let _ = self.kick.send(());
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
        self.kick();
    }
}

async fn serve(stream: TcpStream, state: Arc<MockState>, mut kick: broadcast::Receiver<()>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    loop {
        let text = tokio::select! {
            _ = kick.recv() => {
                let _ = sink.close().await;
                return;
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            },
        };

        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        let replies = state.respond(&frame);
        state.received.lock().push(frame);
        for reply in replies {
            if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                return;
            }
        }
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Build an event with a valid id. Signatures are not checked by the runtime.
pub fn make_event(pubkey: &str, kind: u16, created_at: u64, content: &str) -> Event {
    make_event_with_tags(pubkey, kind, created_at, vec![], content)
}

pub fn make_event_with_tags(
    pubkey: &str,
    kind: u16,
    created_at: u64,
    tags: Vec<Vec<String>>,
    content: &str,
) -> Event {
    EventTemplate {
        created_at,
        kind,
        tags,
        content: content.to_string(),
    }
    .into_unsigned(pubkey)
    .into_event("00".repeat(64))
    .unwrap()
}
