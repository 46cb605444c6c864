//! Single relay connection management
//!
//! A [`RelayConnection`] owns one WebSocket to one relay. It queues outbound
//! frames while the socket is not open, re-issues its subscriptions after a
//! reconnect, and reports every inbound frame to its owner as a
//! [`RelayNotification`] on a channel injected at construction.
//!
//! Transport failures never surface as errors to callers. They show up as
//! [`ConnectionState`] changes and a reconnect with exponential backoff.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::recovery::{ExponentialBackoff, Jitter};
use futures::{SinkExt, StreamExt};
use nostr::Event;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never connected
    Idle,
    /// Currently connecting (outbound frames are queued)
    Connecting,
    /// Connected and ready
    Open,
    /// Closed on request
    Closed,
    /// Lost or failed; a reconnect is scheduled unless backoff is exhausted
    Errored,
}

/// Desired capabilities of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub read: bool,
    pub write: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

/// Confirmation result for event publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    /// Event ID that was published
    pub event_id: String,
    /// Whether the relay accepted the event
    pub accepted: bool,
    /// Message from the relay (empty if accepted, error message if rejected)
    pub message: String,
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
    /// Initial reconnection delay
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Randomize reconnect delays between half and the full delay
    pub reconnect_jitter: bool,
    /// How long a subscription may wait for EOSE before it counts as stalled
    pub eose_timeout: Duration,
    /// How long `publish` waits for the relay's OK
    pub publish_timeout: Duration,
    /// Concurrent REQs before further subscriptions wait their turn
    pub max_subscriptions: usize,
    /// REQ to EOSE latency samples kept in the stats ring buffer
    pub latency_samples: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 0, // Infinite
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            reconnect_jitter: false,
            eose_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            max_subscriptions: 25,
            latency_samples: 50,
        }
    }
}

/// Rolling counters for one connection. Survive reconnects and disconnects.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    latency: VecDeque<Duration>,
    latency_capacity: usize,
    /// Subscriptions ever opened on this connection
    pub subs_total: u64,
    /// Subscriptions that waited longer than the EOSE timeout
    pub subs_timeout: u64,
    pub events_received: u64,
    pub events_sent: u64,
    pub disconnects: u64,
}

impl ConnectionStats {
    fn new(latency_capacity: usize) -> Self {
        Self {
            latency: VecDeque::with_capacity(latency_capacity),
            latency_capacity: latency_capacity.max(1),
            ..Default::default()
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latency.len() == self.latency_capacity {
            self.latency.pop_front();
        }
        self.latency.push_back(latency);
    }

    /// Recent REQ to EOSE latencies, oldest first.
    pub fn latencies(&self) -> impl Iterator<Item = &Duration> {
        self.latency.iter()
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.latency.is_empty() {
            return None;
        }
        let total: Duration = self.latency.iter().sum();
        Some(total / self.latency.len() as u32)
    }
}

/// Something that happened on a connection, tagged with the relay it came from.
#[derive(Debug, Clone)]
pub struct RelayNotification {
    pub relay_url: String,
    pub event: ConnectionEvent,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StatusChanged(ConnectionState),
    Event {
        subscription_id: String,
        event: Event,
    },
    Eose {
        subscription_id: String,
    },
    /// No EOSE within the timeout; the subscription stays open.
    EoseTimeout {
        subscription_id: String,
    },
    /// The relay closed the subscription with a CLOSED frame.
    Closed {
        subscription_id: String,
        message: String,
    },
    /// The subscription was dropped by `close()` and will never finish.
    SubscriptionCancelled {
        subscription_id: String,
    },
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },
    Notice {
        message: String,
    },
}

type StatusCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct PendingSub {
    seq: u64,
    filters: Vec<Filter>,
    /// When the REQ went out on the current socket; `None` means still queued.
    sent_at: Option<Instant>,
    eose: bool,
    timed_out: bool,
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

struct ConnectionInner {
    url: String,
    config: RelayConfig,
    settings: Mutex<RelaySettings>,
    state: Mutex<ConnectionState>,
    subs: Mutex<HashMap<String, PendingSub>>,
    /// EVENT and CLOSE frames waiting for the socket
    outbox: Mutex<VecDeque<ClientMessage>>,
    confirmations: Mutex<HashMap<String, Vec<oneshot::Sender<PublishConfirmation>>>>,
    stats: Mutex<ConnectionStats>,
    listeners: Mutex<Vec<(u64, StatusCallback)>>,
    next_id: AtomicU64,
    max_subscriptions: AtomicUsize,
    last_activity: Mutex<Instant>,
    /// Set by `close`; a closed connection accepts no more work
    closed: AtomicBool,
    /// Bumped to stop the current run loop
    generation: watch::Sender<u64>,
    task: Mutex<Option<(u64, JoinHandle<()>)>>,
    wake: tokio::sync::Notify,
    events_tx: mpsc::UnboundedSender<RelayNotification>,
}

/// Relay connection handle. Cheap to clone; clones share one socket.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

/// Validate a relay URL and bring it to the form used as a pool key.
///
/// Scheme and host are lowercased by the parser; a bare trailing slash is
/// dropped so `wss://relay.com/` and `wss://relay.com` are the same relay.
pub fn normalize_relay_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url.trim())?;

    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(ClientError::InvalidUrl(format!("missing host: {}", url)));
    }

    let mut normalized = parsed.to_string();
    if parsed.query().is_none() && parsed.fragment().is_none() {
        while normalized.ends_with('/') {
            normalized.pop();
        }
    }
    Ok(normalized)
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(
        url: &str,
        config: RelayConfig,
        events_tx: mpsc::UnboundedSender<RelayNotification>,
    ) -> Result<Self> {
        let url = normalize_relay_url(url)?;
        let (generation, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                url,
                max_subscriptions: AtomicUsize::new(config.max_subscriptions.max(1)),
                stats: Mutex::new(ConnectionStats::new(config.latency_samples)),
                config,
                settings: Mutex::new(RelaySettings::default()),
                state: Mutex::new(ConnectionState::Idle),
                subs: Mutex::new(HashMap::new()),
                outbox: Mutex::new(VecDeque::new()),
                confirmations: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                last_activity: Mutex::new(Instant::now()),
                closed: AtomicBool::new(false),
                generation,
                task: Mutex::new(None),
                wake: tokio::sync::Notify::new(),
                events_tx,
            }),
        })
    }

    /// Normalized relay URL
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn settings(&self) -> RelaySettings {
        *self.inner.settings.lock()
    }

    pub fn set_settings(&self, settings: RelaySettings) {
        *self.inner.settings.lock() = settings;
    }

    /// Snapshot of the connection's counters.
    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.lock().clone()
    }

    /// Lower the concurrent REQ limit, usually from the relay's NIP-11 document.
    pub fn set_max_subscriptions(&self, max: usize) {
        self.inner.max_subscriptions.store(max.max(1), Ordering::Relaxed);
        self.inner.wake.notify_one();
    }

    pub fn max_subscriptions(&self) -> usize {
        self.inner.max_subscriptions.load(Ordering::Relaxed)
    }

    /// Ids of subscriptions this connection is responsible for.
    pub fn subscription_ids(&self) -> Vec<String> {
        self.inner.subs.lock().keys().cloned().collect()
    }

    /// Subscriptions whose REQ is on the wire right now.
    pub fn active_subscriptions(&self) -> usize {
        self.inner
            .subs
            .lock()
            .values()
            .filter(|s| s.sent_at.is_some())
            .count()
    }

    pub fn has_subscription(&self, subscription_id: &str) -> bool {
        self.inner.subs.lock().contains_key(subscription_id)
    }

    /// Time of the last frame sent or received.
    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock()
    }

    /// Nothing pending and quiet for at least `grace`.
    pub fn is_idle(&self, grace: Duration) -> bool {
        self.inner.subs.lock().is_empty()
            && self.inner.outbox.lock().is_empty()
            && self.inner.confirmations.lock().is_empty()
            && self.last_activity().elapsed() >= grace
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed(self.inner.url.clone()));
        }
        Ok(())
    }

    /// Start the connection loop if it is not already running.
    ///
    /// Returns immediately; progress is reported through status changes.
    /// Fails once the connection was closed.
    pub fn connect(&self) -> Result<()> {
        self.ensure_not_closed()?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::Internal(format!("no tokio runtime: {}", e)))?;

        let mut task = self.inner.task.lock();
        let generation = *self.inner.generation.borrow();
        if let Some((running, handle)) = task.as_ref()
            && *running == generation
            && !handle.is_finished()
        {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let join = handle.spawn(async move { inner.run(generation).await });
        *task = Some((generation, join));
        Ok(())
    }

    /// Queue a REQ. Fire and forget; the frame goes out once the socket is open
    /// and a subscription slot is free.
    pub fn send(&self, subscription_id: &str, filters: Vec<Filter>) -> Result<()> {
        self.ensure_not_closed()?;
        {
            let mut subs = self.inner.subs.lock();
            let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            subs.insert(
                subscription_id.to_string(),
                PendingSub {
                    seq,
                    filters,
                    sent_at: None,
                    eose: false,
                    timed_out: false,
                },
            );
        }
        self.inner.stats.lock().subs_total += 1;
        self.inner.touch();
        self.connect()?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Stop a subscription. A CLOSE is sent only if the REQ reached the relay.
    pub fn close_subscription(&self, subscription_id: &str) {
        let removed = self.inner.subs.lock().remove(subscription_id);
        if let Some(sub) = removed
            && sub.sent_at.is_some()
        {
            self.inner.outbox.lock().push_back(ClientMessage::Close {
                subscription_id: subscription_id.to_string(),
            });
            self.inner.wake.notify_one();
        }
        self.inner.touch();
    }

    /// Queue an EVENT without waiting for the relay's answer.
    pub fn send_event(&self, event: &Event) -> Result<()> {
        self.ensure_not_closed()?;
        self.inner
            .outbox
            .lock()
            .push_back(ClientMessage::Event(event.clone()));
        self.inner.touch();
        self.connect()?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Publish an event and wait for confirmation from the relay.
    ///
    /// A rejection is an `Ok(PublishConfirmation { accepted: false, .. })`.
    pub async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        self.ensure_not_closed()?;
        if !self.settings().write {
            return Err(ClientError::NotWritable(self.inner.url.clone()));
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .confirmations
            .lock()
            .entry(event.id.clone())
            .or_default()
            .push(tx);

        self.send_event(event)?;

        match timeout(self.inner.config.publish_timeout, rx).await {
            Ok(Ok(confirmation)) => Ok(confirmation),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed(self.inner.url.clone())),
            Err(_) => {
                let mut confirmations = self.inner.confirmations.lock();
                if let Some(waiting) = confirmations.get_mut(&event.id) {
                    waiting.retain(|tx| !tx.is_closed());
                    if waiting.is_empty() {
                        confirmations.remove(&event.id);
                    }
                }
                Err(ClientError::Timeout(format!(
                    "no OK from {} after {:?}",
                    self.inner.url, self.inner.config.publish_timeout
                )))
            }
        }
    }

    /// Register a status callback. Call the returned function to unregister.
    pub fn subscribe_status<F>(&self, callback: F) -> impl FnOnce() + Send + 'static
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .push((id, Arc::new(callback) as StatusCallback));

        let weak: Weak<ConnectionInner> = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        }
    }

    /// Tear down the socket. Subscriptions and stats are kept, so a later
    /// `connect` resumes where this left off.
    pub fn disconnect(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
        self.inner.reset_session();
        let state = self.state();
        if state != ConnectionState::Idle && state != ConnectionState::Closed {
            info!("Disconnecting from relay: {}", self.inner.url);
            self.inner.set_state(ConnectionState::Closed);
        }
    }

    /// Disconnect for good and cancel everything pending. Safe to call
    /// repeatedly.
    ///
    /// Every pending subscription is reported as
    /// [`ConnectionEvent::SubscriptionCancelled`]; publish waiters get
    /// [`ClientError::ConnectionClosed`], as does any later `connect`,
    /// `send`, `send_event` or `publish`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.disconnect();

        let cancelled: Vec<String> = {
            let mut subs = self.inner.subs.lock();
            let mut pending: Vec<(u64, String)> =
                subs.drain().map(|(id, sub)| (sub.seq, id)).collect();
            pending.sort();
            pending.into_iter().map(|(_, id)| id).collect()
        };
        for subscription_id in cancelled {
            self.inner
                .emit(ConnectionEvent::SubscriptionCancelled { subscription_id });
        }

        self.inner.confirmations.lock().clear();
        self.inner.outbox.lock().clear();
    }
}

impl ConnectionInner {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn emit(&self, event: ConnectionEvent) {
        // The owner going away is not an error for the connection.
        let _ = self.events_tx.send(RelayNotification {
            relay_url: self.url.clone(),
            event,
        });
    }

    fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.lock();
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        debug!("Relay {} is now {:?}", self.url, new_state);

        let listeners: Vec<StatusCallback> =
            self.listeners.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for listener in listeners {
            listener(new_state);
        }
        self.emit(ConnectionEvent::StatusChanged(new_state));
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.borrow() == generation
    }

    /// The relay forgets subscriptions with the socket: requeue every REQ and
    /// drop CLOSE frames meant for the old socket.
    fn reset_session(&self) {
        for sub in self.subs.lock().values_mut() {
            sub.sent_at = None;
            sub.eose = false;
            sub.timed_out = false;
        }
        self.outbox
            .lock()
            .retain(|msg| !matches!(msg, ClientMessage::Close { .. }));
    }

    async fn stopped(rx: &mut watch::Receiver<u64>, generation: u64) {
        loop {
            if *rx.borrow_and_update() != generation {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let mut stop_rx = self.generation.subscribe();
        let mut backoff = ExponentialBackoff::new(
            self.config.reconnect_delay,
            self.config.max_reconnect_delay,
            self.config.max_reconnect_attempts,
        );
        if self.config.reconnect_jitter {
            backoff = backoff.with_jitter(Jitter::Equal);
        }

        loop {
            if !self.is_current(generation) {
                return;
            }
            self.set_state(ConnectionState::Connecting);
            info!("Connecting to relay: {}", self.url);

            let connect_start = Instant::now();
            let attempt = tokio::select! {
                result = timeout(self.config.connect_timeout, connect_async(self.url.as_str())) => result,
                _ = Self::stopped(&mut stop_rx, generation) => return,
            };

            match attempt {
                Ok(Ok((ws, _))) => {
                    if !self.is_current(generation) {
                        return;
                    }
                    backoff.reset();
                    self.touch();
                    self.set_state(ConnectionState::Open);
                    info!(
                        "Connected to relay: {} (took {:?})",
                        self.url,
                        connect_start.elapsed()
                    );

                    let end = self.session(ws, &mut stop_rx, generation).await;
                    self.reset_session();
                    match end {
                        SessionEnd::Stopped => return,
                        SessionEnd::Lost(reason) => {
                            warn!("Lost connection to relay {}: {}", self.url, reason);
                        }
                    }
                }
                Ok(Err(e)) => warn!("Failed to connect to relay {}: {}", self.url, e),
                Err(_) => warn!(
                    "Connection timeout after {:?} for relay {}",
                    self.config.connect_timeout, self.url
                ),
            }

            if !self.is_current(generation) {
                return;
            }
            self.stats.lock().disconnects += 1;
            self.set_state(ConnectionState::Errored);

            let Some(delay) = backoff.next_delay() else {
                warn!("Max reconnection attempts exhausted for {}", self.url);
                return;
            };
            info!("Waiting {:?} before reconnecting to {}", delay, self.url);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = Self::stopped(&mut stop_rx, generation) => return,
            }
        }
    }

    async fn session(
        &self,
        ws: WsStream,
        stop_rx: &mut watch::Receiver<u64>,
        generation: u64,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let tick_every = (self.config.eose_timeout / 4).max(Duration::from_millis(50));
        let mut eose_tick = tokio::time::interval(tick_every);
        eose_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            for frame in self.drain_outbound() {
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping unencodable frame for {}: {}", self.url, e);
                        continue;
                    }
                };
                debug!("Sending to {}: {}", self.url, text);
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    return SessionEnd::Lost(e.to_string());
                }
                if matches!(frame, ClientMessage::Event(_)) {
                    self.stats.lock().events_sent += 1;
                }
                self.touch();
            }

            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost("closed by relay".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                },
                _ = self.wake.notified() => {}
                _ = eose_tick.tick() => self.check_eose_timeouts(),
                _ = Self::stopped(stop_rx, generation) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Stopped;
                }
            }
        }
    }

    /// Frames to write now: queued EVENT/CLOSE frames, then as many waiting
    /// REQs as free subscription slots allow, oldest first.
    fn drain_outbound(&self) -> Vec<ClientMessage> {
        let mut frames: Vec<ClientMessage> = self.outbox.lock().drain(..).collect();

        let mut subs = self.subs.lock();
        let active = subs.values().filter(|s| s.sent_at.is_some()).count();
        let free = self
            .max_subscriptions
            .load(Ordering::Relaxed)
            .saturating_sub(active);
        if free == 0 {
            return frames;
        }

        let mut waiting: Vec<(u64, &String)> = subs
            .iter()
            .filter(|(_, s)| s.sent_at.is_none())
            .map(|(id, s)| (s.seq, id))
            .collect();
        waiting.sort();
        let ready: Vec<String> = waiting
            .into_iter()
            .take(free)
            .map(|(_, id)| id.clone())
            .collect();

        let now = Instant::now();
        for id in ready {
            if let Some(sub) = subs.get_mut(&id) {
                sub.sent_at = Some(now);
                frames.push(ClientMessage::Req {
                    subscription_id: id,
                    filters: sub.filters.clone(),
                });
            }
        }
        frames
    }

    fn check_eose_timeouts(&self) {
        let mut stalled = Vec::new();
        {
            let mut subs = self.subs.lock();
            for (id, sub) in subs.iter_mut() {
                if let Some(sent_at) = sub.sent_at
                    && !sub.eose
                    && !sub.timed_out
                    && sent_at.elapsed() >= self.config.eose_timeout
                {
                    sub.timed_out = true;
                    stalled.push(id.clone());
                }
            }
        }
        if stalled.is_empty() {
            return;
        }

        self.stats.lock().subs_timeout += stalled.len() as u64;
        for subscription_id in stalled {
            debug!("No EOSE from {} for {}", self.url, subscription_id);
            self.emit(ConnectionEvent::EoseTimeout { subscription_id });
        }
    }

    fn handle_text(&self, text: &str) {
        self.touch();
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", self.url, e);
                return;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if !self.subs.lock().contains_key(&subscription_id) {
                    debug!(
                        "Ignoring event for closed subscription {} from {}",
                        subscription_id, self.url
                    );
                    return;
                }
                self.stats.lock().events_received += 1;
                self.emit(ConnectionEvent::Event {
                    subscription_id,
                    event,
                });
            }
            RelayMessage::Eose { subscription_id } => {
                let latency = {
                    let mut subs = self.subs.lock();
                    match subs.get_mut(&subscription_id) {
                        Some(sub) if !sub.eose => {
                            sub.eose = true;
                            Some(sub.sent_at.map(|t| t.elapsed()))
                        }
                        _ => None,
                    }
                };
                if let Some(latency) = latency {
                    if let Some(latency) = latency {
                        self.stats.lock().record_latency(latency);
                    }
                    self.emit(ConnectionEvent::Eose { subscription_id });
                }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                let waiting = self.confirmations.lock().remove(&event_id);
                for tx in waiting.into_iter().flatten() {
                    let _ = tx.send(PublishConfirmation {
                        event_id: event_id.clone(),
                        accepted: success,
                        message: message.clone(),
                    });
                }
                self.emit(ConnectionEvent::Ok {
                    event_id,
                    success,
                    message,
                });
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                if self.subs.lock().remove(&subscription_id).is_some() {
                    warn!(
                        "Relay {} closed subscription {}: {}",
                        self.url, subscription_id, message
                    );
                    self.wake.notify_one();
                    self.emit(ConnectionEvent::Closed {
                        subscription_id,
                        message,
                    });
                }
            }
            RelayMessage::Notice { message } => {
                warn!("Notice from {}: {}", self.url, message);
                self.emit(ConnectionEvent::Notice { message });
            }
            RelayMessage::Auth { .. } => {
                debug!("Ignoring AUTH challenge from {}", self.url);
            }
            RelayMessage::Count {
                subscription_id,
                count,
            } => {
                debug!(
                    "COUNT {} for {} from {} (unused)",
                    count, subscription_id, self.url
                );
            }
        }
    }
}
