//! NIP-11 relay information cache
//!
//! Relay capability documents are fetched over plain HTTP(S), independent of
//! the WebSocket, and memoized per relay URL with least-recently-used eviction.

use crate::error::{ClientError, Result};
use crate::relay::normalize_relay_url;
use nostr::RelayInformation;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Accept header value for relay information requests.
pub const NOSTR_JSON: &str = "application/nostr+json";

#[derive(Debug, Clone)]
pub struct RelayInfoConfig {
    /// Documents kept before the least recently used one is evicted
    pub capacity: usize,
    /// HTTP request timeout
    pub timeout: Duration,
}

impl Default for RelayInfoConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct LruState {
    entries: HashMap<String, Arc<RelayInformation>>,
    /// Keys in access order, oldest first
    order: VecDeque<String>,
}

impl LruState {
    /// O(n) scan; `capacity` keeps n small.
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

/// Memoizing fetcher for relay information documents.
pub struct RelayInfoCache {
    config: RelayInfoConfig,
    client: reqwest::Client,
    state: Mutex<LruState>,
}

/// Map a relay's WebSocket URL to the HTTP URL serving its NIP-11 document.
pub fn http_url_for(ws_url: &str) -> Result<String> {
    let mut url = Url::parse(ws_url)?;
    let scheme = match url.scheme() {
        "wss" => "https",
        "ws" => "http",
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                other
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidUrl(ws_url.to_string()))?;
    Ok(url.to_string())
}

impl RelayInfoCache {
    pub fn new(config: RelayInfoConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            config,
            client,
            state: Mutex::new(LruState::default()),
        }
    }

    /// Cached document for `url`, without fetching.
    pub fn cached(&self, url: &str) -> Option<Arc<RelayInformation>> {
        let key = normalize_relay_url(url).ok()?;
        let mut state = self.state.lock();
        let info = state.entries.get(&key).cloned()?;
        state.touch(&key);
        Some(info)
    }

    /// Store a document, evicting the least recently used entry when full.
    pub fn insert(&self, url: &str, info: RelayInformation) -> Result<Arc<RelayInformation>> {
        let key = normalize_relay_url(url)?;
        let info = Arc::new(info);
        let mut state = self.state.lock();

        state.entries.insert(key.clone(), info.clone());
        state.touch(&key);
        while state.entries.len() > self.config.capacity.max(1) {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            debug!("Evicted relay info for {}", oldest);
        }
        Ok(info)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached document, or fetch it. Failures are logged and not cached, so a
    /// later call tries again.
    pub async fn get(&self, url: &str) -> Option<Arc<RelayInformation>> {
        if let Some(info) = self.cached(url) {
            return Some(info);
        }

        match self.fetch(url).await {
            Ok(info) => self.insert(url, info).ok(),
            Err(e) => {
                warn!("Failed to fetch relay info for {}: {}", url, e);
                None
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<RelayInformation> {
        let http_url = http_url_for(url)?;
        debug!("Fetching relay info from {}", http_url);

        let body = self
            .client
            .get(&http_url)
            .header(reqwest::header::ACCEPT, NOSTR_JSON)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(RelayInformation::from_json(&body)?)
    }
}

impl Default for RelayInfoCache {
    fn default() -> Self {
        Self::new(RelayInfoConfig::default())
    }
}
