//! NIP-11: Relay Information Document
//!
//! Relays publish their metadata over HTTP when asked with
//! `Accept: application/nostr+json`. Many relays fill unused fields with
//! placeholder strings; [`RelayInformation::from_json`] treats those as absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Placeholder strings relays use for "not set".
pub const SENTINEL_VALUES: [&str; 3] = ["unset", "", "~"];

#[derive(Debug, Error)]
pub enum Nip11Error {
    #[error("relay information is not a JSON object")]
    NotAnObject,

    #[error("invalid relay information: {0}")]
    Json(#[from] serde_json::Error),
}

/// NIP-11 Relay Information Document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInformation {
    /// Relay name (should be <30 chars)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Detailed description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Icon image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Administrative contact pubkey (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,

    /// Administrative contact (URI: mailto:, https:, etc.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,

    /// List of supported NIP numbers
    #[serde(default)]
    pub supported_nips: Vec<u16>,

    /// Relay software URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,

    /// Software version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Server limitations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limitation: Option<Limitation>,

    /// Relay country codes (ISO 3166-1 alpha-2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_countries: Option<Vec<String>>,

    /// Language tags (IETF)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_tags: Option<Vec<String>>,

    /// Posting policy URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posting_policy: Option<String>,

    /// Payments URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payments_url: Option<String>,
}

/// Server limitations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limitation {
    /// Maximum message length in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<usize>,

    /// Maximum active subscriptions per connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<usize>,

    /// Maximum filters per REQ
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_filters: Option<usize>,

    /// Maximum subscription ID length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<usize>,

    /// Maximum limit value in filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<usize>,

    /// Maximum event tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_event_tags: Option<usize>,

    /// Maximum content length (unicode characters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_content_length: Option<usize>,

    /// Minimum PoW difficulty (NIP-13)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pow_difficulty: Option<u32>,

    /// Authentication required (NIP-42)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,

    /// Payment required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<bool>,

    /// Restricted writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted_writes: Option<bool>,
}

impl RelayInformation {
    /// Parse a relay information document, dropping sentinel values.
    ///
    /// Sentinels are removed at every object level before typed
    /// deserialization, so `"max_subscriptions": "unset"` does not fail the
    /// whole document. Non-numeric entries in `supported_nips` are skipped.
    pub fn from_json(json: &str) -> Result<Self, Nip11Error> {
        let mut value: Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(Nip11Error::NotAnObject);
        }
        strip_sentinels(&mut value);

        if let Some(nips) = value.get_mut("supported_nips") {
            match nips {
                Value::Array(items) => items.retain(|v| {
                    v.as_u64().is_some_and(|n| n <= u16::MAX as u64)
                }),
                _ => *nips = Value::Array(Vec::new()),
            }
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Whether the relay advertises support for `nip`.
    pub fn supports_nip(&self, nip: u16) -> bool {
        self.supported_nips.contains(&nip)
    }

    /// `limitation.max_subscriptions`, if advertised.
    pub fn max_subscriptions(&self) -> Option<usize> {
        self.limitation.as_ref().and_then(|l| l.max_subscriptions)
    }
}

fn is_sentinel(value: &Value) -> bool {
    matches!(value, Value::String(s) if SENTINEL_VALUES.contains(&s.trim()))
}

fn strip_sentinels(value: &mut Value) {
    if let Value::Object(map) = value {
        map.retain(|_, v| !is_sentinel(v) && !v.is_null());
        for v in map.values_mut() {
            strip_sentinels(v);
        }
    }
}
