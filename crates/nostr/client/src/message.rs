//! Nostr relay message types.
//!
//! This module implements the relay protocol messages as specified in NIP-01:
//! - Client to Relay: EVENT, REQ, CLOSE
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(Event),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },
}

impl ClientMessage {
    /// Serialize to JSON array for sending to relay.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr: Vec<Value> = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Event matching a subscription: ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Command result: ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// End of stored events: ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// Subscription closed by relay: ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: ["NOTICE", <message>]
    Notice { message: String },

    /// Authentication challenge (NIP-42): ["AUTH", <challenge>]
    Auth { challenge: String },

    /// Count result (NIP-45): ["COUNT", <subscription_id>, {"count": <n>}]
    Count { subscription_id: String, count: u64 },
}

fn string_at(arr: &[Value], index: usize, name: &str) -> Result<String, MessageError> {
    arr.get(index)
        .ok_or_else(|| MessageError::MissingField(name.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", name)))
}

impl RelayMessage {
    /// Parse a JSON message from the relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        let msg_type = arr
            .first()
            .ok_or_else(|| MessageError::InvalidFormat("empty array".to_string()))?
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let raw = arr
                    .get(2)
                    .ok_or_else(|| MessageError::MissingField("event".to_string()))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                let event_id = string_at(&arr, 1, "event_id")?;
                let success = arr
                    .get(2)
                    .ok_or_else(|| MessageError::MissingField("success".to_string()))?
                    .as_bool()
                    .ok_or_else(|| {
                        MessageError::InvalidFormat("success not a boolean".to_string())
                    })?;
                let message = arr.get(3).and_then(|v| v.as_str()).unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            "CLOSED" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let message = arr.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string();
                Ok(RelayMessage::Closed {
                    subscription_id,
                    message,
                })
            }
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&arr, 1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: string_at(&arr, 1, "challenge")?,
            }),
            "COUNT" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let count = arr
                    .get(2)
                    .and_then(|v| v.get("count"))
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| MessageError::MissingField("count".to_string()))?;
                Ok(RelayMessage::Count {
                    subscription_id,
                    count,
                })
            }
            _ => Err(MessageError::UnknownType(msg_type.to_string())),
        }
    }

    /// Subscription this message belongs to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            }
            | RelayMessage::Count {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

/// Filter for subscription requests.
///
/// Fields within one filter are AND'd; filters in one request are OR'd.
/// Tag constraints are keyed with the `#` prefix (`"#e"`, `"#p"`) exactly
/// as they appear on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// NIP-50 search string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Generic tag queries (e.g., #e, #p)
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

fn merge_values<T: Ord + Clone>(slot: &mut Option<Vec<T>>, values: impl IntoIterator<Item = T>) {
    let list = slot.get_or_insert_with(Vec::new);
    for value in values {
        if !list.contains(&value) {
            list.push(value);
        }
    }
}

fn sort_dedup<T: Ord>(list: &mut Vec<T>) {
    list.sort();
    list.dedup();
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs. Repeated calls append without duplicates.
    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        merge_values(&mut self.ids, ids.into_iter().map(Into::into));
        self
    }

    /// Filter by authors. Repeated calls append without duplicates.
    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        merge_values(&mut self.authors, authors.into_iter().map(Into::into));
        self
    }

    /// Filter by kinds. Repeated calls append without duplicates.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        merge_values(&mut self.kinds, kinds);
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Full-text search (relays without NIP-50 ignore or reject it).
    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Add a tag filter. The key is the tag letter, with or without `#`.
    pub fn tag(
        mut self,
        key: impl AsRef<str>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let key = key.as_ref();
        let key = if key.starts_with('#') {
            key.to_string()
        } else {
            format!("#{}", key)
        };
        let mut slot = self.tags.remove(&key);
        merge_values(&mut slot, values.into_iter().map(Into::into));
        if let Some(list) = slot {
            self.tags.insert(key, list);
        }
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Whether this filter constrains authors.
    pub fn has_authors(&self) -> bool {
        self.authors.as_ref().is_some_and(|a| !a.is_empty())
    }

    /// Canonical form: every list sorted and deduplicated.
    ///
    /// Two filters are the same query exactly when their normalized forms are
    /// equal. Values are compared as-is; tag values are case sensitive.
    pub fn normalized(&self) -> Self {
        let mut filter = self.clone();
        if let Some(ids) = filter.ids.as_mut() {
            sort_dedup(ids);
        }
        if let Some(authors) = filter.authors.as_mut() {
            sort_dedup(authors);
        }
        if let Some(kinds) = filter.kinds.as_mut() {
            sort_dedup(kinds);
        }
        for values in filter.tags.values_mut() {
            sort_dedup(values);
        }
        filter
    }

    /// Check if an event matches this filter.
    ///
    /// `limit` and `search` are relay-side concerns and are not checked.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids
            && !ids.iter().any(|id| event.id.starts_with(id.as_str()))
        {
            return false;
        }

        if let Some(ref authors) = self.authors
            && !authors.iter().any(|a| event.pubkey.starts_with(a.as_str()))
        {
            return false;
        }

        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        for (key, values) in &self.tags {
            let name = key.trim_start_matches('#');
            if !event.tag_values(name).any(|v| values.iter().any(|want| want == v)) {
                return false;
            }
        }

        true
    }
}
