//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Event serialization for hashing
//! - Id verification on ingestion
//! - Kind classification (regular, replaceable, ephemeral, addressable)
//! - Kind 0 profile metadata content

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
}

/// A signed Nostr event.
///
/// Events are content addressed: `id` is the sha256 of the canonical
/// serialization of every other field except `sig`. Use [`verify_event_id`]
/// before trusting an event received from a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// Every value (second element) of tags named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// The `d` tag of an addressable event. Missing `d` means the empty identifier.
    pub fn d_tag(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }

    /// Logical identity used when only the newest version matters.
    ///
    /// - replaceable kinds: `kind:pubkey`
    /// - addressable kinds: `kind:pubkey:d`
    /// - everything else: the event id
    pub fn replaceable_key(&self) -> String {
        match classify_kind(self.kind) {
            KindClassification::Replaceable => format!("{}:{}", self.kind, self.pubkey),
            KindClassification::Addressable => {
                format!("{}:{}:{}", self.kind, self.pubkey, self.d_tag())
            }
            _ => self.id.clone(),
        }
    }

    /// The unsigned part of the event, as it was hashed.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}

impl AsRef<Event> for Event {
    fn as_ref(&self) -> &Event {
        self
    }
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl UnsignedEvent {
    /// Compute the id and attach a signature produced elsewhere.
    pub fn into_event(self, sig: impl Into<String>) -> Result<Event, Nip01Error> {
        let id = get_event_hash(&self)?;
        Ok(Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.into(),
        })
    }
}

/// A template for creating events (without pubkey, which comes from the signer).
///
/// # Examples
///
/// ```
/// use nostr::EventTemplate;
///
/// let template = EventTemplate {
///     created_at: 1_700_000_000,
///     kind: 1,
///     tags: vec![vec!["p".to_string(), "pubkey_to_mention".to_string()]],
///     content: "Hello Nostr!".to_string(),
/// };
/// assert_eq!(template.kind, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl EventTemplate {
    /// Attach the signer's pubkey.
    pub fn into_unsigned(self, pubkey: impl Into<String>) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: pubkey.into(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

/// Event kind classification according to NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Events expected to be stored by relays
    Regular,
    /// Only latest event per pubkey+kind is stored
    Replaceable,
    /// Not expected to be stored by relays
    Ephemeral,
    /// Only latest event per pubkey+kind+d-tag is stored
    Addressable,
    /// Unknown classification
    Unknown,
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !validate_unsigned_event(event) {
        return Err(Nip01Error::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Get the event hash (id) from an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    let hash = Sha256::digest(serialized.as_bytes());
    Ok(hex::encode(hash))
}

/// Validate an unsigned event structure.
pub fn validate_unsigned_event(event: &UnsignedEvent) -> bool {
    // 64 lowercase hex characters
    event.pubkey.len() == 64
        && event
            .pubkey
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Check that `event.id` is the hash of its contents.
///
/// Signature verification is the signer layer's concern; this only checks
/// content addressing, which is what deduplication by id relies on.
pub fn verify_event_id(event: &Event) -> bool {
    if event.id.len() != 64 {
        return false;
    }
    match get_event_hash(&event.unsigned()) {
        Ok(computed) => computed == event.id,
        Err(_) => false,
    }
}

/// Classify an event kind according to NIP-01 rules.
pub fn classify_kind(kind: u16) -> KindClassification {
    let k = kind as u32;

    // Regular: 1000 <= n < 10000 || 4 <= n < 45 || n == 1 || n == 2
    if (1000..10000).contains(&k) || (4..45).contains(&k) || k == 1 || k == 2 {
        return KindClassification::Regular;
    }

    // Replaceable: 10000 <= n < 20000 || n == 0 || n == 3
    if (10000..20000).contains(&k) || k == 0 || k == 3 {
        return KindClassification::Replaceable;
    }

    // Ephemeral: 20000 <= n < 30000
    if (20000..30000).contains(&k) {
        return KindClassification::Ephemeral;
    }

    // Addressable: 30000 <= n < 40000
    if (30000..40000).contains(&k) {
        return KindClassification::Addressable;
    }

    KindClassification::Unknown
}

/// Check if a kind is regular.
pub fn is_regular_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Regular)
}

/// Check if a kind is replaceable.
pub fn is_replaceable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Replaceable)
}

/// Check if a kind is ephemeral.
pub fn is_ephemeral_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Ephemeral)
}

/// Check if a kind is addressable.
pub fn is_addressable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Addressable)
}

/// Sort events in reverse-chronological order by created_at,
/// then by id (lexicographically) in case of ties.
pub fn sort_events<E: AsRef<Event>>(events: &mut [E]) {
    events.sort_by(|a, b| {
        let (a, b) = (a.as_ref(), b.as_ref());
        match b.created_at.cmp(&a.created_at) {
            std::cmp::Ordering::Equal => a.id.cmp(&b.id),
            other => other,
        }
    });
}

/// Profile metadata carried in the content of a kind 0 event.
///
/// Unknown fields are ignored and a missing field is `None`; relays serve a
/// lot of loosely formed profiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

impl Metadata {
    /// Parse the content of a kind 0 event.
    pub fn from_event(event: &Event) -> Result<Self, Nip01Error> {
        if event.kind != KIND_METADATA {
            return Err(Nip01Error::InvalidMetadata(format!(
                "expected kind 0, got {}",
                event.kind
            )));
        }
        let value: serde_json::Value = serde_json::from_str(&event.content)
            .map_err(|e| Nip01Error::InvalidMetadata(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| Nip01Error::InvalidMetadata("content is not an object".to_string()))?;

        let field = |name: &str| {
            object
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            name: field("name"),
            display_name: field("display_name").or_else(|| field("displayName")),
            about: field("about"),
            picture: field("picture"),
            banner: field("banner"),
            website: field("website"),
            nip05: field("nip05"),
            lud16: field("lud16"),
        })
    }
}
