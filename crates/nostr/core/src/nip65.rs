//! NIP-65: Relay List Metadata
//!
//! Defines a replaceable event (kind 10002) to advertise relays where the user
//! writes to and relays where the user reads mentions from. Older clients put
//! the same information in the content of the kind 3 contact list as a JSON
//! object of `url -> {read, write}`; both forms are understood here.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/65.md>

use crate::Event;
use crate::nip01::KIND_CONTACTS;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Event kind for relay list metadata
pub const RELAY_LIST_METADATA_KIND: u16 = 10002;

/// Tag name for relay entries
pub const RELAY_TAG: &str = "r";

/// Marker for read-only relays
pub const READ_MARKER: &str = "read";

/// Marker for write-only relays
pub const WRITE_MARKER: &str = "write";

/// Errors that can occur during NIP-65 operations
#[derive(Debug, Error)]
pub enum Nip65Error {
    #[error("event is not a relay list event (kind {0})")]
    InvalidKind(u16),

    #[error("invalid contact list relay map: {0}")]
    InvalidContent(String),
}

/// Relay marker indicating usage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMarker {
    /// Relay is used for reading events
    Read,
    /// Relay is used for writing events
    Write,
    /// Relay is used for both reading and writing (default)
    ReadWrite,
}

impl RelayMarker {
    /// Build a marker from explicit flags. `false, false` is treated as read/write.
    pub fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (true, false) => RelayMarker::Read,
            (false, true) => RelayMarker::Write,
            _ => RelayMarker::ReadWrite,
        }
    }

    /// Convert to string (returns None for ReadWrite as it's implicit)
    pub fn to_str(&self) -> Option<&str> {
        match self {
            RelayMarker::Read => Some(READ_MARKER),
            RelayMarker::Write => Some(WRITE_MARKER),
            RelayMarker::ReadWrite => None,
        }
    }

    /// Check if this relay supports reading
    pub fn can_read(&self) -> bool {
        matches!(self, RelayMarker::Read | RelayMarker::ReadWrite)
    }

    /// Check if this relay supports writing
    pub fn can_write(&self) -> bool {
        matches!(self, RelayMarker::Write | RelayMarker::ReadWrite)
    }
}

impl FromStr for RelayMarker {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            READ_MARKER => RelayMarker::Read,
            WRITE_MARKER => RelayMarker::Write,
            _ => RelayMarker::ReadWrite,
        })
    }
}

/// A relay entry in the relay list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntry {
    /// Relay URL (wss://)
    pub url: String,
    /// Marker indicating read/write capability
    pub marker: RelayMarker,
}

impl RelayEntry {
    pub fn new(url: impl Into<String>, marker: RelayMarker) -> Self {
        Self {
            url: url.into(),
            marker,
        }
    }

    pub fn read_write(url: impl Into<String>) -> Self {
        Self::new(url, RelayMarker::ReadWrite)
    }

    pub fn read(url: impl Into<String>) -> Self {
        Self::new(url, RelayMarker::Read)
    }

    pub fn write(url: impl Into<String>) -> Self {
        Self::new(url, RelayMarker::Write)
    }
}

/// Relay list metadata event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayListMetadata {
    /// List of relay entries
    pub relays: Vec<RelayEntry>,
}

impl RelayListMetadata {
    pub fn new(relays: Vec<RelayEntry>) -> Self {
        Self { relays }
    }

    /// Parse from a kind 10002 event, or from the content of a kind 3 event.
    pub fn from_event(event: &Event) -> Result<Self, Nip65Error> {
        let relays = match event.kind {
            RELAY_LIST_METADATA_KIND => get_relay_entries(event),
            KIND_CONTACTS => relay_entries_from_contacts(&event.content)?,
            other => return Err(Nip65Error::InvalidKind(other)),
        };

        Ok(Self { relays })
    }

    /// Get all read relays
    pub fn read_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_read())
            .map(|r| r.url.clone())
            .collect()
    }

    /// Get all write relays
    pub fn write_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_write())
            .map(|r| r.url.clone())
            .collect()
    }

    /// Get all relays (regardless of marker)
    pub fn all_relays(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url.clone()).collect()
    }
}

/// Check if an event is a relay list metadata event
pub fn is_relay_list_metadata_kind(kind: u16) -> bool {
    kind == RELAY_LIST_METADATA_KIND
}

/// Get relay entries from the `r` tags of an event.
///
/// Tags without a URL are skipped; one bad tag does not discard the list.
pub fn get_relay_entries(event: &Event) -> Vec<RelayEntry> {
    event
        .tags
        .iter()
        .filter(|tag| tag.len() >= 2 && tag[0] == RELAY_TAG && !tag[1].trim().is_empty())
        .map(|tag| {
            let marker = tag
                .get(2)
                .and_then(|m| RelayMarker::from_str(m).ok())
                .unwrap_or(RelayMarker::ReadWrite);
            RelayEntry::new(tag[1].trim(), marker)
        })
        .collect()
}

/// Parse the legacy relay map stored in kind 3 content.
///
/// Empty content is an empty list. Entries with neither flag set are
/// dropped, since they advertise nothing.
pub fn relay_entries_from_contacts(content: &str) -> Result<Vec<RelayEntry>, Nip65Error> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| Nip65Error::InvalidContent(e.to_string()))?;
    let map = value
        .as_object()
        .ok_or_else(|| Nip65Error::InvalidContent("content is not an object".to_string()))?;

    let mut entries = Vec::new();
    for (url, flags) in map {
        let read = flags.get("read").and_then(|v| v.as_bool()).unwrap_or(false);
        let write = flags.get("write").and_then(|v| v.as_bool()).unwrap_or(false);
        if read || write {
            entries.push(RelayEntry::new(url.trim(), RelayMarker::from_flags(read, write)));
        }
    }
    Ok(entries)
}

/// Create a relay tag
pub fn create_relay_tag(url: impl Into<String>, marker: Option<RelayMarker>) -> Vec<String> {
    let mut tag = vec![RELAY_TAG.to_string(), url.into()];

    if let Some(m) = marker
        && let Some(marker_str) = m.to_str()
    {
        tag.push(marker_str.to_string());
    }

    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_event(kind: u16, tags: Vec<Vec<String>>, content: &str) -> Event {
        Event {
            id: "test_id".to_string(),
            pubkey: "test_pubkey".to_string(),
            created_at: 1707409439,
            kind,
            tags,
            content: content.to_string(),
            sig: "test_sig".to_string(),
        }
    }

    #[test]
    fn test_relay_marker_from_str() {
        assert!(matches!(RelayMarker::from_str("read"), Ok(RelayMarker::Read)));
        assert!(matches!(RelayMarker::from_str("write"), Ok(RelayMarker::Write)));
        assert!(matches!(RelayMarker::from_str(""), Ok(RelayMarker::ReadWrite)));
        assert!(matches!(
            RelayMarker::from_str("invalid"),
            Ok(RelayMarker::ReadWrite)
        ));
    }

    #[test]
    fn test_relay_marker_flags() {
        assert_eq!(RelayMarker::from_flags(true, false), RelayMarker::Read);
        assert_eq!(RelayMarker::from_flags(false, true), RelayMarker::Write);
        assert_eq!(RelayMarker::from_flags(true, true), RelayMarker::ReadWrite);
        assert!(RelayMarker::Write.can_write());
        assert!(!RelayMarker::Read.can_write());
    }

    #[test]
    fn test_example_from_nip() {
        let event = create_test_event(
            10002,
            vec![
                create_relay_tag("wss://alicerelay.example.com", None),
                create_relay_tag("wss://brando-relay.com", None),
                create_relay_tag("wss://expensive-relay.example2.com", Some(RelayMarker::Write)),
                create_relay_tag("wss://nostr-relay.example.com", Some(RelayMarker::Read)),
            ],
            "",
        );

        let metadata = RelayListMetadata::from_event(&event).unwrap();
        assert_eq!(metadata.relays.len(), 4);

        let write_relays = metadata.write_relays();
        assert_eq!(write_relays.len(), 3);
        assert!(write_relays.contains(&"wss://expensive-relay.example2.com".to_string()));
        assert!(!write_relays.contains(&"wss://nostr-relay.example.com".to_string()));

        let read_relays = metadata.read_relays();
        assert_eq!(read_relays.len(), 3);
        assert!(read_relays.contains(&"wss://nostr-relay.example.com".to_string()));
    }

    #[test]
    fn test_malformed_tags_are_skipped() {
        let event = create_test_event(
            10002,
            vec![
                vec!["r".to_string()],
                vec!["r".to_string(), "  ".to_string()],
                vec!["p".to_string(), "wss://not-a-relay-tag.com".to_string()],
                create_relay_tag("wss://relay.com", Some(RelayMarker::Write)),
            ],
            "",
        );

        let entries = get_relay_entries(&event);
        assert_eq!(entries, vec![RelayEntry::write("wss://relay.com")]);
    }

    #[test]
    fn test_from_contact_list_content() {
        let event = create_test_event(
            3,
            vec![],
            r#"{"wss://a.com":{"read":true,"write":true},"wss://b.com":{"read":true,"write":false},"wss://c.com":{"read":false,"write":false}}"#,
        );

        let metadata = RelayListMetadata::from_event(&event).unwrap();
        assert_eq!(
            metadata.relays,
            vec![
                RelayEntry::read_write("wss://a.com"),
                RelayEntry::read("wss://b.com"),
            ]
        );
        assert_eq!(metadata.write_relays(), vec!["wss://a.com".to_string()]);
    }

    #[test]
    fn test_contact_list_without_relays() {
        let event = create_test_event(3, vec![], "");
        assert!(RelayListMetadata::from_event(&event).unwrap().relays.is_empty());

        let event = create_test_event(3, vec![], "[]");
        assert!(matches!(
            RelayListMetadata::from_event(&event),
            Err(Nip65Error::InvalidContent(_))
        ));
    }

    #[test]
    fn test_invalid_kind() {
        let event = create_test_event(1, vec![], "");
        assert!(matches!(
            RelayListMetadata::from_event(&event),
            Err(Nip65Error::InvalidKind(1))
        ));
    }

    #[test]
    fn test_create_relay_tag_read_write_explicit() {
        let tag = create_relay_tag("wss://relay.com", Some(RelayMarker::ReadWrite));
        assert_eq!(tag, vec!["r".to_string(), "wss://relay.com".to_string()]);
    }
}
