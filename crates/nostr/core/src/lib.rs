//! Nostr protocol types shared by the relay runtime.
//!
//! This crate provides:
//! - NIP-01: Basic protocol (events, id hashing and verification, kind classification)
//! - NIP-11: Relay Information Document
//! - NIP-65: Relay List Metadata (plus the legacy contact-list relay map)
//!
//! Signing is not done here. Anything that turns an [`EventTemplate`] into a
//! signed [`Event`] lives behind the client's signer capability.

mod nip01;
mod nip11;
mod nip65;

pub use nip01::{
    Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_SHORT_TEXT_NOTE, KindClassification,
    Metadata, Nip01Error, UnsignedEvent, classify_kind, get_event_hash, is_addressable_kind,
    is_ephemeral_kind, is_regular_kind, is_replaceable_kind, serialize_event, sort_events,
    validate_unsigned_event, verify_event_id,
};
pub use nip11::{Limitation, Nip11Error, RelayInformation, SENTINEL_VALUES};
pub use nip65::{
    Nip65Error, READ_MARKER, RELAY_LIST_METADATA_KIND, RELAY_TAG, RelayEntry, RelayListMetadata,
    RelayMarker, WRITE_MARKER, create_relay_tag, get_relay_entries, is_relay_list_metadata_kind,
    relay_entries_from_contacts,
};
