//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Relay information fetch failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Relay information document could not be parsed
    #[error("Invalid relay information: {0}")]
    RelayInfo(#[from] nostr::Nip11Error),

    /// Frame could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::message::MessageError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Connection was closed before the operation completed
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Relay is not configured for writing
    #[error("Relay is not writable: {0}")]
    NotWritable(String),

    /// Request without filters
    #[error("Request has no filters")]
    EmptyRequest,

    /// Invalid event
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Signer refused or failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Cache backend error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Work queue job failed or the worker is gone
    #[error("Job failed: {0}")]
    Job(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
