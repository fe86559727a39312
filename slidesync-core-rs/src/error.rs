//! Error taxonomy
//!
//! Every failure is caught at the boundary where it occurs and converted to
//! one of these. None of them is fatal to the process.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::identity::SessionId;
use crate::types::ShapeError;

/// Persistence failures on save (and watch setup)
#[derive(Debug, Error)]
pub enum StoreError {
    /// Payload too large for the backend. Expected: images are stored inline.
    #[error("payload of {size} bytes exceeds storage quota of {quota} bytes")]
    Capacity { size: usize, quota: usize },

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to watch storage: {0}")]
    Watch(#[from] notify::Error),
}

impl StoreError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, StoreError::Capacity { .. })
    }
}

/// Why `load` could not produce a persisted state
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no persisted state")]
    Missing,

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("persisted state is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("persisted state is malformed: {0}")]
    Shape(#[from] ShapeError),
}

/// Backoff bucket a failure falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffClass {
    /// An open channel closed
    Closed,
    /// The target answered but has no such session
    PeerUnavailable,
    /// Anything network-shaped, including timeouts
    Network,
}

/// Connection and network failures. Recoverable: backoff and retry.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("discovery error: {0}")]
    Discovery(String),
}

impl TransportError {
    pub fn backoff_class(&self) -> BackoffClass {
        match self {
            TransportError::PeerUnavailable(_) => BackoffClass::PeerUnavailable,
            _ => BackoffClass::Network,
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Http(response) => {
                let status = response.status();
                if status == tungstenite::http::StatusCode::NOT_FOUND {
                    TransportError::PeerUnavailable(format!("handshake rejected ({})", status))
                } else {
                    TransportError::Protocol(format!("unexpected handshake status {}", status))
                }
            }
            tungstenite::Error::Io(io) => TransportError::Network(io.to_string()),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::Network("connection closed".to_string())
            }
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Network(e.to_string())
    }
}

impl From<mdns_sd::Error> for TransportError {
    fn from(e: mdns_sd::Error) -> Self {
        TransportError::Discovery(e.to_string())
    }
}

/// User-input problems. Terminal for the view; reported once, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("missing session id: pass a viewer link with ?id=... or --id")]
    MissingSessionId,

    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),

    #[error("invalid viewer link: {0}")]
    InvalidLink(String),
}

/// A follower dropped an incoming payload. Logged only, never shown to the user.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("payload is not a shared state: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is malformed: {0}")]
    Shape(#[from] ShapeError),

    #[error("payload owned by {got}, expected {expected}")]
    IdentityMismatch { expected: SessionId, got: SessionId },
}

/// A presenter mutation that was discarded; the prior state is kept
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("slot {index} is out of range")]
    SlotOutOfRange { index: usize },

    #[error("image payload for slot {index} is empty")]
    EmptyImage { index: usize },

    #[error("no images loaded; fill a slot before starting")]
    NoImages,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("presenter engine is not running")]
    EngineStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_classes() {
        assert_eq!(
            TransportError::PeerUnavailable("x".into()).backoff_class(),
            BackoffClass::PeerUnavailable
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).backoff_class(),
            BackoffClass::Network
        );
        assert_eq!(
            TransportError::from(io::Error::from(io::ErrorKind::ConnectionRefused)).backoff_class(),
            BackoffClass::Network
        );
    }

    #[test]
    fn test_capacity_message() {
        let e = StoreError::Capacity { size: 10, quota: 4 };
        assert!(e.is_capacity());
        assert_eq!(
            e.to_string(),
            "payload of 10 bytes exceeds storage quota of 4 bytes"
        );
    }
}
