//! Session error.

use vts_core::{ApiError, RegistryError, StorageError, TransportError};

/// Session error.
///
/// Returned from calls for local mistakes, and handed to the connection
/// `on_error` callback for failures discovered while ticking.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is not connected")]
    NotConnected,
    #[error("Session is already connected or connecting")]
    AlreadyConnected,
    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(String),
    #[error("Invalid request id: {0:?}")]
    InvalidRequestId(String),
    #[error("Invalid IP address: {0}")]
    InvalidAddress(String),
    #[error("Port {0} is not announced by any running instance")]
    UnknownPort(u16),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Token request denied: {0}")]
    TokenRequestDenied(ApiError),
    #[error("Resubscribing to {event_name} failed: {error}")]
    ResubscribeFailed { event_name: String, error: ApiError },
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
