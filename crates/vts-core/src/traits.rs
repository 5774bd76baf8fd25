//! Collaborator traits consumed by the session core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Something that happened on the transport since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and ready for frames.
    Opened,
    /// An inbound text frame.
    Message(String),
    /// The connection closed. `clean` is true for a normal close handshake.
    Closed { clean: bool, reason: String },
    /// The connection failed (refused, I/O fault, protocol violation).
    Error(String),
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is not open")]
    NotOpen,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Failed to start transport: {0}")]
    StartFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Duplex text channel to the host.
///
/// Implementations own their I/O thread and buffer inbound events; every
/// method returns without blocking on the network.
pub trait Transport: Send {
    /// Begin connecting to `url`. Completion is reported as
    /// [`TransportEvent::Opened`] or [`TransportEvent::Error`].
    fn start(&mut self, url: &str) -> Result<(), TransportError>;

    /// Close the connection and release the socket. No events are produced
    /// for a stopped connection.
    fn stop(&mut self);

    /// Queue a text frame for sending.
    fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Take the next buffered event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Persistence for the plugin authentication token.
pub trait TokenStore: Send {
    /// Load the stored token, if any.
    fn load(&self) -> Result<Option<String>, StorageError>;

    /// Persist a token, replacing any previous one.
    fn save(&self, token: &str) -> Result<(), StorageError>;

    /// Forget the stored token. Deleting a missing token is not an error.
    fn delete(&self) -> Result<(), StorageError>;
}

/// A host instance learned from a discovery broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredEndpoint {
    /// Port the instance accepts API connections on.
    pub port: u16,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    pub window_title: String,
    /// Whether the API is switched on in that instance.
    pub active: bool,
}

/// Read-only view of discovered endpoints, safe to query from any thread.
pub trait PortDirectory: Send + Sync {
    /// Endpoints currently known, ordered by port.
    fn ports(&self) -> Vec<DiscoveredEndpoint>;

    /// Whether `port` belongs to a known endpoint.
    fn contains(&self, port: u16) -> bool {
        self.ports().iter().any(|e| e.port == port)
    }
}
