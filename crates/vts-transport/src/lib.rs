//! Network collaborators for the session core.
//!
//! Provides:
//! - WebSocket transport on a background Tokio runtime (feature: websocket)
//! - UDP port discovery of running host instances (feature: discovery)

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "discovery")]
pub mod discovery;

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

#[cfg(feature = "discovery")]
pub use discovery::{DiscoveryError, EndpointTable, PortDiscovery};
