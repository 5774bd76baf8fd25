//! Core abstractions for the avatar host API client.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - Wire wrapper shared by requests, responses and events
//! - `Request` / `Response` / `Event` - Typed payload contracts
//! - `MessageRegistry` - `messageType` to message kind table
//! - `prune_unset` - Removes unset optional fields before transmission
//! - `Transport`, `TokenStore` and `PortDirectory` collaborator traits
//! - `ClientConfig` - Layered client configuration

pub mod config;
pub mod optional;
pub mod protocol;
pub mod registry;
pub mod requests;
pub mod traits;

pub use config::{BackoffConfig, ClientConfig, ConfigError, DiscoveryConfig, PluginInfo};
pub use optional::{prune_unset, to_wire_data};
pub use protocol::{ApiError, Envelope, RawEnvelope};
pub use registry::{MessageKind, MessageRegistry, RegistryError};
pub use requests::{Event, Request, Response};
pub use traits::{
    DiscoveredEndpoint, PortDirectory, StorageError, TokenStore, Transport, TransportError,
    TransportEvent,
};
