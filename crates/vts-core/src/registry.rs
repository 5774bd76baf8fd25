//! `messageType` registry.
//!
//! Inbound frames are classified by looking their `messageType` up here, so
//! an unrecognized type takes one well-defined error path.

use std::collections::HashMap;

use thiserror::Error;

use crate::protocol::API_ERROR;
use crate::requests::{
    ApiStateResponse, AuthenticationResponse, AuthenticationTokenResponse, Event,
    EventSubscriptionResponse, Response, StatisticsResponse,
};

/// What a registered `messageType` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Answer to a one-shot request.
    Response,
    /// Server-pushed event.
    Event,
    /// `APIError`.
    Error,
}

/// Registry error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("message type {message_type} already registered as {existing:?}, not {requested:?}")]
    Conflict {
        message_type: String,
        existing: MessageKind,
        requested: MessageKind,
    },
    #[error("message type must not be empty")]
    EmptyName,
}

/// Table of known message types.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    kinds: HashMap<String, MessageKind>,
}

impl MessageRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with everything the session core exchanges.
    #[must_use]
    pub fn with_core_types() -> Self {
        let mut registry = Self::new();
        let core = [
            (API_ERROR, MessageKind::Error),
            (AuthenticationTokenResponse::MESSAGE_TYPE, MessageKind::Response),
            (AuthenticationResponse::MESSAGE_TYPE, MessageKind::Response),
            (EventSubscriptionResponse::MESSAGE_TYPE, MessageKind::Response),
            (ApiStateResponse::MESSAGE_TYPE, MessageKind::Response),
            (StatisticsResponse::MESSAGE_TYPE, MessageKind::Response),
        ];
        for (name, kind) in core {
            registry.kinds.insert(name.to_string(), kind);
        }
        registry
    }

    /// Register a message type. Registering the same kind twice is a no-op.
    ///
    /// # Errors
    /// Returns error if the name is empty or already registered as another kind.
    pub fn register(&mut self, message_type: &str, kind: MessageKind) -> Result<(), RegistryError> {
        if message_type.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        match self.kinds.get(message_type) {
            Some(&existing) if existing != kind => Err(RegistryError::Conflict {
                message_type: message_type.to_string(),
                existing,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None => {
                self.kinds.insert(message_type.to_string(), kind);
                Ok(())
            }
        }
    }

    /// Register a response type.
    ///
    /// # Errors
    /// Returns error on a kind conflict.
    pub fn register_response<R: Response>(&mut self) -> Result<(), RegistryError> {
        self.register(R::MESSAGE_TYPE, MessageKind::Response)
    }

    /// Register an event type.
    ///
    /// # Errors
    /// Returns error on a kind conflict.
    pub fn register_event<E: Event>(&mut self) -> Result<(), RegistryError> {
        self.register(E::EVENT_NAME, MessageKind::Event)
    }

    /// Look up a message type.
    #[must_use]
    pub fn kind(&self, message_type: &str) -> Option<MessageKind> {
        self.kinds.get(message_type).copied()
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
