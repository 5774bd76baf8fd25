//! Session core for the avatar host API client.
//!
//! Provides:
//! - `Session` - Connection state machine, request correlation and event
//!   subscriptions, driven by `tick`
//! - `RetryPolicy` - Backoff shared by reconnection and resubscription
//! - Token stores (memory, file)

mod auth;
pub mod client;
pub mod error;
mod pending;
pub mod retry;
pub mod storage;
mod subscriptions;

#[cfg(test)]
mod testing;

pub use client::{ConnectionState, Session};
pub use error::SessionError;
pub use retry::{RetryPolicy, RetryState};
