//! Authentication handshake.
//!
//! Runs after every transport open:
//! 1. Use the stored token, or request a new one (the host asks the user)
//! 2. Authenticate with the token
//! 3. On a first rejection, forget the token and start over once
//!
//! The handshake only decides what to send next; the session does the I/O.

use tracing::{debug, info, warn};
use vts_core::requests::{
    AuthenticationRequest, AuthenticationResponse, AuthenticationTokenRequest,
    AuthenticationTokenResponse,
};
use vts_core::{ApiError, PluginInfo, TokenStore};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPhase {
    Idle,
    RequestingToken,
    Authenticating,
    Authenticated,
}

/// Request the handshake wants sent.
#[derive(Debug)]
pub(crate) enum AuthOutbound {
    RequestToken(AuthenticationTokenRequest),
    Authenticate(AuthenticationRequest),
}

/// Next step after feeding the handshake.
#[derive(Debug)]
pub(crate) enum AuthStep {
    Send(AuthOutbound),
    /// Stale response; nothing to do.
    Ignore,
    Complete,
    Fail(SessionError),
}

#[derive(Debug)]
pub(crate) struct Handshake {
    phase: AuthPhase,
    /// A rejected token was already replaced once during this handshake.
    reauthenticated: bool,
    token: Option<String>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            phase: AuthPhase::Idle,
            reauthenticated: false,
            token: None,
        }
    }
}

impl Handshake {
    /// Start over with whatever token the store holds.
    pub(crate) fn begin(&mut self, store: &impl TokenStore, plugin: &PluginInfo) -> AuthStep {
        self.reset();
        self.token = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load token, requesting a new one");
            None
        });
        self.next_request(plugin)
    }

    pub(crate) fn on_token(
        &mut self,
        result: Result<AuthenticationTokenResponse, ApiError>,
        store: &impl TokenStore,
        plugin: &PluginInfo,
    ) -> AuthStep {
        if self.phase != AuthPhase::RequestingToken {
            debug!(phase = ?self.phase, "ignoring token response");
            return AuthStep::Ignore;
        }
        match result {
            Ok(response) if !response.authentication_token.is_empty() => {
                if let Err(e) = store.save(&response.authentication_token) {
                    warn!(error = %e, "failed to persist token");
                }
                self.token = Some(response.authentication_token);
                self.next_request(plugin)
            }
            Ok(_) => self.fail(SessionError::AuthenticationFailed(
                "host issued an empty token".into(),
            )),
            Err(error) => self.fail(SessionError::TokenRequestDenied(error)),
        }
    }

    pub(crate) fn on_authentication(
        &mut self,
        result: Result<AuthenticationResponse, ApiError>,
        store: &impl TokenStore,
        plugin: &PluginInfo,
    ) -> AuthStep {
        if self.phase != AuthPhase::Authenticating {
            debug!(phase = ?self.phase, "ignoring authentication response");
            return AuthStep::Ignore;
        }
        let reason = match result {
            Ok(response) if response.authenticated => {
                info!("authenticated");
                self.phase = AuthPhase::Authenticated;
                return AuthStep::Complete;
            }
            Ok(response) => response.reason,
            Err(error) => error.to_string(),
        };

        if self.reauthenticated {
            return self.fail(SessionError::AuthenticationFailed(reason));
        }
        info!(%reason, "token rejected, requesting a new one");
        self.reauthenticated = true;
        self.token = None;
        if let Err(e) = store.delete() {
            warn!(error = %e, "failed to delete rejected token");
        }
        self.next_request(plugin)
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.phase == AuthPhase::Authenticated
    }

    fn next_request(&mut self, plugin: &PluginInfo) -> AuthStep {
        let outbound = match &self.token {
            Some(token) => {
                self.phase = AuthPhase::Authenticating;
                AuthOutbound::Authenticate(AuthenticationRequest {
                    plugin_name: plugin.name.clone(),
                    plugin_developer: plugin.developer.clone(),
                    authentication_token: token.clone(),
                })
            }
            None => {
                self.phase = AuthPhase::RequestingToken;
                AuthOutbound::RequestToken(AuthenticationTokenRequest {
                    plugin_name: plugin.name.clone(),
                    plugin_developer: plugin.developer.clone(),
                    plugin_icon: plugin.icon.clone(),
                })
            }
        };
        AuthStep::Send(outbound)
    }

    fn fail(&mut self, error: SessionError) -> AuthStep {
        self.phase = AuthPhase::Idle;
        AuthStep::Fail(error)
    }
}
