//! Session core.
//!
//! A [`Session`] owns the transport, the pending request table and the
//! subscription table. Nothing happens in the background: every inbound
//! frame, timer and callback is processed inside [`Session::tick`] on the
//! caller's thread.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vts_core::protocol::MAX_REQUEST_ID_LEN;
use vts_core::requests::{
    AuthenticationResponse, AuthenticationTokenResponse, EventSubscriptionRequest,
    EventSubscriptionResponse,
};
use vts_core::{
    ApiError, ClientConfig, DiscoveredEndpoint, Envelope, Event, MessageKind, MessageRegistry,
    PortDirectory, RawEnvelope, Request, TokenStore, Transport, TransportEvent, to_wire_data,
};

use crate::auth::{AuthOutbound, AuthStep, Handshake};
use crate::error::SessionError;
use crate::pending::{PendingKind, PendingTable, TypedHandler, decode_response};
use crate::retry::{RetryPolicy, RetryState};
use crate::subscriptions::{
    PendingSubscription, PendingUnsubscription, SubscriptionTable, event_handler,
};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// Transport open, handshake running.
    Authenticating,
    /// Authenticated; caller requests are accepted.
    Open,
    /// Link lost; waiting for or running a reconnect attempt.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

struct ConnectionCallbacks {
    on_connect: Box<dyn FnMut()>,
    on_disconnect: Box<dyn FnMut()>,
    on_error: Box<dyn FnMut(SessionError)>,
}

/// Client session with one host instance.
pub struct Session<T: Transport, S: TokenStore> {
    transport: T,
    token_store: S,
    config: ClientConfig,
    state: ConnectionState,
    /// Authenticated at least once since `connect`.
    has_connected: bool,
    registry: MessageRegistry,
    pending: PendingTable,
    subscriptions: SubscriptionTable,
    handshake: Handshake,
    callbacks: Option<ConnectionCallbacks>,
    reconnect_policy: RetryPolicy,
    reconnect: RetryState,
    resubscribe_policy: RetryPolicy,
    request_timeout: Option<Duration>,
    directory: Option<Arc<dyn PortDirectory>>,
}

impl<T: Transport, S: TokenStore> Session<T, S> {
    /// Create a disconnected session.
    #[must_use]
    pub fn new(transport: T, token_store: S, config: ClientConfig) -> Self {
        Self {
            transport,
            token_store,
            reconnect_policy: RetryPolicy::from_config(&config.reconnect),
            resubscribe_policy: RetryPolicy::from_config(&config.resubscribe),
            request_timeout: config.request_timeout(),
            config,
            state: ConnectionState::Disconnected,
            has_connected: false,
            registry: MessageRegistry::with_core_types(),
            pending: PendingTable::default(),
            subscriptions: SubscriptionTable::default(),
            handshake: Handshake::default(),
            callbacks: None,
            reconnect: RetryState::default(),
            directory: None,
        }
    }

    /// Attach a source of discovered ports.
    ///
    /// Once attached, [`Session::set_port`] only accepts announced ports.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn PortDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    // ─── Connection ─────────────────────────────────────────────────────

    /// Start connecting to the configured host and port.
    ///
    /// `on_connect` fires after every successful authentication, once the
    /// active subscriptions have been replayed. `on_error` receives failures
    /// discovered while ticking. `on_disconnect` fires when the session
    /// stops for good.
    ///
    /// # Errors
    /// Returns error if the session is not disconnected or the transport
    /// refuses to start.
    pub fn connect<C, D, E>(
        &mut self,
        on_connect: C,
        on_disconnect: D,
        on_error: E,
    ) -> Result<(), SessionError>
    where
        C: FnMut() + 'static,
        D: FnMut() + 'static,
        E: FnMut(SessionError) + 'static,
    {
        if self.state != ConnectionState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }
        let url = self.config.url();
        info!(%url, "connecting");
        self.transport.start(&url)?;

        self.callbacks = Some(ConnectionCallbacks {
            on_connect: Box::new(on_connect),
            on_disconnect: Box::new(on_disconnect),
            on_error: Box::new(on_error),
        });
        self.state = ConnectionState::Connecting;
        self.reconnect.reset();
        Ok(())
    }

    /// Close the connection.
    ///
    /// Pending requests are dropped without their callbacks and no reconnect
    /// is attempted.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        info!(state = %self.state, "disconnecting");
        self.transport.stop();
        self.drop_pending();
        self.subscriptions.remove_inactive();
        let notify = self.has_connected;
        self.enter_disconnected(notify);
    }

    /// Process transport events, timers and retries.
    ///
    /// `delta` is the time elapsed since the previous call; all timeouts and
    /// backoff delays are measured in it.
    pub fn tick(&mut self, delta: Duration) {
        if self.state == ConnectionState::Reconnecting && self.reconnect.advance(delta) {
            self.attempt_reconnect();
        }

        while let Some(event) = self.transport.poll_event() {
            self.handle_transport_event(event);
        }

        if let Some(timeout) = self.request_timeout {
            for (request_id, kind) in self.pending.expire(delta, timeout) {
                warn!(%request_id, kind = ?kind, "request timed out");
                self.fail_pending(kind, ApiError::timed_out(&request_id));
            }
        }

        if self.state == ConnectionState::Open {
            for event_name in self.subscriptions.due_retries(delta) {
                self.resend_subscription(event_name);
            }
        }
    }

    // ─── Requests ───────────────────────────────────────────────────────

    /// Send a request with a generated id. Returns the id.
    ///
    /// Exactly one of `on_success` and `on_error` runs, from a later
    /// [`Session::tick`], unless the session is disconnected first.
    ///
    /// # Errors
    /// Returns error if the session is not open, the response type clashes
    /// with a registered message type, or the request cannot be sent.
    pub fn send<R, F, E>(
        &mut self,
        request: &R,
        on_success: F,
        on_error: E,
    ) -> Result<String, SessionError>
    where
        R: Request,
        F: FnOnce(R::Response) + 'static,
        E: FnOnce(ApiError) + 'static,
    {
        let request_id = Uuid::new_v4().to_string();
        self.send_with_id(request_id.clone(), request, on_success, on_error)?;
        Ok(request_id)
    }

    /// Send a request under a caller-chosen id.
    ///
    /// # Errors
    /// Returns error if the id is malformed or already pending, in addition
    /// to the errors of [`Session::send`].
    pub fn send_with_id<R, F, E>(
        &mut self,
        request_id: impl Into<String>,
        request: &R,
        on_success: F,
        on_error: E,
    ) -> Result<(), SessionError>
    where
        R: Request,
        F: FnOnce(R::Response) + 'static,
        E: FnOnce(ApiError) + 'static,
    {
        let request_id = request_id.into();
        validate_request_id(&request_id)?;
        if self.pending.contains(&request_id) {
            return Err(SessionError::DuplicateRequestId(request_id));
        }
        if self.state != ConnectionState::Open {
            return Err(SessionError::NotConnected);
        }
        self.registry.register_response::<R::Response>()?;
        self.write_request(&request_id, request)?;
        self.pending.insert(
            request_id,
            PendingKind::Caller(TypedHandler::<R::Response, _, _>::boxed(on_success, on_error)),
        );
        Ok(())
    }

    // ─── Subscriptions ──────────────────────────────────────────────────

    /// Subscribe to event `E`. Returns the request id.
    ///
    /// Once confirmed, `on_event` runs for every pushed `E` until
    /// [`Session::unsubscribe`], and the subscription is replayed after
    /// every reconnect. Subscribing again to the same event replaces the
    /// previous subscription.
    ///
    /// # Errors
    /// Returns error if the session is not open, the event name clashes with
    /// a registered response type, or the request cannot be sent.
    pub fn subscribe<E, F, C, X>(
        &mut self,
        config: &E::Config,
        on_event: F,
        on_subscribed: C,
        on_error: X,
    ) -> Result<String, SessionError>
    where
        E: Event,
        F: FnMut(E) + 'static,
        C: FnOnce(EventSubscriptionResponse) + 'static,
        X: FnOnce(ApiError) + 'static,
    {
        if self.state != ConnectionState::Open {
            return Err(SessionError::NotConnected);
        }
        self.registry.register_event::<E>()?;
        let config = to_wire_data(config)?;
        let request = EventSubscriptionRequest {
            event_name: E::EVENT_NAME.to_string(),
            subscribe: true,
            config: config.clone(),
        };
        let pending = PendingSubscription {
            event_name: E::EVENT_NAME.to_string(),
            config,
            on_event: event_handler(on_event),
            on_subscribed: Box::new(on_subscribed),
            on_error: Box::new(on_error),
        };
        let request_id = self.send_internal(&request, PendingKind::Subscribe(Box::new(pending)))?;
        debug!(event = E::EVENT_NAME, %request_id, "subscribing");
        Ok(request_id)
    }

    /// Cancel the subscription to `event_name`. Returns the request id.
    ///
    /// Events stop being delivered immediately. If the host rejects the
    /// request the subscription is restored.
    ///
    /// # Errors
    /// Returns error if the session is not open or the request cannot be sent.
    pub fn unsubscribe<C, X>(
        &mut self,
        event_name: &str,
        on_unsubscribed: C,
        on_error: X,
    ) -> Result<String, SessionError>
    where
        C: FnOnce(EventSubscriptionResponse) + 'static,
        X: FnOnce(ApiError) + 'static,
    {
        if self.state != ConnectionState::Open {
            return Err(SessionError::NotConnected);
        }
        let request = EventSubscriptionRequest {
            event_name: event_name.to_string(),
            subscribe: false,
            config: Value::Null,
        };
        let pending = PendingUnsubscription {
            event_name: event_name.to_string(),
            on_unsubscribed: Box::new(on_unsubscribed),
            on_error: Box::new(on_error),
        };
        self.subscriptions.set_active(event_name, false);
        self.send_internal(&request, PendingKind::Unsubscribe(Box::new(pending)))
            .inspect_err(|_| self.subscriptions.set_active(event_name, true))
    }

    // ─── Endpoint ───────────────────────────────────────────────────────

    /// Endpoints announced by running host instances.
    #[must_use]
    pub fn get_ports(&self) -> Vec<DiscoveredEndpoint> {
        self.directory
            .as_ref()
            .map(|d| d.ports())
            .unwrap_or_default()
    }

    /// Port used by the next connection attempt.
    ///
    /// # Errors
    /// Returns error if a directory is attached and no instance announced `port`.
    pub fn set_port(&mut self, port: u16) -> Result<(), SessionError> {
        let known = self.directory.as_ref().is_none_or(|d| d.contains(port));
        if port == 0 || !known {
            return Err(SessionError::UnknownPort(port));
        }
        self.config.port = port;
        Ok(())
    }

    /// Host address used by the next connection attempt.
    ///
    /// # Errors
    /// Returns error if `address` is not an IPv4 or IPv6 address.
    pub fn set_ip_address(&mut self, address: &str) -> Result<(), SessionError> {
        let ip: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| SessionError::InvalidAddress(address.to_string()))?;
        self.config.host = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        Ok(())
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Open && self.handshake.is_authenticated()
    }

    /// Requests waiting for a response, handshake included.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Names of subscribed events, sorted.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.subscriptions.active_names()
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ─── Transport events ───────────────────────────────────────────────

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => match self.state {
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    info!(state = %self.state, "transport open, authenticating");
                    self.state = ConnectionState::Authenticating;
                    let step = self.handshake.begin(&self.token_store, &self.config.plugin);
                    self.apply_auth_step(step);
                }
                state => debug!(%state, "ignoring transport open"),
            },
            TransportEvent::Message(text) => self.handle_frame(&text),
            TransportEvent::Closed { clean, reason } => self.on_link_down(clean, reason),
            TransportEvent::Error(reason) => self.on_link_down(false, reason),
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let envelope = match RawEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping unparseable frame");
                return;
            }
        };

        if let Some(kind) = self.pending.remove(&envelope.request_id) {
            debug!(
                request_id = %envelope.request_id,
                message_type = %envelope.message_type,
                kind = ?kind,
                "response received"
            );
            self.complete_pending(kind, envelope);
            return;
        }

        if !envelope.is_error()
            && self.registry.kind(&envelope.message_type) == Some(MessageKind::Event)
        {
            match self
                .subscriptions
                .dispatch(&envelope.message_type, envelope.data)
            {
                Ok(true) => {}
                Ok(false) => debug!(event = %envelope.message_type, "no active subscription"),
                Err(e) => warn!(event = %envelope.message_type, error = %e, "failed to decode event"),
            }
            return;
        }

        debug!(
            request_id = %envelope.request_id,
            message_type = %envelope.message_type,
            "dropping unmatched message"
        );
    }

    fn on_link_down(&mut self, clean: bool, reason: String) {
        match self.state {
            ConnectionState::Disconnected => {
                debug!(%reason, "ignoring close of stopped transport");
            }
            ConnectionState::Connecting => {
                warn!(%reason, "connection failed");
                self.transport.stop();
                self.state = ConnectionState::Disconnected;
                self.emit_error(SessionError::ConnectionFailed(reason));
                self.enter_disconnected(false);
            }
            ConnectionState::Reconnecting => {
                debug!(%reason, attempts = self.reconnect.attempts(), "reconnect attempt failed");
                self.transport.stop();
                self.schedule_reconnect();
            }
            ConnectionState::Authenticating if !self.has_connected => {
                warn!(%reason, "connection failed during handshake");
                self.transport.stop();
                self.drop_pending();
                self.state = ConnectionState::Disconnected;
                self.emit_error(SessionError::ConnectionFailed(reason));
                self.enter_disconnected(false);
            }
            // Lost again before the reconnect authenticated: one failed attempt.
            ConnectionState::Authenticating => {
                debug!(%reason, attempts = self.reconnect.attempts(), "reconnect attempt failed");
                self.transport.stop();
                self.drop_pending();
                self.handshake.reset();
                self.state = ConnectionState::Reconnecting;
                self.schedule_reconnect();
            }
            ConnectionState::Open if clean => {
                info!(%reason, "connection closed by host");
                self.transport.stop();
                self.state = ConnectionState::Disconnected;
                self.fail_all_pending();
                self.enter_disconnected(true);
            }
            ConnectionState::Open => {
                warn!(%reason, "connection lost");
                self.transport.stop();
                self.state = ConnectionState::Reconnecting;
                self.handshake.reset();
                self.subscriptions.reset_retries();
                self.emit_error(SessionError::ConnectionLost(reason));
                self.fail_all_pending();
                self.reconnect.reset();
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect_policy.delay_for(self.reconnect.attempts()) {
            Some(delay) => {
                debug!(?delay, attempts = self.reconnect.attempts(), "scheduling reconnect");
                self.reconnect.schedule(delay);
            }
            None => {
                warn!(attempts = self.reconnect.attempts(), "giving up reconnecting");
                self.enter_disconnected(true);
            }
        }
    }

    fn attempt_reconnect(&mut self) {
        let url = self.config.url();
        info!(%url, attempt = self.reconnect.attempts(), "reconnecting");
        if let Err(e) = self.transport.start(&url) {
            debug!(error = %e, "reconnect attempt failed to start");
            self.schedule_reconnect();
        }
    }

    fn enter_disconnected(&mut self, notify: bool) {
        self.state = ConnectionState::Disconnected;
        self.has_connected = false;
        self.handshake.reset();
        self.reconnect.reset();
        let callbacks = self.callbacks.take();
        if notify {
            if let Some(mut callbacks) = callbacks {
                (callbacks.on_disconnect)();
            }
        }
    }

    fn emit_error(&mut self, error: SessionError) {
        if let Some(callbacks) = self.callbacks.as_mut() {
            (callbacks.on_error)(error);
        }
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    fn apply_auth_step(&mut self, step: AuthStep) {
        match step {
            AuthStep::Send(AuthOutbound::RequestToken(request)) => {
                info!("requesting authentication token");
                self.send_handshake(&request, PendingKind::TokenRequest);
            }
            AuthStep::Send(AuthOutbound::Authenticate(request)) => {
                self.send_handshake(&request, PendingKind::Authenticate);
            }
            AuthStep::Ignore => {}
            AuthStep::Complete => self.on_authenticated(),
            AuthStep::Fail(error) => {
                warn!(%error, "handshake failed");
                self.transport.stop();
                self.drop_pending();
                self.state = ConnectionState::Disconnected;
                self.emit_error(error);
                self.enter_disconnected(false);
            }
        }
    }

    /// A handshake request that cannot be written ends the attempt as a lost link.
    fn send_handshake<R: Request>(&mut self, request: &R, kind: PendingKind) {
        if let Err(e) = self.send_internal(request, kind) {
            warn!(error = %e, message_type = R::MESSAGE_TYPE, "failed to send handshake request");
            self.on_link_down(false, e.to_string());
        }
    }

    fn on_authenticated(&mut self) {
        let replay = self.subscriptions.active_names();
        let replayed = replay.len();
        for event_name in replay {
            self.resend_subscription(event_name);
        }

        self.state = ConnectionState::Open;
        self.has_connected = true;
        self.reconnect.reset();
        info!(resubscribed = replayed, "session open");

        if let Some(callbacks) = self.callbacks.as_mut() {
            (callbacks.on_connect)();
        }
    }

    // ─── Pending requests ───────────────────────────────────────────────

    fn complete_pending(&mut self, kind: PendingKind, envelope: RawEnvelope) {
        match kind {
            PendingKind::Caller(handler) => handler.complete(envelope, &self.registry),
            PendingKind::TokenRequest => {
                let result = decode_response::<AuthenticationTokenResponse>(envelope, &self.registry);
                let step = self
                    .handshake
                    .on_token(result, &self.token_store, &self.config.plugin);
                self.apply_auth_step(step);
            }
            PendingKind::Authenticate => {
                let result = decode_response::<AuthenticationResponse>(envelope, &self.registry);
                let step =
                    self.handshake
                        .on_authentication(result, &self.token_store, &self.config.plugin);
                self.apply_auth_step(step);
            }
            PendingKind::Subscribe(pending) => {
                match decode_response::<EventSubscriptionResponse>(envelope, &self.registry) {
                    Ok(response) => {
                        let (subscription, on_subscribed) = pending.confirm();
                        self.subscriptions.insert(subscription);
                        info!(subscriptions = ?self.subscriptions.active_names(), "subscribed");
                        on_subscribed(response);
                    }
                    Err(error) => pending.fail(error),
                }
            }
            PendingKind::Resubscribe { event_name } => {
                match decode_response::<EventSubscriptionResponse>(envelope, &self.registry) {
                    Ok(_) => {
                        debug!(event = %event_name, "resubscribed");
                        if let Some(subscription) = self.subscriptions.get_mut(&event_name) {
                            subscription.retry.reset();
                        }
                    }
                    Err(error) => self.resubscribe_failed(event_name, error),
                }
            }
            PendingKind::Unsubscribe(pending) => {
                let PendingUnsubscription {
                    event_name,
                    on_unsubscribed,
                    on_error,
                } = *pending;
                match decode_response::<EventSubscriptionResponse>(envelope, &self.registry) {
                    Ok(response) => {
                        self.subscriptions.remove(&event_name);
                        info!(event = %event_name, "unsubscribed");
                        on_unsubscribed(response);
                    }
                    Err(error) => {
                        self.subscriptions.set_active(&event_name, true);
                        on_error(error);
                    }
                }
            }
        }
    }

    /// Fail one entry that will never get a response.
    fn fail_pending(&mut self, kind: PendingKind, error: ApiError) {
        match kind {
            PendingKind::Caller(handler) => handler.fail(error),
            PendingKind::TokenRequest | PendingKind::Authenticate => {}
            PendingKind::Subscribe(pending) => pending.fail(error),
            PendingKind::Resubscribe { event_name } => self.resubscribe_failed(event_name, error),
            PendingKind::Unsubscribe(pending) => {
                self.subscriptions.set_active(&pending.event_name, true);
                (pending.on_error)(error);
            }
        }
    }

    fn fail_all_pending(&mut self) {
        for (request_id, kind) in self.pending.drain() {
            debug!(%request_id, kind = ?kind, "failing pending request");
            self.fail_pending(kind, ApiError::connection_lost());
        }
    }

    fn drop_pending(&mut self) {
        let dropped = self.pending.drain().len();
        if dropped > 0 {
            debug!(dropped, "dropped pending requests");
        }
    }

    fn resubscribe_failed(&mut self, event_name: String, error: ApiError) {
        if self.state != ConnectionState::Open {
            debug!(event = %event_name, "connection gone, resubscribing after reconnect");
            return;
        }
        let Some(subscription) = self.subscriptions.get_mut(&event_name) else {
            return;
        };
        match self.resubscribe_policy.delay_for(subscription.retry.attempts()) {
            Some(delay) => {
                warn!(event = %event_name, %error, ?delay, "resubscribe rejected, retrying");
                subscription.retry.schedule(delay);
            }
            None => {
                subscription.retry.reset();
                warn!(event = %event_name, %error, "resubscribe retries exhausted");
                self.emit_error(SessionError::ResubscribeFailed { event_name, error });
            }
        }
    }

    fn resend_subscription(&mut self, event_name: String) {
        let Some(request) = self.subscriptions.get_mut(&event_name).map(|s| s.request()) else {
            return;
        };
        if let Err(e) = self.send_internal(&request, PendingKind::Resubscribe { event_name }) {
            warn!(event = %request.event_name, error = %e, "failed to resubscribe");
        }
    }

    // ─── Wire ───────────────────────────────────────────────────────────

    /// Send a request the session tracks itself. Bypasses the open check.
    fn send_internal<R: Request>(
        &mut self,
        request: &R,
        kind: PendingKind,
    ) -> Result<String, SessionError> {
        let request_id = Uuid::new_v4().to_string();
        self.write_request(&request_id, request)?;
        self.pending.insert(request_id.clone(), kind);
        Ok(request_id)
    }

    fn write_request<R: Request>(&mut self, request_id: &str, request: &R) -> Result<(), SessionError> {
        let data = to_wire_data(request)?;
        let text = serde_json::to_string(&Envelope::request(request_id, R::MESSAGE_TYPE, data))?;
        debug!(%request_id, message_type = R::MESSAGE_TYPE, "sending request");
        self.transport.send(text)?;
        Ok(())
    }
}

impl<T: Transport, S: TokenStore> Drop for Session<T, S> {
    fn drop(&mut self) {
        self.transport.stop();
    }
}

fn validate_request_id(request_id: &str) -> Result<(), SessionError> {
    let valid = !request_id.is_empty()
        && request_id.len() <= MAX_REQUEST_ID_LEN
        && request_id.chars().all(|c| c.is_ascii_graphic());
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidRequestId(request_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use vts_core::protocol::error_id;
    use vts_core::Response;
    use vts_core::registry::RegistryError;
    use vts_core::requests::{StatisticsRequest, StatisticsResponse, TestEvent, TestEventConfig};

    use super::*;
    use crate::testing::{CallLog, CountingTokenStore, MockTransport};

    type TestSession = Session<MockTransport, CountingTokenStore>;

    const TICK: Duration = Duration::from_millis(16);

    fn config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.plugin.name = "Stage Lights".into();
        config.plugin.developer = "Jamie".into();
        config
    }

    fn subscribe_frames(transport: &MockTransport) -> usize {
        transport
            .sent()
            .iter()
            .filter(|v| v["messageType"] == "EventSubscriptionRequest" && v["data"]["subscribe"] == true)
            .count()
    }

    /// Connect, recording callbacks. `connect` entries note how many
    /// subscribe frames had been sent when `on_connect` ran.
    fn connect(session: &mut TestSession, transport: &MockTransport, log: &CallLog) {
        let on_connect = {
            let (log, transport) = (log.clone(), transport.clone());
            move || log.push(format!("connect subs={}", subscribe_frames(&transport)))
        };
        let on_error = {
            let log = log.clone();
            move |e: SessionError| log.push(format!("error: {e}"))
        };
        session
            .connect(on_connect, log.recorder("disconnect"), on_error)
            .unwrap();
    }

    fn authenticate(session: &mut TestSession, transport: &MockTransport) {
        transport.push(TransportEvent::Opened);
        session.tick(TICK);
        transport.respond_to(
            "AuthenticationRequest",
            "AuthenticationResponse",
            json!({"authenticated": true, "reason": ""}),
        );
        session.tick(TICK);
    }

    fn open_session_with(config: ClientConfig) -> (TestSession, MockTransport, CountingTokenStore, CallLog) {
        let transport = MockTransport::default();
        let store = CountingTokenStore::with_token("abc");
        let log = CallLog::default();
        let mut session = Session::new(transport.clone(), store.clone(), config);
        connect(&mut session, &transport, &log);
        authenticate(&mut session, &transport);
        assert_eq!(session.state(), ConnectionState::Open);
        transport.clear_sent();
        (session, transport, store, log)
    }

    fn open_session() -> (TestSession, MockTransport, CountingTokenStore, CallLog) {
        open_session_with(config())
    }

    fn subscribe_test_event(session: &mut TestSession, transport: &MockTransport, log: &CallLog) {
        let (events, confirmed, failed) = (log.clone(), log.clone(), log.clone());
        session
            .subscribe(
                &TestEventConfig {
                    test_message_for_event: Some("hi".into()),
                },
                move |e: TestEvent| events.push(format!("event {}", e.counter)),
                move |r| confirmed.push(format!("subscribed {}", r.subscribed_event_count)),
                move |e| failed.push(format!("subscribe error {}", e.error_id)),
            )
            .unwrap();
        transport.respond_to(
            "EventSubscriptionRequest",
            "EventSubscriptionResponse",
            json!({"subscribedEventCount": 1, "subscribedEvents": ["TestEvent"]}),
        );
        session.tick(TICK);
    }

    fn send_statistics(session: &mut TestSession, request_id: &str, log: &CallLog) -> Result<(), SessionError> {
        let (ok, err) = (log.clone(), log.clone());
        session.send_with_id(
            request_id,
            &StatisticsRequest::default(),
            move |r: StatisticsResponse| ok.push(format!("stats {}", r.framerate)),
            move |e| err.push(format!("request error {}", e.error_id)),
        )
    }

    fn lose_connection(session: &mut TestSession, transport: &MockTransport) {
        transport.push(TransportEvent::Closed {
            clean: false,
            reason: "reset by peer".into(),
        });
        session.tick(TICK);
    }

    #[test]
    fn test_statistics_round_trip() {
        let (mut session, transport, _, log) = open_session();
        send_statistics(&mut session, "r1", &log).unwrap();

        let frame = transport.last_sent("StatisticsRequest").unwrap();
        assert_eq!(frame["requestID"], "r1");
        assert_eq!(frame["apiName"], "VTubeStudioPublicAPI");
        assert_eq!(frame["apiVersion"], "1.0");
        assert_eq!(session.pending_count(), 1);

        transport.respond("r1", "StatisticsResponse", json!({"framerate": 60, "uptime": 10}));
        session.tick(TICK);

        assert_eq!(log.count("stats 60"), 1);
        assert_eq!(log.count("request error"), 0);
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let (mut session, _, _, _) = open_session();
        let a = session
            .send(&StatisticsRequest::default(), |_| {}, |_| {})
            .unwrap();
        let b = session
            .send(&StatisticsRequest::default(), |_| {}, |_| {})
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(session.pending_count(), 2);
    }

    #[test]
    fn test_unmatched_response_is_dropped() {
        let (mut session, transport, _, log) = open_session();
        send_statistics(&mut session, "r1", &log).unwrap();

        transport.respond("other", "StatisticsResponse", json!({"framerate": 1}));
        transport.push(TransportEvent::Message("not json".into()));
        session.tick(TICK);

        assert_eq!(log.count("stats"), 0);
        assert_eq!(log.count("request error"), 0);
        assert_eq!(session.pending_count(), 1);
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[test]
    fn test_api_error_routed_to_request() {
        let (mut session, transport, _, log) = open_session();
        send_statistics(&mut session, "r1", &log).unwrap();

        transport.respond("r1", "APIError", json!({"errorID": 8, "message": "not allowed"}));
        session.tick(TICK);

        assert_eq!(log.calls().last().map(String::as_str), Some("request error 8"));
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_unknown_response_type() {
        let (mut session, transport, _, log) = open_session();
        send_statistics(&mut session, "r1", &log).unwrap();

        transport.respond("r1", "MysteryResponse", json!({}));
        session.tick(TICK);

        assert_eq!(
            log.count(&format!("request error {}", error_id::UNKNOWN_MESSAGE_TYPE)),
            1
        );
    }

    #[test]
    fn test_wrong_response_type() {
        let (mut session, transport, _, log) = open_session();
        send_statistics(&mut session, "r1", &log).unwrap();

        transport.respond("r1", "APIStateResponse", json!({"active": true}));
        session.tick(TICK);

        assert_eq!(
            log.count(&format!("request error {}", error_id::UNEXPECTED_RESPONSE)),
            1
        );
    }

    #[test]
    fn test_duplicate_request_id_rejected() {
        let (mut session, _, _, log) = open_session();
        send_statistics(&mut session, "dup", &log).unwrap();

        let err = send_statistics(&mut session, "dup", &log).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateRequestId(ref id) if id == "dup"));
        assert_eq!(session.pending_count(), 1);
    }

    #[test]
    fn test_invalid_request_ids_rejected() {
        let (mut session, _, _, log) = open_session();
        for id in [String::new(), "has space".into(), "x".repeat(MAX_REQUEST_ID_LEN + 1)] {
            assert!(matches!(
                send_statistics(&mut session, &id, &log),
                Err(SessionError::InvalidRequestId(_))
            ));
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_requests_need_open_session() {
        let transport = MockTransport::default();
        let mut session = Session::new(transport.clone(), CountingTokenStore::default(), config());
        let log = CallLog::default();

        assert!(matches!(
            send_statistics(&mut session, "r1", &log),
            Err(SessionError::NotConnected)
        ));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_connect_twice_rejected() {
        let (mut session, _, _, _) = open_session();
        assert!(matches!(
            session.connect(|| {}, || {}, |_| {}),
            Err(SessionError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct InjectRequest {
            id: String,
            value: f64,
            weight: f64,
            mode: String,
            face_found: i32,
        }

        impl Request for InjectRequest {
            const MESSAGE_TYPE: &'static str = "InjectParameterDataRequest";
            type Response = StatisticsResponse;
        }

        let (mut session, transport, _, _) = open_session();
        let request = InjectRequest {
            id: "MouthOpen".into(),
            value: 0.5,
            weight: f64::MIN,
            mode: String::new(),
            face_found: i32::MIN,
        };
        session.send(&request, |_| {}, |_| {}).unwrap();

        let data = &transport.last_sent("InjectParameterDataRequest").unwrap()["data"];
        assert_eq!(data, &json!({"id": "MouthOpen", "value": 0.5}));
    }

    #[test]
    fn test_registry_conflict_fails_fast() {
        #[derive(Deserialize)]
        struct Clash {}

        impl Response for Clash {
            const MESSAGE_TYPE: &'static str = "TestEvent";
        }

        #[derive(Serialize)]
        struct ClashRequest {}

        impl Request for ClashRequest {
            const MESSAGE_TYPE: &'static str = "ClashRequest";
            type Response = Clash;
        }

        let (mut session, transport, _, log) = open_session();
        subscribe_test_event(&mut session, &transport, &log);

        let err = session.send(&ClashRequest {}, |_| {}, |_| {}).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Registry(RegistryError::Conflict { .. })
        ));
    }

    #[test]
    fn test_request_timeout_fires_once() {
        let mut config = config();
        config.request_timeout_ms = Some(1_000);
        let (mut session, transport, _, log) = open_session_with(config);
        send_statistics(&mut session, "r1", &log).unwrap();

        session.tick(Duration::from_millis(600));
        assert_eq!(log.count("request error"), 0);
        session.tick(Duration::from_millis(600));
        session.tick(Duration::from_millis(600));
        assert_eq!(
            log.count(&format!("request error {}", error_id::REQUEST_TIMED_OUT)),
            1
        );

        transport.respond("r1", "StatisticsResponse", json!({"framerate": 60}));
        session.tick(TICK);
        assert_eq!(log.count("stats"), 0);
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let mut config = config();
        config.request_timeout_ms = Some(0);
        let (mut session, transport, _, log) = open_session_with(config);
        send_statistics(&mut session, "r1", &log).unwrap();

        session.tick(Duration::from_secs(600));
        assert_eq!(log.count("request error"), 0);
        assert_eq!(session.pending_count(), 1);

        transport.respond("r1", "StatisticsResponse", json!({"framerate": 60}));
        session.tick(TICK);
        assert_eq!(log.count("stats 60"), 1);
    }

    #[test]
    fn test_event_delivered_repeatedly() {
        let (mut session, transport, _, log) = open_session();
        subscribe_test_event(&mut session, &transport, &log);
        assert_eq!(log.count("subscribed 1"), 1);

        let frame = transport.last_sent("EventSubscriptionRequest").unwrap();
        assert_eq!(frame["data"]["config"], json!({"testMessageForEvent": "hi"}));

        transport.push_event("TestEvent", json!({"yourTestMessage": "hi", "counter": 1}));
        session.tick(TICK);
        transport.push_event("TestEvent", json!({"yourTestMessage": "hi", "counter": 2}));
        session.tick(TICK);

        assert_eq!(log.count("event"), 2);
        assert_eq!(log.count("event 2"), 1);
        assert_eq!(session.active_subscriptions(), vec!["TestEvent".to_string()]);
    }

    #[test]
    fn test_rejected_subscription_not_stored() {
        let (mut session, transport, _, log) = open_session();
        let failed = log.clone();
        session
            .subscribe(
                &TestEventConfig::default(),
                |_: TestEvent| {},
                |_| {},
                move |e| failed.push(format!("subscribe error {}", e.error_id)),
            )
            .unwrap();
        transport.respond_to(
            "EventSubscriptionRequest",
            "APIError",
            json!({"errorID": 451, "message": "unknown event"}),
        );
        session.tick(TICK);

        assert_eq!(log.count("subscribe error 451"), 1);
        assert!(session.active_subscriptions().is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_events() {
        let (mut session, transport, _, log) = open_session();
        subscribe_test_event(&mut session, &transport, &log);

        let done = log.clone();
        session
            .unsubscribe("TestEvent", move |_| done.push("unsubscribed"), |_| {})
            .unwrap();
        assert!(session.active_subscriptions().is_empty());

        let frame = transport.last_sent("EventSubscriptionRequest").unwrap();
        assert_eq!(frame["data"], json!({"eventName": "TestEvent", "subscribe": false}));

        transport.push_event("TestEvent", json!({"counter": 7}));
        transport.respond_to(
            "EventSubscriptionRequest",
            "EventSubscriptionResponse",
            json!({"subscribedEventCount": 0, "subscribedEvents": []}),
        );
        session.tick(TICK);

        assert_eq!(log.count("unsubscribed"), 1);
        assert_eq!(log.count("event"), 0);
        assert!(session.active_subscriptions().is_empty());
    }

    #[test]
    fn test_rejected_unsubscribe_restores_subscription() {
        let (mut session, transport, _, log) = open_session();
        subscribe_test_event(&mut session, &transport, &log);

        let failed = log.clone();
        session
            .unsubscribe("TestEvent", |_| {}, move |e| failed.push(format!("unsubscribe error {}", e.error_id)))
            .unwrap();
        transport.respond_to(
            "EventSubscriptionRequest",
            "APIError",
            json!({"errorID": 50, "message": "busy"}),
        );
        session.tick(TICK);

        assert_eq!(log.count("unsubscribe error 50"), 1);
        assert_eq!(session.active_subscriptions(), vec!["TestEvent".to_string()]);
    }

    #[test]
    fn test_connection_loss_fails_pending_requests() {
        let (mut session, transport, _, log) = open_session();
        send_statistics(&mut session, "r1", &log).unwrap();

        lose_connection(&mut session, &transport);

        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert_eq!(log.count("error: Connection lost"), 1);
        assert_eq!(
            log.count(&format!("request error {}", error_id::CONNECTION_LOST)),
            1
        );
        assert_eq!(session.pending_count(), 0);
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_reconnect_resubscribes_before_on_connect() {
        let (mut session, transport, _, log) = open_session();
        subscribe_test_event(&mut session, &transport, &log);
        transport.clear_sent();

        lose_connection(&mut session, &transport);
        assert_eq!(transport.starts(), 1);

        session.tick(Duration::from_secs(1));
        assert_eq!(transport.starts(), 2);
        assert_eq!(transport.last_url().as_deref(), Some("ws://localhost:8001"));

        authenticate(&mut session, &transport);
        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(
            transport.sent_types(),
            vec!["AuthenticationRequest", "EventSubscriptionRequest"]
        );
        assert_eq!(log.count("connect subs=1"), 1);

        let replay = transport.last_sent("EventSubscriptionRequest").unwrap();
        assert_eq!(replay["data"]["config"], json!({"testMessageForEvent": "hi"}));

        transport.respond_to(
            "EventSubscriptionRequest",
            "EventSubscriptionResponse",
            json!({"subscribedEventCount": 1, "subscribedEvents": ["TestEvent"]}),
        );
        transport.push_event("TestEvent", json!({"counter": 3}));
        session.tick(TICK);

        assert_eq!(log.count("event 3"), 1);
        assert_eq!(session.active_subscriptions(), vec!["TestEvent".to_string()]);
        assert_eq!(log.count("error"), 1);
    }

    #[test]
    fn test_failed_reconnect_attempt_is_silent() {
        let (mut session, transport, _, log) = open_session();
        lose_connection(&mut session, &transport);

        session.tick(Duration::from_secs(1));
        transport.push(TransportEvent::Error("connection refused".into()));
        session.tick(TICK);

        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert_eq!(log.count("error"), 1);

        session.tick(Duration::from_millis(1_500));
        assert_eq!(transport.starts(), 2);
        session.tick(Duration::from_millis(500));
        assert_eq!(transport.starts(), 3);
    }

    #[test]
    fn test_reconnect_gives_up_after_limit() {
        let mut config = config();
        config.reconnect.max_attempts = Some(1);
        let (mut session, transport, _, log) = open_session_with(config);
        lose_connection(&mut session, &transport);

        session.tick(Duration::from_secs(1));
        transport.push(TransportEvent::Error("connection refused".into()));
        session.tick(TICK);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(log.count("disconnect"), 1);
        session.tick(Duration::from_secs(60));
        assert_eq!(transport.starts(), 2);
    }

    #[test]
    fn test_reconnect_limit_counts_drops_during_handshake() {
        let mut config = config();
        config.reconnect.max_attempts = Some(2);
        let (mut session, transport, _, log) = open_session_with(config);
        lose_connection(&mut session, &transport);

        for _ in 0..5 {
            session.tick(Duration::from_secs(5));
            if session.state() == ConnectionState::Disconnected {
                break;
            }
            transport.push(TransportEvent::Opened);
            session.tick(TICK);
            assert_eq!(session.state(), ConnectionState::Authenticating);
            lose_connection(&mut session, &transport);
        }

        assert_eq!(transport.starts(), 3);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(log.count("error"), 1);
        assert_eq!(log.count("disconnect"), 1);
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_reconnect_after_handshake_drop_still_opens() {
        let (mut session, transport, _, log) = open_session();
        lose_connection(&mut session, &transport);

        session.tick(Duration::from_secs(1));
        transport.push(TransportEvent::Opened);
        session.tick(TICK);
        lose_connection(&mut session, &transport);
        assert_eq!(session.state(), ConnectionState::Reconnecting);

        session.tick(Duration::from_secs(2));
        assert_eq!(transport.starts(), 3);
        authenticate(&mut session, &transport);

        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(log.count("connect"), 2);
        assert_eq!(log.count("error"), 1);
    }

    #[test]
    fn test_close_during_first_handshake_is_connection_failure() {
        let transport = MockTransport::default();
        let log = CallLog::default();
        let mut session = Session::new(transport.clone(), CountingTokenStore::with_token("abc"), config());
        connect(&mut session, &transport, &log);

        transport.push(TransportEvent::Opened);
        session.tick(TICK);
        assert_eq!(session.state(), ConnectionState::Authenticating);
        transport.push(TransportEvent::Closed {
            clean: true,
            reason: "plugin API disabled".into(),
        });
        session.tick(TICK);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(log.count("error: Connection failed"), 1);
        assert_eq!(log.count("disconnect"), 0);
        assert_eq!(session.pending_count(), 0);

        session.tick(Duration::from_secs(60));
        assert_eq!(transport.starts(), 1);
    }

    #[test]
    fn test_unsendable_handshake_fails_connection() {
        let transport = MockTransport::default();
        let log = CallLog::default();
        let mut session = Session::new(transport.clone(), CountingTokenStore::with_token("abc"), config());
        connect(&mut session, &transport, &log);

        transport.push(TransportEvent::Opened);
        transport.refuse_sends();
        session.tick(TICK);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(log.count("error: Connection failed"), 1);
        assert_eq!(session.pending_count(), 0);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_clean_close_does_not_reconnect() {
        let (mut session, transport, _, log) = open_session();
        transport.push(TransportEvent::Closed {
            clean: true,
            reason: "host shutting down".into(),
        });
        session.tick(TICK);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(log.count("disconnect"), 1);
        assert_eq!(log.count("error"), 0);

        session.tick(Duration::from_secs(60));
        assert_eq!(transport.starts(), 1);
    }

    #[test]
    fn test_first_attempt_failure_does_not_retry() {
        let transport = MockTransport::default();
        let log = CallLog::default();
        let mut session = Session::new(transport.clone(), CountingTokenStore::default(), config());
        connect(&mut session, &transport, &log);

        transport.push(TransportEvent::Error("connection refused".into()));
        session.tick(TICK);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(log.count("error: Connection failed"), 1);
        assert_eq!(log.count("disconnect"), 0);

        session.tick(Duration::from_secs(60));
        assert_eq!(transport.starts(), 1);
    }

    #[test]
    fn test_transport_start_error_returned() {
        let transport = MockTransport::default();
        transport.fail_next_start();
        let mut session = Session::new(transport, CountingTokenStore::default(), config());

        assert!(matches!(
            session.connect(|| {}, || {}, |_| {}),
            Err(SessionError::Transport(_))
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_drops_pending_silently() {
        let (mut session, transport, _, log) = open_session();
        send_statistics(&mut session, "r1", &log).unwrap();

        session.disconnect();
        session.tick(Duration::from_secs(60));

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.pending_count(), 0);
        assert_eq!(log.count("request error"), 0);
        assert_eq!(log.count("error"), 0);
        assert_eq!(log.count("disconnect"), 1);
        assert!(transport.stops() >= 1);
        assert_eq!(transport.starts(), 1);
    }

    #[test]
    fn test_missing_token_is_requested() {
        let transport = MockTransport::default();
        let store = CountingTokenStore::default();
        let log = CallLog::default();
        let mut session = Session::new(transport.clone(), store.clone(), config());
        connect(&mut session, &transport, &log);

        transport.push(TransportEvent::Opened);
        session.tick(TICK);
        let frame = transport.last_sent("AuthenticationTokenRequest").unwrap();
        assert_eq!(frame["data"], json!({"pluginName": "Stage Lights", "pluginDeveloper": "Jamie"}));

        transport.respond_to(
            "AuthenticationTokenRequest",
            "AuthenticationTokenResponse",
            json!({"authenticationToken": "fresh"}),
        );
        session.tick(TICK);
        let frame = transport.last_sent("AuthenticationRequest").unwrap();
        assert_eq!(frame["data"]["authenticationToken"], "fresh");
        assert_eq!(store.saves(), 1);

        transport.respond_to(
            "AuthenticationRequest",
            "AuthenticationResponse",
            json!({"authenticated": true}),
        );
        session.tick(TICK);
        assert!(session.is_authenticated());
        assert_eq!(log.count("connect"), 1);
    }

    #[test]
    fn test_token_request_not_timed_out() {
        let mut config = config();
        config.request_timeout_ms = Some(1_000);
        let transport = MockTransport::default();
        let log = CallLog::default();
        let mut session = Session::new(transport.clone(), CountingTokenStore::default(), config);
        connect(&mut session, &transport, &log);

        transport.push(TransportEvent::Opened);
        session.tick(TICK);
        session.tick(Duration::from_secs(120));

        assert_eq!(session.pending_count(), 1);
        assert_eq!(session.state(), ConnectionState::Authenticating);
        assert_eq!(log.count("error"), 0);
    }

    #[test]
    fn test_second_rejection_surfaces_once() {
        let transport = MockTransport::default();
        let store = CountingTokenStore::with_token("stale");
        let log = CallLog::default();
        let mut session = Session::new(transport.clone(), store.clone(), config());
        connect(&mut session, &transport, &log);

        transport.push(TransportEvent::Opened);
        session.tick(TICK);
        transport.respond_to(
            "AuthenticationRequest",
            "AuthenticationResponse",
            json!({"authenticated": false, "reason": "revoked"}),
        );
        session.tick(TICK);
        transport.respond_to(
            "AuthenticationTokenRequest",
            "AuthenticationTokenResponse",
            json!({"authenticationToken": "new"}),
        );
        session.tick(TICK);
        transport.respond_to(
            "AuthenticationRequest",
            "AuthenticationResponse",
            json!({"authenticated": false, "reason": "revoked"}),
        );
        session.tick(TICK);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(store.deletes(), 1);
        assert_eq!(log.count("error: Authentication failed"), 1);
        assert_eq!(log.count("connect"), 0);

        session.tick(Duration::from_secs(60));
        assert_eq!(transport.starts(), 1);
    }

    #[test]
    fn test_denied_token_request_surfaces() {
        let transport = MockTransport::default();
        let log = CallLog::default();
        let mut session = Session::new(transport.clone(), CountingTokenStore::default(), config());
        connect(&mut session, &transport, &log);

        transport.push(TransportEvent::Opened);
        session.tick(TICK);
        transport.respond_to(
            "AuthenticationTokenRequest",
            "APIError",
            json!({"errorID": 50, "message": "User has denied API access for your plugin."}),
        );
        session.tick(TICK);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(log.count("error: Token request denied"), 1);
    }

    #[test]
    fn test_resubscribe_exhaustion_keeps_subscription() {
        let (mut session, transport, _, log) = open_session();
        subscribe_test_event(&mut session, &transport, &log);
        transport.clear_sent();

        lose_connection(&mut session, &transport);
        session.tick(Duration::from_secs(1));
        authenticate(&mut session, &transport);

        let reject = |transport: &MockTransport| {
            transport.respond_to(
                "EventSubscriptionRequest",
                "APIError",
                json!({"errorID": 50, "message": "busy"}),
            );
        };

        reject(&transport);
        session.tick(TICK);
        for delay_ms in [500, 1_000, 2_000] {
            session.tick(Duration::from_millis(delay_ms));
            reject(&transport);
            session.tick(TICK);
        }

        assert_eq!(subscribe_frames(&transport), 4);
        assert_eq!(log.count("error: Resubscribing to TestEvent failed"), 1);
        assert_eq!(session.active_subscriptions(), vec!["TestEvent".to_string()]);
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[test]
    fn test_resubscribe_retry_recovers() {
        let (mut session, transport, _, log) = open_session();
        subscribe_test_event(&mut session, &transport, &log);
        transport.clear_sent();

        lose_connection(&mut session, &transport);
        session.tick(Duration::from_secs(1));
        authenticate(&mut session, &transport);

        transport.respond_to(
            "EventSubscriptionRequest",
            "APIError",
            json!({"errorID": 50, "message": "busy"}),
        );
        session.tick(TICK);
        assert_eq!(subscribe_frames(&transport), 1);

        session.tick(Duration::from_millis(500));
        assert_eq!(subscribe_frames(&transport), 2);
        transport.respond_to(
            "EventSubscriptionRequest",
            "EventSubscriptionResponse",
            json!({"subscribedEventCount": 1, "subscribedEvents": ["TestEvent"]}),
        );
        transport.push_event("TestEvent", json!({"counter": 7}));
        session.tick(TICK);

        assert_eq!(log.count("event 7"), 1);
        session.tick(Duration::from_secs(10));
        assert_eq!(subscribe_frames(&transport), 2);
        assert_eq!(log.count("error: Resubscribing"), 0);
        assert_eq!(log.count("error"), 1);
        assert_eq!(session.active_subscriptions(), vec!["TestEvent".to_string()]);
    }

    struct StaticDirectory(Vec<DiscoveredEndpoint>);

    impl PortDirectory for StaticDirectory {
        fn ports(&self) -> Vec<DiscoveredEndpoint> {
            self.0.clone()
        }
    }

    #[test]
    fn test_set_port_checks_directory() {
        let endpoint = DiscoveredEndpoint {
            port: 8002,
            instance_id: "abc".into(),
            window_title: "VTube Studio".into(),
            active: true,
        };
        let transport = MockTransport::default();
        let mut session = Session::new(transport.clone(), CountingTokenStore::default(), config())
            .with_directory(Arc::new(StaticDirectory(vec![endpoint.clone()])));

        assert_eq!(session.get_ports(), vec![endpoint]);
        assert!(matches!(session.set_port(9000), Err(SessionError::UnknownPort(9000))));
        session.set_port(8002).unwrap();

        session.connect(|| {}, || {}, |_| {}).unwrap();
        assert_eq!(transport.last_url().as_deref(), Some("ws://localhost:8002"));
    }

    #[test]
    fn test_set_port_without_directory() {
        let mut session = Session::new(MockTransport::default(), CountingTokenStore::default(), config());
        assert!(session.get_ports().is_empty());
        session.set_port(8005).unwrap();
        assert_eq!(session.config().port, 8005);
        assert!(session.set_port(0).is_err());
    }

    #[test]
    fn test_set_ip_address() {
        let transport = MockTransport::default();
        let mut session = Session::new(transport.clone(), CountingTokenStore::default(), config());

        assert!(matches!(
            session.set_ip_address("localhost:8001"),
            Err(SessionError::InvalidAddress(_))
        ));
        session.set_ip_address("::1").unwrap();
        assert_eq!(session.config().url(), "ws://[::1]:8001");

        session.set_ip_address("192.168.0.12").unwrap();
        session.connect(|| {}, || {}, |_| {}).unwrap();
        assert_eq!(transport.last_url().as_deref(), Some("ws://192.168.0.12:8001"));
    }
}
