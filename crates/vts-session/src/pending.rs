//! Pending request table.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use vts_core::{ApiError, MessageRegistry, RawEnvelope, Response};

use crate::subscriptions::{PendingSubscription, PendingUnsubscription};

/// Completion half of a caller's one-shot request.
pub(crate) trait ResponseHandler {
    /// Route a response envelope with this request's id.
    fn complete(self: Box<Self>, envelope: RawEnvelope, registry: &MessageRegistry);

    /// Fail without a response (timeout, connection loss).
    fn fail(self: Box<Self>, error: ApiError);
}

/// Handler decoding into a concrete response type.
pub(crate) struct TypedHandler<R, S, E> {
    on_success: S,
    on_error: E,
    _response: PhantomData<fn() -> R>,
}

impl<R, S, E> TypedHandler<R, S, E>
where
    R: Response,
    S: FnOnce(R) + 'static,
    E: FnOnce(ApiError) + 'static,
{
    pub(crate) fn boxed(on_success: S, on_error: E) -> Box<dyn ResponseHandler> {
        Box::new(Self {
            on_success,
            on_error,
            _response: PhantomData,
        })
    }
}

impl<R, S, E> ResponseHandler for TypedHandler<R, S, E>
where
    R: Response,
    S: FnOnce(R),
    E: FnOnce(ApiError),
{
    fn complete(self: Box<Self>, envelope: RawEnvelope, registry: &MessageRegistry) {
        let this = *self;
        match decode_response::<R>(envelope, registry) {
            Ok(response) => (this.on_success)(response),
            Err(error) => (this.on_error)(error),
        }
    }

    fn fail(self: Box<Self>, error: ApiError) {
        let this = *self;
        (this.on_error)(error);
    }
}

/// Turn a response envelope into `R` or the error the caller should see.
pub(crate) fn decode_response<R: Response>(
    envelope: RawEnvelope,
    registry: &MessageRegistry,
) -> Result<R, ApiError> {
    if envelope.is_error() {
        return Err(serde_json::from_value::<ApiError>(envelope.data)
            .unwrap_or_else(|e| ApiError::decode_failed(&envelope.message_type, &e)));
    }
    if registry.kind(&envelope.message_type).is_none() {
        return Err(ApiError::unknown_message_type(&envelope.message_type));
    }
    if envelope.message_type != R::MESSAGE_TYPE {
        return Err(ApiError::unexpected_response(
            R::MESSAGE_TYPE,
            &envelope.message_type,
        ));
    }
    serde_json::from_value(envelope.data)
        .map_err(|e| ApiError::decode_failed(R::MESSAGE_TYPE, &e))
}

/// Who is waiting for a response.
pub(crate) enum PendingKind {
    /// A caller's one-shot request.
    Caller(Box<dyn ResponseHandler>),
    /// Handshake: token request (waits on user consent, never times out).
    TokenRequest,
    /// Handshake: authentication with a token.
    Authenticate,
    /// A caller's subscription awaiting confirmation.
    Subscribe(Box<PendingSubscription>),
    /// Replay of an active subscription after reconnecting.
    Resubscribe { event_name: String },
    /// A caller's unsubscription awaiting confirmation.
    Unsubscribe(Box<PendingUnsubscription>),
}

impl PendingKind {
    /// Whether the request timeout applies.
    const fn expires(&self) -> bool {
        !matches!(self, Self::TokenRequest | Self::Authenticate)
    }

    const fn label(&self) -> &'static str {
        match self {
            Self::Caller(_) => "caller",
            Self::TokenRequest => "token",
            Self::Authenticate => "authenticate",
            Self::Subscribe(_) => "subscribe",
            Self::Resubscribe { .. } => "resubscribe",
            Self::Unsubscribe(_) => "unsubscribe",
        }
    }
}

impl std::fmt::Debug for PendingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

struct PendingRequest {
    kind: PendingKind,
    age: Duration,
}

/// Requests sent and not yet answered, keyed by request id.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    pub(crate) fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Insert an entry. The caller has already checked the id is unused.
    pub(crate) fn insert(&mut self, request_id: String, kind: PendingKind) {
        let previous = self.entries.insert(
            request_id,
            PendingRequest {
                kind,
                age: Duration::ZERO,
            },
        );
        debug_assert!(previous.is_none(), "request id reused");
    }

    pub(crate) fn remove(&mut self, request_id: &str) -> Option<PendingKind> {
        self.entries.remove(request_id).map(|p| p.kind)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Age every entry by `delta` and remove those older than `timeout`.
    pub(crate) fn expire(&mut self, delta: Duration, timeout: Duration) -> Vec<(String, PendingKind)> {
        let mut expired_ids = Vec::new();
        for (id, entry) in &mut self.entries {
            entry.age = entry.age.saturating_add(delta);
            if entry.kind.expires() && entry.age >= timeout {
                expired_ids.push(id.clone());
            }
        }
        expired_ids.sort();
        expired_ids
            .into_iter()
            .filter_map(|id| self.remove(&id).map(|kind| (id, kind)))
            .collect()
    }

    /// Remove every entry.
    pub(crate) fn drain(&mut self) -> Vec<(String, PendingKind)> {
        let mut drained: Vec<_> = self
            .entries
            .drain()
            .map(|(id, entry)| (id, entry.kind))
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }
}
