//! Typed payload contracts and the payloads the session core relies on.
//!
//! Endpoint wrappers outside this crate implement [`Request`], [`Response`]
//! and [`Event`] for their own shapes and hand them to the session.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// An outbound request payload.
pub trait Request: Serialize {
    /// `messageType` sent on the wire.
    const MESSAGE_TYPE: &'static str;

    /// Response the host answers with.
    type Response: Response;
}

/// A response payload.
pub trait Response: DeserializeOwned + 'static {
    /// `messageType` the host tags this response with.
    const MESSAGE_TYPE: &'static str;
}

/// A server-pushed event payload.
pub trait Event: DeserializeOwned + 'static {
    /// Event name, used both in subscription requests and as the
    /// `messageType` of pushed messages.
    const EVENT_NAME: &'static str;

    /// Event-specific subscription config.
    type Config: Serialize;
}

// ─── Core requests ──────────────────────────────────────────────────────

/// Requests a new authentication token; the host shows a consent popup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationTokenRequest {
    pub plugin_name: String,
    pub plugin_developer: String,
    /// Base64-encoded 128x128 PNG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_icon: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthenticationTokenResponse {
    pub authentication_token: String,
}

impl Request for AuthenticationTokenRequest {
    const MESSAGE_TYPE: &'static str = "AuthenticationTokenRequest";
    type Response = AuthenticationTokenResponse;
}

impl Response for AuthenticationTokenResponse {
    const MESSAGE_TYPE: &'static str = "AuthenticationTokenResponse";
}

/// Authenticates this connection with a previously issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest {
    pub plugin_name: String,
    pub plugin_developer: String,
    pub authentication_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthenticationResponse {
    pub authenticated: bool,
    pub reason: String,
}

impl Request for AuthenticationRequest {
    const MESSAGE_TYPE: &'static str = "AuthenticationRequest";
    type Response = AuthenticationResponse;
}

impl Response for AuthenticationResponse {
    const MESSAGE_TYPE: &'static str = "AuthenticationResponse";
}

/// Registers or cancels an event subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubscriptionRequest {
    pub event_name: String,
    pub subscribe: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventSubscriptionResponse {
    pub subscribed_event_count: i32,
    pub subscribed_events: Vec<String>,
}

impl Request for EventSubscriptionRequest {
    const MESSAGE_TYPE: &'static str = "EventSubscriptionRequest";
    type Response = EventSubscriptionResponse;
}

impl Response for EventSubscriptionResponse {
    const MESSAGE_TYPE: &'static str = "EventSubscriptionResponse";
}

/// Probes whether the API is active and this session is authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStateRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiStateResponse {
    pub active: bool,
    pub v_tube_studio_version: String,
    pub current_session_authenticated: bool,
}

impl Request for ApiStateRequest {
    const MESSAGE_TYPE: &'static str = "APIStateRequest";
    type Response = ApiStateResponse;
}

impl Response for ApiStateResponse {
    const MESSAGE_TYPE: &'static str = "APIStateResponse";
}

/// Host statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatisticsResponse {
    pub uptime: i64,
    pub framerate: i32,
    pub v_tube_studio_version: String,
    pub allowed_plugins: i32,
    pub connected_plugins: i32,
    pub started_with_steam: bool,
    pub window_width: i32,
    pub window_height: i32,
    pub window_is_fullscreen: bool,
}

impl Request for StatisticsRequest {
    const MESSAGE_TYPE: &'static str = "StatisticsRequest";
    type Response = StatisticsResponse;
}

impl Response for StatisticsResponse {
    const MESSAGE_TYPE: &'static str = "StatisticsResponse";
}

// ─── Events ─────────────────────────────────────────────────────────────

/// Config for events that take no options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoConfig {}

/// Echo event the host emits once per second while subscribed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestEvent {
    pub your_test_message: String,
    pub counter: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEventConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_message_for_event: Option<String>,
}

impl Event for TestEvent {
    const EVENT_NAME: &'static str = "TestEvent";
    type Config = TestEventConfig;
}

/// A model was loaded or unloaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelLoadedEvent {
    pub model_loaded: bool,
    pub model_name: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLoadedEventConfig {
    /// Restrict to these model ids; all models when absent.
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<Vec<String>>,
}

impl Event for ModelLoadedEvent {
    const EVENT_NAME: &'static str = "ModelLoadedEvent";
    type Config = ModelLoadedEventConfig;
}

/// Face or hand tracking was found or lost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackingStatusChangedEvent {
    pub face_found: bool,
    pub left_hand_found: bool,
    pub right_hand_found: bool,
}

impl Event for TrackingStatusChangedEvent {
    const EVENT_NAME: &'static str = "TrackingStatusChangedEvent";
    type Config = NoConfig;
}
