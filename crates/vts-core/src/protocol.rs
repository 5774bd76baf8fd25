//! Wire envelope shared by every request, response and event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Constant `apiName` carried by every message.
pub const API_NAME: &str = "VTubeStudioPublicAPI";

/// Protocol version sent with every request.
pub const API_VERSION: &str = "1.0";

/// `messageType` of error responses.
pub const API_ERROR: &str = "APIError";

/// Longest `requestID` the host accepts.
pub const MAX_REQUEST_ID_LEN: usize = 64;

/// Message wrapper.
///
/// Outbound requests always carry a `requestID`; the host echoes it back on
/// the matching response. Pushed events and discovery broadcasts may carry an
/// arbitrary id, so inbound parsing tolerates any field being absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    #[serde(default)]
    pub api_name: String,
    #[serde(default)]
    pub api_version: String,
    /// Host-side send time (Unix epoch milliseconds), inbound only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "requestID", default)]
    pub request_id: String,
    #[serde(default)]
    pub message_type: String,
    pub data: T,
}

/// Envelope with an undecoded payload.
pub type RawEnvelope = Envelope<Value>;

impl<T> Envelope<T> {
    /// Build an outbound request envelope.
    #[must_use]
    pub fn request(request_id: impl Into<String>, message_type: impl Into<String>, data: T) -> Self {
        Self {
            api_name: API_NAME.to_string(),
            api_version: API_VERSION.to_string(),
            timestamp: None,
            request_id: request_id.into(),
            message_type: message_type.into(),
            data,
        }
    }

    /// Whether this message is an `APIError`.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.message_type == API_ERROR
    }
}

impl RawEnvelope {
    /// Decode only the envelope fields of an inbound text frame.
    ///
    /// # Errors
    /// Returns error if the text is not a JSON object with a `data` field.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Client-side error ids.
///
/// Negative so they never collide with ids assigned by the host.
pub mod error_id {
    /// No response arrived within the request timeout.
    pub const REQUEST_TIMED_OUT: i32 = -1;
    /// The response `messageType` is not registered.
    pub const UNKNOWN_MESSAGE_TYPE: i32 = -2;
    /// The response is registered but not the type the request expects.
    pub const UNEXPECTED_RESPONSE: i32 = -3;
    /// The response payload did not match its declared type.
    pub const DECODE_FAILED: i32 = -4;
    /// The connection dropped before the response arrived.
    pub const CONNECTION_LOST: i32 = -5;
}

/// `APIError` payload, also used for errors synthesized by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("API error {error_id}: {message}")]
pub struct ApiError {
    #[serde(rename = "errorID")]
    pub error_id: i32,
    pub message: String,
}

impl ApiError {
    /// Create an error payload.
    #[must_use]
    pub fn new(error_id: i32, message: impl Into<String>) -> Self {
        Self {
            error_id,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timed_out(request_id: &str) -> Self {
        Self::new(
            error_id::REQUEST_TIMED_OUT,
            format!("no response to request {request_id}"),
        )
    }

    #[must_use]
    pub fn unknown_message_type(message_type: &str) -> Self {
        Self::new(
            error_id::UNKNOWN_MESSAGE_TYPE,
            format!("unrecognized message type: {message_type}"),
        )
    }

    #[must_use]
    pub fn unexpected_response(expected: &str, actual: &str) -> Self {
        Self::new(
            error_id::UNEXPECTED_RESPONSE,
            format!("expected {expected}, received {actual}"),
        )
    }

    #[must_use]
    pub fn decode_failed(message_type: &str, err: &serde_json::Error) -> Self {
        Self::new(
            error_id::DECODE_FAILED,
            format!("failed to decode {message_type}: {err}"),
        )
    }

    #[must_use]
    pub fn connection_lost() -> Self {
        Self::new(
            error_id::CONNECTION_LOST,
            "connection lost before a response arrived",
        )
    }

    /// Whether the error was produced locally rather than by the host.
    #[must_use]
    pub const fn is_synthesized(&self) -> bool {
        self.error_id < 0
    }
}
