//! Wire protocol shared by both ends of the channel.
//!
//! Every message is an [`Envelope`]: a tagged union of request, response and
//! error variants. All three carry a correlation `id`, an optional routing
//! `instanceId`, and a creation timestamp in epoch milliseconds. Envelopes travel
//! as JSON values; field names are camelCase and absent optionals are omitted.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TransportError};
use crate::headers::Headers;

/// HTTP status codes an envelope may carry.
pub const ALLOWED_STATUS_CODES: [u16; 23] = [
    200, 201, 202, 204, 301, 302, 304, 400, 401, 403, 404, 405, 408, 409, 413, 415, 422, 429,
    500, 501, 502, 503, 504,
];

/// Status used by error envelopes when none is given.
pub const DEFAULT_ERROR_STATUS: u16 = 500;

/// Returns true if `status` is in [`ALLOWED_STATUS_CODES`].
pub fn is_allowed_status(status: u16) -> bool {
    ALLOWED_STATUS_CODES.contains(&status)
}

/// Canonical reason phrase for an allowed status.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Request methods understood by the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            other => Err(TransportError::MalformedMessage {
                reason: format!("unknown method {other}"),
            }),
        }
    }
}

/// Discriminant of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
    Error,
}

/// A request travelling from a client to a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestEnvelope {
    /// Creates a request stamped with the current time.
    pub fn new(id: impl Into<String>, method: Method, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance_id: None,
            timestamp: now_ms(),
            method,
            url: url.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_instance_id(mut self, instance_id: Option<String>) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }
}

/// A successful answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ResponseEnvelope {
    /// Creates a response stamped with the current time.
    pub fn new(id: impl Into<String>, status: u16) -> Self {
        Self {
            id: id.into(),
            instance_id: None,
            timestamp: now_ms(),
            status,
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_instance_id(mut self, instance_id: Option<String>) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }
}

fn default_error_status() -> u16 {
    DEFAULT_ERROR_STATUS
}

/// A failed answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    pub error: String,
    #[serde(default = "default_error_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorEnvelope {
    /// Creates an error envelope stamped with the current time.
    pub fn new(id: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance_id: None,
            timestamp: now_ms(),
            error: error.into(),
            status,
            stack: None,
        }
    }

    /// Builds the error envelope answering request `id` for a local failure.
    pub fn from_error(id: impl Into<String>, err: &TransportError) -> Self {
        let status = err.status();
        let status = if is_allowed_status(status) {
            status
        } else {
            DEFAULT_ERROR_STATUS
        };
        Self::new(id, status, err.to_string())
    }

    pub fn with_instance_id(mut self, instance_id: Option<String>) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }
}

/// One discrete message on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Error(ErrorEnvelope),
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Request(_) => EnvelopeKind::Request,
            Envelope::Response(_) => EnvelopeKind::Response,
            Envelope::Error(_) => EnvelopeKind::Error,
        }
    }

    /// Correlation id.
    pub fn id(&self) -> &str {
        match self {
            Envelope::Request(r) => &r.id,
            Envelope::Response(r) => &r.id,
            Envelope::Error(e) => &e.id,
        }
    }

    /// Routing instance id, if tagged.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => r.instance_id.as_deref(),
            Envelope::Response(r) => r.instance_id.as_deref(),
            Envelope::Error(e) => e.instance_id.as_deref(),
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Envelope::Request(r) => r.timestamp,
            Envelope::Response(r) => r.timestamp,
            Envelope::Error(e) => e.timestamp,
        }
    }

    /// Checks the invariants deserialization alone cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.id().is_empty() {
            return Err(TransportError::MalformedMessage {
                reason: "empty correlation id".to_string(),
            });
        }
        match self {
            Envelope::Request(r) if r.url.is_empty() => Err(TransportError::MalformedMessage {
                reason: "request without url".to_string(),
            }),
            Envelope::Response(r) if !is_allowed_status(r.status) => {
                Err(TransportError::InvalidStatus(r.status))
            }
            Envelope::Error(e) if !is_allowed_status(e.status) => {
                Err(TransportError::InvalidStatus(e.status))
            }
            _ => Ok(()),
        }
    }

    /// Decodes and validates a channel message.
    pub fn from_value(message: Value) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_value(message).map_err(|e| TransportError::MalformedMessage {
                reason: e.to_string(),
            })?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Encodes the envelope as a channel message.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Size of the envelope's JSON encoding in bytes.
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

impl From<RequestEnvelope> for Envelope {
    fn from(r: RequestEnvelope) -> Self {
        Envelope::Request(r)
    }
}

impl From<ResponseEnvelope> for Envelope {
    fn from(r: ResponseEnvelope) -> Self {
        Envelope::Response(r)
    }
}

impl From<ErrorEnvelope> for Envelope {
    fn from(e: ErrorEnvelope) -> Self {
        Envelope::Error(e)
    }
}

/// Encoded size of a message already in channel form.
pub fn message_len(message: &Value) -> usize {
    serde_json::to_vec(message).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let mut headers = Headers::new();
        headers.insert("Accept", "application/json");
        let req = RequestEnvelope::new("req-1", Method::Post, "/api/users?page=2")
            .with_instance_id(Some("server_A".to_string()))
            .with_headers(headers)
            .with_body(Some(json!({"name": "Alice"})));
        let value = Envelope::from(req).to_value().unwrap();

        assert_eq!(value["type"], "request");
        assert_eq!(value["id"], "req-1");
        assert_eq!(value["instanceId"], "server_A");
        assert_eq!(value["method"], "POST");
        assert_eq!(value["url"], "/api/users?page=2");
        assert_eq!(value["headers"]["accept"], "application/json");
        assert_eq!(value["body"]["name"], "Alice");
    }

    #[test]
    fn test_optional_fields_omitted() {
        let value = Envelope::from(ResponseEnvelope::new("r", 204))
            .to_value()
            .unwrap();
        assert!(value.get("instanceId").is_none());
        assert!(value.get("body").is_none());
    }

    #[test]
    fn test_decode_response() {
        let env = Envelope::from_value(json!({
            "type": "response",
            "id": "abc",
            "instanceId": "client_1",
            "timestamp": 17,
            "status": 201,
            "headers": {"Content-Type": "application/json"},
            "body": {"ok": true}
        }))
        .unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Response);
        assert_eq!(env.id(), "abc");
        assert_eq!(env.instance_id(), Some("client_1"));
        assert_eq!(env.timestamp(), 17);
        match env {
            Envelope::Response(r) => {
                assert_eq!(r.status, 201);
                assert_eq!(r.headers.get("content-type"), Some("application/json"));
                assert_eq!(r.body, Some(json!({"ok": true})));
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_error_status_defaults_to_500() {
        let env = Envelope::from_value(json!({"type": "error", "id": "x", "error": "boom"})).unwrap();
        match env {
            Envelope::Error(e) => {
                assert_eq!(e.status, 500);
                assert_eq!(e.error, "boom");
                assert!(e.stack.is_none());
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(Envelope::from_value(json!("hello")).is_err());
        assert!(Envelope::from_value(json!({"type": "ping", "id": "1"})).is_err());
        assert!(Envelope::from_value(json!({"type": "request", "id": "1", "method": "BREW", "url": "/"})).is_err());
        assert!(Envelope::from_value(json!({"type": "request", "id": "", "method": "GET", "url": "/"})).is_err());
        assert!(Envelope::from_value(json!({"type": "request", "id": "1", "method": "GET", "url": ""})).is_err());

        let bad_status = Envelope::from_value(json!({"type": "response", "id": "1", "status": 299}));
        assert!(matches!(bad_status, Err(TransportError::InvalidStatus(299))));
    }

    #[test]
    fn test_method_parse_and_display() {
        assert_eq!("patch".parse::<Method>().unwrap(), Method::Patch);
        assert_eq!(Method::Options.to_string(), "OPTIONS");
        assert!("TRACE".parse::<Method>().is_err());
    }

    #[test]
    fn test_error_envelope_from_local_error() {
        let err = TransportError::HandlerError {
            message: "exploded".to_string(),
        };
        let env = ErrorEnvelope::from_error("id-9", &err);
        assert_eq!(env.status, 500);
        assert_eq!(env.error, "handler error: exploded");
    }

    #[test]
    fn test_allowed_statuses() {
        for status in ALLOWED_STATUS_CODES {
            assert!(is_allowed_status(status));
            assert_ne!(reason_phrase(status), "Unknown");
        }
        assert!(!is_allowed_status(418));
    }
}
