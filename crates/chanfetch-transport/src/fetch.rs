//! Caller-facing request options and response view.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{RemoteError, Result, TransportError};
use crate::headers::Headers;
use crate::protocol::{reason_phrase, ErrorEnvelope, Method, ResponseEnvelope};

/// Header marking a body carried as base64 text.
pub const TRANSFER_ENCODING_HEADER: &str = "content-transfer-encoding";

/// Options for a single `fetch` call.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: Headers,
    pub body: Option<Value>,
    /// Overrides the client's configured timeout. `Some(Duration::ZERO)` disables it.
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A settled response. The body stays in wire form until asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    id: String,
    instance_id: Option<String>,
    status: u16,
    headers: Headers,
    body: Option<Value>,
}

impl FetchResponse {
    pub fn from_envelope(envelope: ResponseEnvelope) -> Self {
        Self {
            id: envelope.id,
            instance_id: envelope.instance_id,
            status: envelope.status,
            headers: envelope.headers,
            body: envelope.body,
        }
    }

    /// Response-shaped view of an error envelope.
    pub fn from_error(envelope: &ErrorEnvelope) -> Self {
        let mut body = json!({ "error": envelope.error });
        if let Some(stack) = &envelope.stack {
            body["stack"] = Value::String(stack.clone());
        }
        let mut headers = Headers::new();
        headers.insert("content-type", "application/json");
        Self {
            id: envelope.id.clone(),
            instance_id: envelope.instance_id.clone(),
            status: envelope.status,
            headers,
            body: Some(body),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &'static str {
        reason_phrase(self.status)
    }

    /// True for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The body exactly as it arrived.
    pub fn body_value(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    fn is_base64(&self) -> bool {
        self.headers
            .get(TRANSFER_ENCODING_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("base64"))
    }

    /// Raw body bytes. Base64 bodies are decoded, JSON bodies re-serialized.
    pub fn bytes(&self) -> Result<Bytes> {
        match &self.body {
            None => Ok(Bytes::new()),
            Some(Value::String(s)) if self.is_base64() => STANDARD
                .decode(s)
                .map(Bytes::from)
                .map_err(|e| TransportError::SerializationError(e.to_string())),
            Some(Value::String(s)) => Ok(Bytes::from(s.clone())),
            Some(other) => Ok(Bytes::from(serde_json::to_vec(other)?)),
        }
    }

    /// Body as text. String bodies come back verbatim.
    pub fn text(&self) -> Result<String> {
        match &self.body {
            Some(Value::String(s)) if !self.is_base64() => Ok(s.clone()),
            _ => {
                let raw = self.bytes()?;
                String::from_utf8(raw.to_vec())
                    .map_err(|e| TransportError::SerializationError(e.to_string()))
            }
        }
    }

    /// Body deserialized into `T`. A missing body deserializes from `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.is_base64() {
            let raw = self.bytes()?;
            return Ok(serde_json::from_slice(&raw)?);
        }
        let value = self.body.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

impl From<ResponseEnvelope> for FetchResponse {
    fn from(envelope: ResponseEnvelope) -> Self {
        Self::from_envelope(envelope)
    }
}

impl From<ErrorEnvelope> for TransportError {
    fn from(envelope: ErrorEnvelope) -> Self {
        let response = FetchResponse::from_error(&envelope);
        TransportError::Remote(Box::new(RemoteError {
            status: envelope.status,
            message: envelope.error,
            stack: envelope.stack,
            response,
        }))
    }
}
