//! Inbound request adapter.
//!
//! Presents a request envelope the way a socket-backed server request looks to
//! a handler: method, url and headers are available immediately, while the body
//! arrives as events (`Data` then `End`). The events are emitted from a task
//! spawned at construction, so they land on the next scheduling tick and are
//! buffered until the handler reads them.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, TransportError};
use crate::headers::Headers;
use crate::protocol::{Method, RequestEnvelope};

/// Body notifications, in the order a stream-backed request emits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEvent {
    Data(Bytes),
    End,
}

/// The request half of an adapter pair.
#[derive(Debug)]
pub struct EmulatedRequest {
    id: String,
    instance_id: Option<String>,
    method: Method,
    url: String,
    headers: Headers,
    body: Option<Value>,
    events: mpsc::UnboundedReceiver<BodyEvent>,
    ended: bool,
}

/// Serializes a body to its single wire chunk: strings verbatim, everything
/// else as JSON text.
pub fn body_chunk(body: &Value) -> Result<Bytes> {
    match body {
        Value::String(s) => Ok(Bytes::from(s.clone())),
        other => Ok(Bytes::from(serde_json::to_vec(other)?)),
    }
}

impl EmulatedRequest {
    /// Builds the adapter and schedules its body events. Must be called inside
    /// a tokio runtime.
    pub fn from_envelope(envelope: RequestEnvelope) -> Result<Self> {
        let RequestEnvelope {
            id,
            instance_id,
            method,
            url,
            mut headers,
            body,
            ..
        } = envelope;

        let chunk = body.as_ref().map(body_chunk).transpose()?;
        if let Some(chunk) = &chunk {
            if !headers.contains("content-length") {
                headers.insert("content-length", chunk.len().to_string());
            }
        }

        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Some(chunk) = chunk {
                if tx.send(BodyEvent::Data(chunk)).is_err() {
                    return;
                }
            }
            let _ = tx.send(BodyEvent::End);
        });

        Ok(Self {
            id,
            instance_id,
            method,
            url,
            headers,
            body,
            events,
            ended: false,
        })
    }

    /// Correlation id of the envelope this request came from.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Path plus query string, as sent.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The url without its query string.
    pub fn path(&self) -> &str {
        self.url.split('?').next().unwrap_or_default()
    }

    /// Query parameters, percent-decoded. Later duplicates win.
    pub fn query(&self) -> HashMap<String, String> {
        let Some((_, query)) = self.url.split_once('?') else {
            return HashMap::new();
        };
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (decode_component(k), decode_component(v)),
                None => (decode_component(pair), String::new()),
            })
            .collect()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The body as it arrived in the envelope, without consuming events.
    pub fn body_value(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Next body event, or `None` after `End` has been observed.
    pub async fn next_event(&mut self) -> Option<BodyEvent> {
        if self.ended {
            return None;
        }
        let event = self.events.recv().await;
        if matches!(event, Some(BodyEvent::End) | None) {
            self.ended = true;
        }
        event
    }

    /// Collects every remaining `Data` chunk up to `End`.
    pub async fn read_body(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        while let Some(event) = self.next_event().await {
            if let BodyEvent::Data(chunk) = event {
                buf.extend_from_slice(&chunk);
            }
        }
        buf.freeze()
    }

    pub async fn text(&mut self) -> Result<String> {
        let raw = self.read_body().await;
        String::from_utf8(raw.to_vec()).map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    /// Reads the body and parses it as JSON. An empty body parses as `null`.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let raw = self.read_body().await;
        if raw.is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_slice(&raw)?)
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
