//! Outbound response adapter.
//!
//! Looks like a socket-backed server response to the handler (status, headers,
//! chunked writes, end) but buffers everything and sends a single envelope when
//! finalized. The state machine is `Open -> HeadersSent -> Finished`, with an
//! orthogonal disposed flag. Finalization happens at most once no matter how many
//! times, or from how many places, `end`, `fail` or `dispose` are called; late
//! mutations are silently ignored rather than reported as errors.

use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::TransportError;
use crate::fetch::TRANSFER_ENCODING_HEADER;
use crate::headers::Headers;
use crate::protocol::{is_allowed_status, Envelope, ErrorEnvelope, ResponseEnvelope};

/// Lifecycle of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// Status and headers may still change.
    Open,
    /// Status and headers are frozen; body chunks may still be written.
    HeadersSent,
    /// Finalized; nothing changes any more.
    Finished,
}

/// How a response was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    /// A response envelope went out.
    Sent,
    /// An error envelope went out instead.
    Failed,
    /// Finalized without sending anything.
    Disposed,
}

type FinishHook = Box<dyn FnOnce(FinishKind) + Send>;

struct ResponseInner {
    state: ResponseState,
    disposed: bool,
    status: u16,
    headers: Headers,
    body: BytesMut,
    hooks: Vec<FinishHook>,
    outcome: Option<FinishKind>,
}

struct ResponseTarget {
    request_id: String,
    instance_id: Option<String>,
    channel: Arc<dyn Channel>,
    max_message_size: Option<usize>,
    done: watch::Sender<Option<FinishKind>>,
}

struct Finalized {
    status: u16,
    headers: Headers,
    body: Bytes,
    hooks: Vec<FinishHook>,
}

/// The response half of an adapter pair. Clones share state.
#[derive(Clone)]
pub struct EmulatedResponse {
    inner: Arc<Mutex<ResponseInner>>,
    target: Arc<ResponseTarget>,
}

/// Best-effort reinterpretation of a buffered body: text starting with `{` or
/// `[` is parsed as JSON (raw text if that fails), other text stays a string,
/// and non-UTF-8 bytes travel as base64.
pub fn interpret_body(raw: Bytes, headers: &mut Headers) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    match String::from_utf8(raw.to_vec()) {
        Ok(text) => {
            if text.starts_with('{') || text.starts_with('[') {
                Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
            } else {
                Some(Value::String(text))
            }
        }
        Err(_) => {
            headers.insert(TRANSFER_ENCODING_HEADER, "base64");
            Some(Value::String(STANDARD.encode(&raw)))
        }
    }
}

impl EmulatedResponse {
    /// Creates an open response answering `request_id`. Envelopes it sends are
    /// tagged with `instance_id`.
    pub fn new(
        request_id: impl Into<String>,
        instance_id: Option<String>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            inner: Arc::new(Mutex::new(ResponseInner {
                state: ResponseState::Open,
                disposed: false,
                status: 200,
                headers: Headers::new(),
                body: BytesMut::new(),
                hooks: Vec::new(),
                outcome: None,
            })),
            target: Arc::new(ResponseTarget {
                request_id: request_id.into(),
                instance_id,
                channel,
                max_message_size: None,
                done,
            }),
        }
    }

    /// Caps the encoded size of the answer. Must be called before the response
    /// is shared.
    pub fn with_max_message_size(mut self, max: Option<usize>) -> Self {
        if let Some(target) = Arc::get_mut(&mut self.target) {
            target.max_message_size = max;
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, ResponseInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn request_id(&self) -> &str {
        &self.target.request_id
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.target.instance_id.as_deref()
    }

    pub fn state(&self) -> ResponseState {
        self.lock().state
    }

    pub fn headers_sent(&self) -> bool {
        self.state() != ResponseState::Open
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ResponseState::Finished
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// How the response was finalized, if it has been.
    pub fn outcome(&self) -> Option<FinishKind> {
        self.lock().outcome
    }

    pub fn status(&self) -> u16 {
        self.lock().status
    }

    /// Sets the status while still `Open`. Returns false otherwise, or if the
    /// status is not allowed.
    pub fn set_status(&self, status: u16) -> bool {
        let mut inner = self.lock();
        if inner.disposed || inner.state != ResponseState::Open {
            return false;
        }
        if !is_allowed_status(status) {
            warn!(id = %self.target.request_id, status, "ignoring disallowed status");
            return false;
        }
        inner.status = status;
        true
    }

    pub fn set_header(&self, name: &str, value: impl Into<String>) -> bool {
        let mut inner = self.lock();
        if inner.disposed || inner.state != ResponseState::Open {
            debug!(id = %self.target.request_id, header = name, "late set_header ignored");
            return false;
        }
        inner.headers.insert(name, value);
        true
    }

    /// Header lookup, only while `Open`.
    pub fn get_header(&self, name: &str) -> Option<String> {
        let inner = self.lock();
        if inner.disposed || inner.state != ResponseState::Open {
            return None;
        }
        inner.headers.get(name).map(str::to_string)
    }

    pub fn remove_header(&self, name: &str) -> Option<String> {
        let mut inner = self.lock();
        if inner.disposed || inner.state != ResponseState::Open {
            return None;
        }
        inner.headers.remove(name)
    }

    /// Freezes status and headers. Ignored unless `Open`.
    pub fn write_head(&self, status: u16, headers: Option<&Headers>) -> bool {
        let mut inner = self.lock();
        if inner.disposed || inner.state != ResponseState::Open {
            debug!(id = %self.target.request_id, status, "duplicate write_head ignored");
            return false;
        }
        if !is_allowed_status(status) {
            warn!(id = %self.target.request_id, status, "ignoring disallowed status");
            return false;
        }
        inner.status = status;
        if let Some(headers) = headers {
            inner.headers.extend_from(headers);
        }
        inner.state = ResponseState::HeadersSent;
        true
    }

    /// Buffers a body chunk. Returns false once finished or disposed.
    pub fn write(&self, chunk: impl AsRef<[u8]>) -> bool {
        let mut inner = self.lock();
        if inner.disposed || inner.state == ResponseState::Finished {
            return false;
        }
        inner.body.extend_from_slice(chunk.as_ref());
        inner.state = ResponseState::HeadersSent;
        true
    }

    fn finalize(&self, trailing: Option<&[u8]>) -> Option<Finalized> {
        let mut inner = self.lock();
        if inner.disposed || inner.state == ResponseState::Finished {
            return None;
        }
        if let Some(chunk) = trailing {
            inner.body.extend_from_slice(chunk);
        }
        inner.state = ResponseState::Finished;
        Some(Finalized {
            status: inner.status,
            headers: std::mem::take(&mut inner.headers),
            body: inner.body.split().freeze(),
            hooks: std::mem::take(&mut inner.hooks),
        })
    }

    fn complete(&self, kind: FinishKind, mut hooks: Vec<FinishHook>) {
        {
            let mut inner = self.lock();
            inner.outcome = Some(kind);
            // hooks registered between finalize and now
            hooks.append(&mut inner.hooks);
        }
        self.target.done.send_replace(Some(kind));
        for hook in hooks {
            hook(kind);
        }
    }

    /// Finalizes and sends the response. Returns true only for the call that
    /// actually finalized.
    pub fn end(&self) -> bool {
        self.end_inner(None)
    }

    /// Appends `chunk`, then finalizes like [`end`](Self::end).
    pub fn end_with(&self, chunk: impl AsRef<[u8]>) -> bool {
        self.end_inner(Some(chunk.as_ref()))
    }

    /// Sends `value` as a JSON body, adding `content-type` when absent and the
    /// headers are still open.
    pub fn json(&self, value: &Value) -> bool {
        {
            let mut inner = self.lock();
            if !inner.disposed
                && inner.state == ResponseState::Open
                && !inner.headers.contains("content-type")
            {
                inner.headers.insert("content-type", "application/json");
            }
        }
        match serde_json::to_vec(value) {
            Ok(raw) => self.end_with(raw),
            Err(e) => self.fail(&TransportError::from(e)),
        }
    }

    fn end_inner(&self, trailing: Option<&[u8]>) -> bool {
        let Some(Finalized {
            status,
            mut headers,
            body,
            hooks,
        }) = self.finalize(trailing)
        else {
            debug!(id = %self.target.request_id, "response already finalized");
            return false;
        };

        let body = interpret_body(body, &mut headers);
        let envelope: Envelope = ResponseEnvelope::new(self.target.request_id.clone(), status)
            .with_instance_id(self.target.instance_id.clone())
            .with_headers(headers)
            .with_body(body)
            .into();

        let kind = match self.oversize(&envelope) {
            Some(err) => {
                warn!(id = %self.target.request_id, error = %err, "response too large, sending error");
                self.deliver(
                    ErrorEnvelope::from_error(self.target.request_id.clone(), &err)
                        .with_instance_id(self.target.instance_id.clone())
                        .into(),
                );
                FinishKind::Failed
            }
            None => {
                self.deliver(envelope);
                FinishKind::Sent
            }
        };
        self.complete(kind, hooks);
        true
    }

    fn oversize(&self, envelope: &Envelope) -> Option<TransportError> {
        let max_size = self.target.max_message_size?;
        let size = envelope.encoded_len().ok()?;
        (size > max_size).then_some(TransportError::MessageTooLarge { size, max_size })
    }

    /// Finalizes with an error envelope instead of a response.
    pub fn fail(&self, err: &TransportError) -> bool {
        let Some(Finalized { hooks, .. }) = self.finalize(None) else {
            debug!(id = %self.target.request_id, error = %err, "failure after finalization ignored");
            return false;
        };
        let envelope = ErrorEnvelope::from_error(self.target.request_id.clone(), err)
            .with_instance_id(self.target.instance_id.clone());
        self.deliver(envelope.into());
        self.complete(FinishKind::Failed, hooks);
        true
    }

    /// Finalizes without sending and blocks every further mutation.
    pub fn dispose(&self) -> bool {
        let hooks = {
            let mut inner = self.lock();
            if inner.disposed {
                return false;
            }
            inner.disposed = true;
            if inner.state == ResponseState::Finished {
                return true;
            }
            inner.state = ResponseState::Finished;
            std::mem::take(&mut inner.hooks)
        };
        debug!(id = %self.target.request_id, "response disposed unsent");
        self.complete(FinishKind::Disposed, hooks);
        true
    }

    /// Runs `hook` once the response is finalized, immediately if it already is.
    pub fn on_finish(&self, hook: impl FnOnce(FinishKind) + Send + 'static) {
        let outcome = {
            let mut inner = self.lock();
            if inner.outcome.is_none() {
                inner.hooks.push(Box::new(hook));
                return;
            }
            inner.outcome
        };
        if let Some(kind) = outcome {
            hook(kind);
        }
    }

    /// Waits until the response is finalized.
    pub async fn finished(&self) -> FinishKind {
        let mut rx = self.target.done.subscribe();
        loop {
            if let Some(kind) = *rx.borrow_and_update() {
                return kind;
            }
            if rx.changed().await.is_err() {
                return FinishKind::Disposed;
            }
        }
    }

    fn deliver(&self, envelope: Envelope) {
        let message = match envelope.to_value() {
            Ok(message) => message,
            Err(e) => {
                warn!(id = %self.target.request_id, error = %e, "failed to encode answer");
                return;
            }
        };
        if let Err(e) = self.target.channel.send(message) {
            warn!(id = %self.target.request_id, error = %e, "failed to send answer, dropping");
        }
    }
}

impl std::fmt::Debug for EmulatedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("EmulatedResponse")
            .field("request_id", &self.target.request_id)
            .field("state", &inner.state)
            .field("disposed", &inner.disposed)
            .field("status", &inner.status)
            .finish()
    }
}
