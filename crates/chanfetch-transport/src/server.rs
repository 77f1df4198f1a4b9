//! Transport server: turns inbound request envelopes into request/response
//! adapter pairs and hands them to a handler.
//!
//! Lifecycle is `Idle -> Listening -> Closed`, one way. Inbound messages are
//! dispatched one at a time in delivery order; a message delivered while a
//! dispatch is running is queued and drained by the running dispatch. Handler
//! futures run on their own tasks, so a slow handler never blocks dispatch.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{Channel, MessageHandler, Subscription};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::instance::{generate_instance_id, InstanceFilter, Role};
use crate::protocol::{message_len, Envelope, ErrorEnvelope, RequestEnvelope};
use crate::request::EmulatedRequest;
use crate::response::EmulatedResponse;

/// Future returned by a [`RequestHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// The framework seam: receives each accepted request with its response.
///
/// Implemented for any `Fn(EmulatedRequest, EmulatedResponse) -> impl Future`,
/// so plain async closures can be registered directly.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: EmulatedRequest, response: EmulatedResponse) -> HandlerFuture;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(EmulatedRequest, EmulatedResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, request: EmulatedRequest, response: EmulatedResponse) -> HandlerFuture {
        Box::pin(self(request, response))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Server lifecycle.
pub enum ServerState {
    /// Constructed, not yet subscribed.
    Idle = 0,
    /// Subscribed and dispatching requests.
    Listening = 1,
    /// Unsubscribed for good.
    Closed = 2,
}

impl From<u8> for ServerState {
    fn from(value: u8) -> Self {
        match value {
            0 => ServerState::Idle,
            1 => ServerState::Listening,
            _ => ServerState::Closed,
        }
    }
}

/// Snapshot of server counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Messages delivered by the channel.
    pub received: u64,
    /// Requests handed to the handler.
    pub dispatched: u64,
    /// Well-formed messages not meant for this server.
    pub ignored: u64,
    /// Messages that failed to decode or validate.
    pub malformed: u64,
    /// Requests answered with an error envelope.
    pub errors: u64,
    /// Responses not yet finalized.
    pub inflight: usize,
}

#[derive(Default)]
struct ServerCounters {
    received: AtomicU64,
    dispatched: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
    errors: AtomicU64,
}

struct ServerShared {
    instance_id: String,
    filter: InstanceFilter,
    channel: Arc<dyn Channel>,
    max_message_size: Option<usize>,
    state: AtomicU8,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    inflight: Mutex<HashMap<u64, EmulatedResponse>>,
    next_slot: AtomicU64,
    inbox: Mutex<VecDeque<Value>>,
    dispatching: AtomicBool,
    counters: ServerCounters,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl ServerShared {
    fn state(&self) -> ServerState {
        ServerState::from(self.state.load(Ordering::SeqCst))
    }

    fn pop_inbox(&self) -> Option<Value> {
        relock(&self.inbox).pop_front()
    }

    /// Queues `message` and drains the inbox unless a drain is already running.
    fn enqueue(self: &Arc<Self>, message: Value) {
        relock(&self.inbox).push_back(message);
        loop {
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }
            while let Some(next) = self.pop_inbox() {
                self.dispatch(next);
            }
            self.dispatching.store(false, Ordering::Release);
            if relock(&self.inbox).is_empty() {
                return;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: Value) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if self.state() != ServerState::Listening {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let size = message_len(&message);
        let envelope = match Envelope::from_value(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(instance_id = %self.instance_id, error = %e, "dropping malformed message");
                return;
            }
        };
        let Envelope::Request(request) = envelope else {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !self.filter.accepts(request.instance_id.as_deref()) {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            debug!(
                id = %request.id,
                instance_id = ?request.instance_id,
                own = %self.instance_id,
                "request for another instance ignored"
            );
            return;
        }

        let id = request.id.clone();
        let instance_id = request.instance_id.clone();
        if let Err(e) = self.accept(request, size) {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(id = %id, error = %e, "request failed before reaching the handler");
            self.send_error(id, instance_id, &e);
        }
    }

    fn accept(self: &Arc<Self>, request: RequestEnvelope, size: usize) -> Result<()> {
        if let Some(max_size) = self.max_message_size {
            if size > max_size {
                return Err(TransportError::MessageTooLarge { size, max_size });
            }
        }

        let response = EmulatedResponse::new(
            request.id.clone(),
            request.instance_id.clone(),
            self.channel.clone(),
        )
        .with_max_message_size(self.max_message_size);
        let request = EmulatedRequest::from_envelope(request)?;

        let handler = relock(&self.handler).clone();
        let Some(handler) = handler else {
            return Err(TransportError::HandlerError {
                message: "no request handler registered".to_string(),
            });
        };

        self.track_inflight(&response);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(id = %request.id(), method = %request.method(), url = %request.url(), "dispatching request");

        let shared = self.clone();
        tokio::spawn(async move {
            let answer = response.clone();
            let outcome = tokio::spawn(async move { handler.handle(request, answer).await }).await;
            let message = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(TransportError::HandlerError { message })) => message,
                Ok(Err(e)) => e.to_string(),
                Err(join) if join.is_panic() => panic_message(join.into_panic()),
                Err(_) => "handler task cancelled".to_string(),
            };
            let err = TransportError::HandlerError { message };
            if response.fail(&err) {
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(id = %response.request_id(), error = %err, "handler failed");
            } else {
                debug!(id = %response.request_id(), error = %err, "handler failed after responding");
            }
        });
        Ok(())
    }

    fn track_inflight(self: &Arc<Self>, response: &EmulatedResponse) {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        relock(&self.inflight).insert(slot, response.clone());
        let weak = Arc::downgrade(self);
        response.on_finish(move |_| {
            if let Some(shared) = weak.upgrade() {
                relock(&shared.inflight).remove(&slot);
            }
        });
    }

    fn send_error(&self, id: String, instance_id: Option<String>, err: &TransportError) {
        let envelope: Envelope = ErrorEnvelope::from_error(id, err)
            .with_instance_id(instance_id)
            .into();
        let sent = envelope
            .to_value()
            .and_then(|message| self.channel.send(message));
        if let Err(e) = sent {
            warn!(id = %envelope.id(), error = %e, "failed to send error envelope");
        }
    }
}

/// Answers requests arriving on a channel.
pub struct TransportServer {
    shared: Arc<ServerShared>,
    subscription: Mutex<Option<Subscription>>,
}

impl TransportServer {
    /// Creates an idle server. The instance id comes from `config` or is
    /// generated.
    pub fn new(channel: Arc<dyn Channel>, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| generate_instance_id(Role::Server));
        Ok(Self {
            shared: Arc::new(ServerShared {
                filter: InstanceFilter::new(instance_id.clone(), config.accept_untagged),
                instance_id,
                channel,
                max_message_size: config.max_message_size,
                state: AtomicU8::new(ServerState::Idle as u8),
                handler: Mutex::new(None),
                inflight: Mutex::new(HashMap::new()),
                next_slot: AtomicU64::new(0),
                inbox: Mutex::new(VecDeque::new()),
                dispatching: AtomicBool::new(false),
                counters: ServerCounters::default(),
            }),
            subscription: Mutex::new(None),
        })
    }

    /// Registers an async closure as the request handler, replacing any
    /// previous one.
    pub fn on_request<F, Fut>(&self, handler: F)
    where
        F: Fn(EmulatedRequest, EmulatedResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.set_handler(handler);
    }

    pub fn set_handler(&self, handler: impl RequestHandler) {
        *relock(&self.shared.handler) = Some(Arc::new(handler));
    }

    /// Starts accepting requests. Calling it again while listening is a no-op.
    pub fn listen(&self) -> Result<()> {
        let mut subscription = relock(&self.subscription);
        match self.shared.state() {
            ServerState::Listening => return Ok(()),
            ServerState::Closed => return Err(TransportError::ServerClosed),
            ServerState::Idle => {}
        }

        let weak = Arc::downgrade(&self.shared);
        let on_message: MessageHandler = Arc::new(move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.enqueue(message);
            }
        });
        // state first so messages delivered right after subscribing dispatch
        self.shared
            .state
            .store(ServerState::Listening as u8, Ordering::SeqCst);
        *subscription = Some(self.shared.channel.subscribe(on_message));
        info!(instance_id = %self.shared.instance_id, "server listening");
        Ok(())
    }

    /// Disposes every unfinished response and unsubscribes. Idempotent.
    pub fn close(&self) {
        let mut subscription = relock(&self.subscription);
        let previous = self
            .shared
            .state
            .swap(ServerState::Closed as u8, Ordering::SeqCst);
        if ServerState::from(previous) == ServerState::Closed {
            return;
        }

        let inflight: Vec<EmulatedResponse> = relock(&self.shared.inflight)
            .drain()
            .map(|(_, response)| response)
            .collect();
        let disposed = inflight.len();
        for response in inflight {
            response.dispose();
        }
        relock(&self.shared.inbox).clear();
        if let Some(subscription) = subscription.take() {
            subscription.unsubscribe();
        }
        info!(instance_id = %self.shared.instance_id, disposed, "server closed");
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ServerState::Listening
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// Responses handed to the handler and not yet finalized.
    pub fn inflight_count(&self) -> usize {
        relock(&self.shared.inflight).len()
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.shared.counters;
        ServerStats {
            received: c.received.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            inflight: self.inflight_count(),
        }
    }
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("instance_id", &self.shared.instance_id)
            .field("state", &self.state())
            .field("inflight", &self.inflight_count())
            .finish()
    }
}
