//! Transport client: `fetch`-style calls over a message channel.
//!
//! Each call becomes a request envelope tagged with the client's instance id
//! and a fresh correlation id. The reply is awaited through the correlation
//! manager, which also enforces the per-request timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, MessageHandler, Subscription};
use crate::config::TransportConfig;
use crate::correlation::{CorrelationManager, CorrelationStats};
use crate::error::{Result, TransportError};
use crate::fetch::{FetchOptions, FetchResponse};
use crate::instance::{generate_instance_id, new_correlation_id, InstanceFilter, Role};
use crate::protocol::{message_len, now_ms, Envelope, Method, RequestEnvelope, ResponseEnvelope};

struct ClientShared {
    instance_id: String,
    filter: InstanceFilter,
    channel: Arc<dyn Channel>,
    pending: CorrelationManager<ResponseEnvelope>,
    timeout: Option<Duration>,
    max_message_size: Option<usize>,
    disposed: AtomicBool,
}

impl ClientShared {
    fn on_message(&self, message: Value) {
        let envelope = match Envelope::from_value(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(instance_id = %self.instance_id, error = %e, "dropping malformed message");
                return;
            }
        };
        if !self.filter.accepts(envelope.instance_id()) {
            debug!(
                id = %envelope.id(),
                instance_id = ?envelope.instance_id(),
                own = %self.instance_id,
                "answer for another instance ignored"
            );
            return;
        }
        match envelope {
            Envelope::Request(_) => {}
            Envelope::Response(response) => {
                let id = response.id.clone();
                if !self.pending.resolve(&id, response) {
                    debug!(id = %id, "response for unknown or settled request dropped");
                }
            }
            Envelope::Error(error) => {
                let id = error.id.clone();
                if !self.pending.reject(&id, error.into()) {
                    debug!(id = %id, "error for unknown or settled request dropped");
                }
            }
        }
    }
}

async fn sweep_expired(shared: Weak<ClientShared>, every: Duration, max_age: Duration) {
    loop {
        tokio::time::sleep(every).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.disposed.load(Ordering::SeqCst) {
            return;
        }
        let expired = shared.pending.expire_older_than(max_age);
        if expired > 0 {
            debug!(instance_id = %shared.instance_id, expired, "expired stale requests");
        }
    }
}

/// Issues requests over a channel and awaits their answers.
pub struct TransportClient {
    shared: Arc<ClientShared>,
    subscription: Mutex<Option<Subscription>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TransportClient {
    /// Creates a client and subscribes it to `channel`. Starts the expiry sweep
    /// when `expirySweepInterval` and a timeout are both configured.
    pub fn new(channel: Arc<dyn Channel>, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| generate_instance_id(Role::Client));
        let shared = Arc::new(ClientShared {
            filter: InstanceFilter::new(instance_id.clone(), config.accept_untagged),
            instance_id,
            channel,
            pending: CorrelationManager::new(),
            timeout: config.timeout(),
            max_message_size: config.max_message_size,
            disposed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&shared);
        let on_message: MessageHandler = Arc::new(move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.on_message(message);
            }
        });
        let subscription = shared.channel.subscribe(on_message);

        let sweeper = match (config.expiry_sweep_interval(), shared.timeout) {
            (Some(every), Some(max_age)) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => Some(handle.spawn(sweep_expired(
                    Arc::downgrade(&shared),
                    every,
                    max_age,
                ))),
                Err(_) => {
                    warn!("no tokio runtime, expiry sweep disabled");
                    None
                }
            },
            (Some(_), None) => {
                debug!("expiry sweep needs a timeout, disabled");
                None
            }
            _ => None,
        };

        info!(instance_id = %shared.instance_id, "client ready");
        Ok(Self {
            shared,
            subscription: Mutex::new(Some(subscription)),
            sweeper: Mutex::new(sweeper),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.pending_count()
    }

    pub fn correlation_stats(&self) -> CorrelationStats {
        self.shared.pending.stats()
    }

    /// Sends `request` under a fresh correlation id and this client's instance
    /// id, then waits for its answer. `timeout` overrides the configured one;
    /// `Some(Duration::ZERO)` waits indefinitely.
    pub async fn send(
        &self,
        mut request: RequestEnvelope,
        timeout: Option<Duration>,
    ) -> Result<FetchResponse> {
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }
        request.id = new_correlation_id();
        request.instance_id = Some(self.shared.instance_id.clone());
        request.timestamp = now_ms();
        let id = request.id.clone();

        let message = Envelope::from(request).to_value()?;
        if let Some(max_size) = self.shared.max_message_size {
            let size = message_len(&message);
            if size > max_size {
                return Err(TransportError::MessageTooLarge { size, max_size });
            }
        }

        let timeout = timeout.or(self.shared.timeout);
        let reply = self.shared.pending.track(id.clone(), timeout);
        if let Err(e) = self.shared.channel.send(message) {
            warn!(id = %id, error = %e, "request send failed");
            self.shared.pending.reject(&id, e);
        }
        let response = reply.await?;
        Ok(FetchResponse::from(response))
    }

    /// Issues a request for `url`.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchResponse> {
        let FetchOptions {
            method,
            headers,
            body,
            timeout,
        } = options;
        let request = RequestEnvelope::new(String::new(), method, url)
            .with_headers(headers)
            .with_body(body);
        self.send(request, timeout).await
    }

    pub async fn get(&self, url: &str) -> Result<FetchResponse> {
        self.fetch(url, FetchOptions::new(Method::Get)).await
    }

    pub async fn head(&self, url: &str) -> Result<FetchResponse> {
        self.fetch(url, FetchOptions::new(Method::Head)).await
    }

    pub async fn options(&self, url: &str) -> Result<FetchResponse> {
        self.fetch(url, FetchOptions::new(Method::Options)).await
    }

    pub async fn delete(&self, url: &str) -> Result<FetchResponse> {
        self.fetch(url, FetchOptions::new(Method::Delete)).await
    }

    pub async fn post(&self, url: &str, body: Value) -> Result<FetchResponse> {
        self.fetch(url, FetchOptions::new(Method::Post).body(body))
            .await
    }

    pub async fn put(&self, url: &str, body: Value) -> Result<FetchResponse> {
        self.fetch(url, FetchOptions::new(Method::Put).body(body)).await
    }

    pub async fn patch(&self, url: &str, body: Value) -> Result<FetchResponse> {
        self.fetch(url, FetchOptions::new(Method::Patch).body(body))
            .await
    }

    /// Unsubscribes and fails every pending request with
    /// [`TransportError::ConnectionClosed`]. Later calls fail with
    /// [`TransportError::Disposed`]. Idempotent.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(subscription) = relock(&self.subscription).take() {
            subscription.unsubscribe();
        }
        if let Some(sweeper) = relock(&self.sweeper).take() {
            sweeper.abort();
        }
        let flushed = self.shared.pending.dispose_all();
        info!(instance_id = %self.shared.instance_id, flushed, "client disposed");
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Some(sweeper) = relock(&self.sweeper).take() {
            sweeper.abort();
        }
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("instance_id", &self.shared.instance_id)
            .field("pending", &self.pending_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
