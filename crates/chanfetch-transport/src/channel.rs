//! Channel abstraction and an in-process channel pair.
//!
//! The host channel is an opaque, order-preserving, message-oriented link with
//! two primitives: fire-and-forget `send` and `subscribe`. Messages are JSON
//! values. [`MemoryChannel`] provides a connected pair of endpoints with
//! asynchronous in-order delivery, for tests and single-process embedding.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};

/// Callback invoked for every message delivered to a subscriber.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// A bidirectional message channel provided by the host environment.
pub trait Channel: Send + Sync + 'static {
    /// Sends a message to the peer. May fail if the peer is gone.
    fn send(&self, message: Value) -> Result<()>;

    /// Registers a handler for inbound messages. The handler stays attached
    /// until the returned [`Subscription`] is unsubscribed or dropped.
    fn subscribe(&self, handler: MessageHandler) -> Subscription;
}

/// RAII handle for a channel subscription. Detaches on drop.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps the closure that detaches the handler.
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A subscription with nothing to detach.
    pub fn detached() -> Self {
        Self { detach: None }
    }

    /// Detaches the handler now.
    pub fn unsubscribe(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Endpoint {
    subscribers: Mutex<Vec<(u64, MessageHandler)>>,
    next_subscriber: AtomicU64,
    delivered: AtomicU64,
}

impl Endpoint {
    fn snapshot(&self) -> Vec<MessageHandler> {
        self.subscribers
            .lock()
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    local: Arc<Endpoint>,
    outbound: mpsc::UnboundedSender<Value>,
    connected: Arc<AtomicBool>,
    sent: AtomicU64,
}

impl MemoryChannel {
    /// Creates two connected endpoints. Must be called inside a tokio runtime:
    /// each endpoint gets a delivery task that invokes its subscribers in order.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let connected = Arc::new(AtomicBool::new(true));
        let left = Arc::new(Endpoint::default());
        let right = Arc::new(Endpoint::default());
        let (to_right, right_rx) = mpsc::unbounded_channel();
        let (to_left, left_rx) = mpsc::unbounded_channel();

        tokio::spawn(deliver(left_rx, left.clone(), connected.clone()));
        tokio::spawn(deliver(right_rx, right.clone(), connected.clone()));

        (
            MemoryChannel {
                local: left,
                outbound: to_right,
                connected: connected.clone(),
                sent: AtomicU64::new(0),
            },
            MemoryChannel {
                local: right,
                outbound: to_left,
                connected,
                sent: AtomicU64::new(0),
            },
        )
    }

    /// Simulates the host tearing the link down. Both ends fail further sends
    /// and messages still in flight are dropped.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("memory channel disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Messages successfully sent from this end.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Messages delivered to this end's subscribers.
    pub fn delivered_count(&self) -> u64 {
        self.local.delivered.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.local.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

async fn deliver(
    mut inbound: mpsc::UnboundedReceiver<Value>,
    endpoint: Arc<Endpoint>,
    connected: Arc<AtomicBool>,
) {
    while let Some(message) = inbound.recv().await {
        if !connected.load(Ordering::SeqCst) {
            trace!("dropping message on disconnected channel");
            continue;
        }
        endpoint.delivered.fetch_add(1, Ordering::SeqCst);
        for handler in endpoint.snapshot() {
            handler(message.clone());
        }
    }
}

impl Channel for MemoryChannel {
    fn send(&self, message: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::ChannelClosed);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::SendFailed {
                reason: "delivery task stopped".to_string(),
            })?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self, handler: MessageHandler) -> Subscription {
        let key = self.local.next_subscriber.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subs) = self.local.subscribers.lock() {
            subs.push((key, handler));
        }
        let endpoint = Arc::downgrade(&self.local);
        Subscription::new(move || {
            if let Some(endpoint) = endpoint.upgrade() {
                if let Ok(mut subs) = endpoint.subscribers.lock() {
                    subs.retain(|(k, _)| *k != key);
                }
            }
        })
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("connected", &self.is_connected())
            .field("sent", &self.sent_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
