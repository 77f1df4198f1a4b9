//! Correlation of outbound requests with their single answer.
//!
//! Every tracked id owns a one-shot signal. The signal is fired exactly once:
//! by `resolve`, `reject`, the per-request timeout, the expiry sweep, or
//! `dispose_all`. Entries are removed from the table under the lock and the
//! signal is fired only after the lock is released, so nothing the waiting side
//! does can re-enter the table mid-update. Ids that are no longer pending
//! (late, duplicate, or foreign answers) are ignored. Dropping a reply before
//! it settles abandons its entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError};

/// Awaitable side of a tracked request. Resolves exactly once.
pub struct PendingReply<T> {
    id: String,
    rx: oneshot::Receiver<Result<T>>,
    taken: bool,
    /// Table entry this reply owns, if it was tracked.
    owner: Option<(Weak<Shared<T>>, u64)>,
}

impl<T> PendingReply<T> {
    fn settled(id: String, outcome: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self {
            id,
            rx,
            taken: false,
            owner: None,
        }
    }

    /// Correlation id this reply belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Takes the outcome without waiting, if it has arrived. Returns `None`
    /// once the outcome has been taken.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        if self.taken {
            return None;
        }
        let outcome = match self.rx.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(TransportError::ConnectionClosed),
        };
        self.taken = true;
        Some(outcome)
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        let Some((weak, seq)) = self.owner.take() else {
            return;
        };
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let abandoned = {
            let mut table = shared.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match table.entries.get(&self.id) {
                Some(entry) if entry.seq == seq => table.entries.remove(&self.id),
                _ => None,
            }
        };
        if let Some(entry) = abandoned {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            trace!(id = %self.id, "reply dropped before settling");
        }
    }
}

impl<T> std::fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("id", &self.id)
            .field("taken", &self.taken)
            .finish()
    }
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Snapshot of correlation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    /// Requests accepted by `track`.
    pub tracked: u64,
    /// Requests settled by `resolve`.
    pub resolved: u64,
    /// Requests settled by an explicit `reject`.
    pub rejected: u64,
    /// Requests rejected by their own timeout.
    pub timed_out: u64,
    /// Requests rejected by `expire_older_than`.
    pub expired: u64,
    /// Requests flushed by `dispose_all`.
    pub disposed: u64,
    /// Requests whose reply was dropped before an answer arrived.
    pub abandoned: u64,
    /// Requests still pending.
    pub active: usize,
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Resolved,
    Rejected,
    TimedOut,
}

struct Pending<T> {
    seq: u64,
    created_at: Instant,
    sender: oneshot::Sender<Result<T>>,
    timer: Option<JoinHandle<()>>,
}

struct Table<T> {
    entries: HashMap<String, Pending<T>>,
    next_seq: u64,
    disposed: bool,
}

#[derive(Default)]
struct Counters {
    tracked: AtomicU64,
    resolved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    expired: AtomicU64,
    disposed: AtomicU64,
    abandoned: AtomicU64,
}

struct Shared<T> {
    table: Mutex<Table<T>>,
    counters: Counters,
}

impl<T: Send + 'static> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Table<T>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(&self, id: &str, outcome: Result<T>, how: Settle) -> bool {
        let entry = self.lock().entries.remove(id);
        let Some(entry) = entry else {
            trace!(id, "settle for unknown id ignored");
            return false;
        };
        if let Some(timer) = entry.timer {
            if !matches!(how, Settle::TimedOut) {
                timer.abort();
            }
        }
        let counter = match how {
            Settle::Resolved => &self.counters.resolved,
            Settle::Rejected => &self.counters.rejected,
            Settle::TimedOut => &self.counters.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if entry.sender.send(outcome).is_err() {
            trace!(id, "reply receiver already dropped");
        }
        true
    }
}

/// Tracks outstanding requests by correlation id.
pub struct CorrelationManager<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CorrelationManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Default for CorrelationManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CorrelationManager<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table {
                    entries: HashMap::new(),
                    next_seq: 0,
                    disposed: false,
                }),
                counters: Counters::default(),
            }),
        }
    }

    /// Registers `id` and returns the reply to await.
    ///
    /// With a non-zero `timeout` the request is rejected with
    /// [`TransportError::RequestTimeout`] once it elapses. A disposed manager
    /// hands back a reply already rejected with [`TransportError::Disposed`].
    pub fn track(&self, id: impl Into<String>, timeout: Option<Duration>) -> PendingReply<T> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let seq = {
            let mut table = self.shared.lock();
            if table.disposed {
                debug!(id = %id, "track after dispose");
                return PendingReply::settled(id, Err(TransportError::Disposed));
            }
            if table.entries.contains_key(&id) {
                warn!(id = %id, "correlation id already pending");
                let err = TransportError::DuplicateRequestId { id: id.clone() };
                return PendingReply::settled(id, Err(err));
            }
            let seq = table.next_seq;
            table.next_seq += 1;
            table.entries.insert(
                id.clone(),
                Pending {
                    seq,
                    created_at: Instant::now(),
                    sender: tx,
                    timer: None,
                },
            );
            seq
        };
        self.shared.counters.tracked.fetch_add(1, Ordering::Relaxed);

        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            self.arm_timer(&id, timeout);
        }
        PendingReply {
            id,
            rx,
            taken: false,
            owner: Some((Arc::downgrade(&self.shared), seq)),
        }
    }

    fn arm_timer(&self, id: &str, timeout: Duration) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(id, "no tokio runtime, request timeout not armed");
                return;
            }
        };
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let timer_id = id.to_string();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                let err = TransportError::RequestTimeout {
                    id: timer_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                if shared.settle(&timer_id, Err(err), Settle::TimedOut) {
                    debug!(id = %timer_id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                }
            }
        });

        let mut table = self.shared.lock();
        match table.entries.get_mut(id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Settles `id` with `value`. Returns false if `id` is not pending.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        self.shared.settle(id, Ok(value), Settle::Resolved)
    }

    /// Settles `id` with `error`. Returns false if `id` is not pending.
    pub fn reject(&self, id: &str, error: TransportError) -> bool {
        self.shared.settle(id, Err(error), Settle::Rejected)
    }

    /// Rejects every entry at least `max_age` old with
    /// [`TransportError::RequestExpired`]. Returns how many were rejected.
    pub fn expire_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Pending<T>, Duration)> = {
            let mut table = self.shared.lock();
            let ids: Vec<String> = table
                .entries
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.created_at) >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    table.entries.remove(&id).map(|p| {
                        let age = now.saturating_duration_since(p.created_at);
                        (id, p, age)
                    })
                })
                .collect()
        };

        let count = expired.len();
        for (id, pending, age) in expired {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            let _ = pending.sender.send(Err(TransportError::RequestExpired {
                id,
                age_ms: age.as_millis() as u64,
            }));
        }
        if count > 0 {
            self.shared
                .counters
                .expired
                .fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, max_age_ms = max_age.as_millis() as u64, "expired pending requests");
        }
        count
    }

    /// Tears the manager down: every pending request is rejected with
    /// [`TransportError::ConnectionClosed`] and later `track` calls fail fast.
    /// Returns how many were rejected; a second call returns 0.
    pub fn dispose_all(&self) -> usize {
        let drained: Vec<(String, Pending<T>)> = {
            let mut table = self.shared.lock();
            if table.disposed {
                return 0;
            }
            table.disposed = true;
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (_, pending) in drained {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            let _ = pending.sender.send(Err(TransportError::ConnectionClosed));
        }
        self.shared
            .counters
            .disposed
            .fetch_add(count as u64, Ordering::Relaxed);
        debug!(count, "correlation manager disposed");
        count
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.shared.lock().entries.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn stats(&self) -> CorrelationStats {
        let c = &self.shared.counters;
        CorrelationStats {
            tracked: c.tracked.load(Ordering::Relaxed),
            resolved: c.resolved.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            disposed: c.disposed.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            active: self.pending_count(),
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for CorrelationManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationManager")
            .field("pending", &self.pending_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
