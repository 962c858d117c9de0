//! Per-session outbound queue: priority ordering, QoS delivery
//! semantics, exponential-backoff retry, expiry, and back-pressure.
//!
//! The session's writer drives the queue in a pull loop:
//!
//! 1. `next_due()` suspends until an entry is due (or the queue is
//!    closed and drained), handling ack timeouts internally;
//! 2. the writer attempts the frame write;
//! 3. `on_write_success` / `on_write_failure` advance the entry's
//!    lifecycle — destroy, move to pending-ack, or re-enqueue with
//!    backoff, per the envelope's QoS.
//!
//! Failures a sender could care about surface as [`QueueEvent::Failed`]
//! on the event channel; the router turns those into Error envelopes for
//! correlated commands.

use crate::config::{QueueConfig, RetryConfig};
use crate::session::SessionCounters;
use chrono::Utc;
use skybus_protocol::{error_codes, Envelope, Priority};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Why an enqueue was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is between its soft bound (Low priority refused) or at
    /// its hard bound (everything refused).
    Backpressure,
    /// The session is draining; no new entries are accepted.
    Closed,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::Backpressure => write!(f, "outbound queue is full"),
            EnqueueError::Closed => write!(f, "outbound queue is closed"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Delivery outcome surfaced to the broker.
#[derive(Debug)]
pub enum QueueEvent {
    /// The entry was destroyed without a successful acked delivery.
    /// `code` is a stable error code: `TIMEOUT` for retry/expiry
    /// exhaustion, `CANCELLED` for session teardown.
    Failed {
        envelope: Envelope,
        code: &'static str,
    },
    /// An AtMostOnce entry hit a write failure.  Nobody is owed an
    /// error, but correlation state must be cleaned up silently.
    Dropped { message_id: String },
}

/// One queued envelope plus its retry state.
#[derive(Debug)]
pub struct QueuedEntry {
    pub envelope: Envelope,
    /// Retries performed so far (0 for a fresh entry).
    pub attempts: u32,
    next_attempt: Instant,
    seq: u64,
}

// Max-heap order: highest priority first, then earliest due time, then
// enqueue order (FIFO within equal priority).
impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.envelope
            .priority
            .cmp(&other.envelope.priority)
            .then_with(|| other.next_attempt.cmp(&self.next_attempt))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedEntry {}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct PendingAck {
    envelope: Envelope,
    attempts: u32,
    deadline: Instant,
}

struct Inner {
    heap: BinaryHeap<QueuedEntry>,
    /// messageId → written entry awaiting a matching Response/Error.
    pending_ack: HashMap<String, PendingAck>,
    next_seq: u64,
    closed: bool,
}

/// Priority queue with QoS semantics for one peer session.
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    retry: RetryConfig,
    bounds: QueueConfig,
    events: mpsc::UnboundedSender<QueueEvent>,
    counters: Arc<SessionCounters>,
}

impl OutboundQueue {
    pub fn new(
        retry: RetryConfig,
        bounds: QueueConfig,
        counters: Arc<SessionCounters>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(OutboundQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                pending_ack: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            retry,
            bounds,
            events,
            counters,
        });
        (queue, events_rx)
    }

    /// Queue an envelope for delivery, subject to the back-pressure
    /// bounds.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), EnqueueError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(EnqueueError::Closed);
        }
        let depth = inner.heap.len();
        if depth >= self.bounds.hard_limit {
            return Err(EnqueueError::Backpressure);
        }
        if depth >= self.bounds.soft_limit && envelope.priority == Priority::Low {
            return Err(EnqueueError::Backpressure);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedEntry {
            envelope,
            attempts: 0,
            next_attempt: Instant::now(),
            seq,
        });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Record a matching ack for a written AtLeastOnce/ExactlyOnce entry.
    /// Returns false if no entry was waiting on this id.
    pub async fn acknowledge(&self, message_id: &str) -> bool {
        let removed = self.inner.lock().await.pending_ack.remove(message_id);
        match removed {
            Some(_) => {
                self.counters.note_acknowledged();
                trace!(message_id, "outbound entry acknowledged");
                self.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Suspend until an entry is due for writing.
    ///
    /// Returns `None` once the queue is closed and fully drained.  Ack
    /// timeouts are folded in here: a pending entry whose deadline passes
    /// is re-enqueued (or failed) before the next due entry is handed out.
    pub async fn next_due(&self) -> Option<QueuedEntry> {
        loop {
            let wake_at: Option<Instant>;
            {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();

                // Expired ack deadlines count as failed attempts.
                let overdue: Vec<String> = inner
                    .pending_ack
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in overdue {
                    if let Some(pending) = inner.pending_ack.remove(&id) {
                        debug!(message_id = %id, attempts = pending.attempts, "ack timed out");
                        self.retry_or_fail(&mut inner, pending.envelope, pending.attempts, now);
                    }
                }

                // Hand out the head while it is due, dropping expired
                // envelopes on the way.
                while inner.heap.peek().is_some_and(|e| e.next_attempt <= now) {
                    let entry = inner.heap.pop().expect("peeked entry");
                    if entry.envelope.is_expired(Utc::now()) {
                        self.counters.note_failed();
                        let _ = self.events.send(QueueEvent::Failed {
                            envelope: entry.envelope,
                            code: error_codes::TIMEOUT,
                        });
                        continue;
                    }
                    return Some(entry);
                }

                if inner.closed && inner.heap.is_empty() {
                    return None;
                }

                let head_due = inner.heap.peek().map(|e| e.next_attempt);
                let ack_due = inner.pending_ack.values().map(|p| p.deadline).min();
                wake_at = match (head_due, ack_due) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(b),
                    (None, None) => None,
                };
            }

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// The frame write succeeded.  AtMostOnce entries are done;
    /// ack-tracked entries move to the pending-ack map.
    pub async fn on_write_success(&self, entry: QueuedEntry) {
        self.counters.note_sent();
        if entry.envelope.qos.needs_ack() {
            let deadline = Instant::now() + self.backoff_delay(entry.attempts + 1);
            let mut inner = self.inner.lock().await;
            inner.pending_ack.insert(
                entry.envelope.message_id.clone(),
                PendingAck {
                    envelope: entry.envelope,
                    attempts: entry.attempts,
                    deadline,
                },
            );
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// The frame write failed.  AtMostOnce entries are destroyed and
    /// counted; ack-tracked entries retry with backoff.
    pub async fn on_write_failure(&self, entry: QueuedEntry) {
        if entry.envelope.qos.needs_ack() {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            self.retry_or_fail(&mut inner, entry.envelope, entry.attempts, now);
            drop(inner);
            self.notify.notify_one();
        } else {
            // Fire-and-forget: destroyed, no retry, no error to the
            // sender beyond the transport-level failure.
            self.counters.note_failed();
            let _ = self.events.send(QueueEvent::Dropped {
                message_id: entry.envelope.message_id.clone(),
            });
        }
    }

    /// Stop accepting new entries; `next_due` keeps handing out already
    /// queued entries until the heap is empty.
    pub async fn close_for_drain(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Destroy everything still queued or awaiting ack, surfacing each
    /// as a failure with `code`.
    pub async fn fail_remaining(&self, code: &'static str) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        let mut dropped = Vec::new();
        while let Some(entry) = inner.heap.pop() {
            dropped.push(entry.envelope);
        }
        dropped.extend(inner.pending_ack.drain().map(|(_, p)| p.envelope));
        drop(inner);
        for envelope in dropped {
            self.counters.note_failed();
            let _ = self.events.send(QueueEvent::Failed { envelope, code });
        }
        self.notify.notify_waiters();
    }

    pub async fn depth(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn has_pending_ack(&self, message_id: &str) -> bool {
        self.inner.lock().await.pending_ack.contains_key(message_id)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Schedule the next retry, or fail the entry once the attempt cap
    /// is exceeded.  Caller holds the inner lock.
    fn retry_or_fail(&self, inner: &mut Inner, envelope: Envelope, attempts: u32, now: Instant) {
        let attempts = attempts + 1;
        if attempts > self.retry.max_attempts {
            debug!(
                message_id = %envelope.message_id,
                attempts,
                "delivery abandoned after max attempts"
            );
            self.counters.note_failed();
            let _ = self.events.send(QueueEvent::Failed {
                envelope,
                code: error_codes::TIMEOUT,
            });
            return;
        }
        let delay = self.backoff_delay(attempts);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedEntry {
            envelope,
            attempts,
            next_attempt: now + delay,
            seq,
        });
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped, with ±jitter applied.
    fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.retry.base.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.retry.max);
        if self.retry.jitter == 0.0 {
            return capped;
        }
        let factor = 1.0 + self.retry.jitter * (2.0 * rand::random::<f64>() - 1.0);
        capped.mul_f64(factor.max(0.0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
