//! Command/response correlation.
//!
//! The router's pending-response table maps an in-flight Command's
//! `messageId` to the originating client and a deadline.  The deadline
//! wheel runs on its own task and emits expired correlations so the
//! broker can synthesize `TIMEOUT` errors back to the client.
//!
//! Responses with no live correlation (the client timed out or left)
//! are dropped with a counter bump, never forwarded.

use skybus_protocol::Envelope;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

/// One in-flight Command awaiting its Response/Error.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub client_peer_id: String,
    /// Copy of the command, kept for retry strategies and timeout
    /// error synthesis.
    pub command: Envelope,
    pub deadline: Instant,
}

/// Correlation table plus deadline wheel.
pub struct Router {
    pending: Mutex<HashMap<String, PendingCommand>>,
    deadlines: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    notify: Notify,
    timeout: Duration,
    uncorrelated_drops: AtomicU64,
}

impl Router {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Router {
            pending: Mutex::new(HashMap::new()),
            deadlines: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            timeout,
            uncorrelated_drops: AtomicU64::new(0),
        })
    }

    /// Record an in-flight command before it is written to the device,
    /// so the response can never race its own correlation.
    pub async fn register_pending(&self, client_peer_id: &str, command: &Envelope) {
        let deadline = Instant::now() + self.timeout;
        let message_id = command.message_id.clone();
        self.pending.lock().await.insert(
            message_id.clone(),
            PendingCommand {
                client_peer_id: client_peer_id.to_owned(),
                command: command.clone(),
                deadline,
            },
        );
        self.deadlines
            .lock()
            .await
            .push(Reverse((deadline, message_id)));
        self.notify.notify_one();
    }

    /// Claim the correlation for `original_message_id`, if still live.
    pub async fn resolve(&self, original_message_id: &str) -> Option<PendingCommand> {
        let resolved = self.pending.lock().await.remove(original_message_id);
        if resolved.is_some() {
            trace!(message_id = original_message_id, "correlation resolved");
        }
        resolved
    }

    /// Re-arm a correlation for a supervisor-driven command retry.
    pub async fn rearm(&self, client_peer_id: &str, command: &Envelope) {
        self.register_pending(client_peer_id, command).await;
    }

    /// Count a Response/Error whose originator is already gone.
    pub fn note_uncorrelated_drop(&self) {
        self.uncorrelated_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uncorrelated_drops(&self) -> u64 {
        self.uncorrelated_drops.load(Ordering::Relaxed)
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Drop all pending correlations originated by one client (it
    /// disconnected; nobody is left to answer).
    pub async fn forget_client(&self, client_peer_id: &str) {
        self.pending
            .lock()
            .await
            .retain(|_, p| p.client_peer_id != client_peer_id);
    }

    /// Deadline wheel: emits each expired [`PendingCommand`] exactly
    /// once on `expired_tx`.  Runs until `shutdown` flips.
    pub async fn run_deadline_wheel(
        self: Arc<Self>,
        expired_tx: mpsc::UnboundedSender<PendingCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next: Option<Instant> = {
                let mut deadlines = self.deadlines.lock().await;
                let mut pending = self.pending.lock().await;
                let now = Instant::now();
                // Pop everything due; stale entries (already resolved)
                // are skipped silently.
                while deadlines
                    .peek()
                    .is_some_and(|Reverse((at, _))| *at <= now)
                {
                    let Some(Reverse((_, message_id))) = deadlines.pop() else {
                        break;
                    };
                    if let Some(expired) = pending.remove(&message_id) {
                        debug!(message_id = %message_id, "pending response timed out");
                        let _ = expired_tx.send(expired);
                    }
                }
                deadlines.peek().map(|Reverse((at, _))| *at)
            };

            match next {
                Some(at) => {
                    tokio::select! {
                        _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn command(device: &str) -> Envelope {
        Envelope::command(device, "goto", serde_json::Map::new())
    }

    #[tokio::test]
    async fn resolve_claims_each_correlation_once() {
        let router = Router::new(Duration::from_secs(10));
        let cmd = command("scope-1");
        router.register_pending("client-1", &cmd).await;

        let pending = router.resolve(&cmd.message_id).await.expect("resolved");
        assert_eq!(pending.client_peer_id, "client-1");
        assert!(router.resolve(&cmd.message_id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_correlations_are_emitted_once() {
        let router = Router::new(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wheel = tokio::spawn(router.clone().run_deadline_wheel(tx, shutdown_rx));

        let cmd = command("scope-1");
        router.register_pending("client-1", &cmd).await;

        let expired = rx.recv().await.expect("expiry");
        assert_eq!(expired.command.message_id, cmd.message_id);
        assert_eq!(router.pending_len().await, 0);

        let _ = shutdown_tx.send(true);
        let _ = wheel.await;
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_commands_do_not_expire() {
        let router = Router::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wheel = tokio::spawn(router.clone().run_deadline_wheel(tx, shutdown_rx));

        let cmd = command("scope-1");
        router.register_pending("client-1", &cmd).await;
        router.resolve(&cmd.message_id).await.expect("resolved");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "no expiry for a resolved command");

        let _ = shutdown_tx.send(true);
        let _ = wheel.await;
    }

    #[tokio::test]
    async fn forget_client_drops_its_correlations() {
        let router = Router::new(Duration::from_secs(10));
        router.register_pending("client-1", &command("a")).await;
        router.register_pending("client-2", &command("b")).await;

        router.forget_client("client-1").await;
        assert_eq!(router.pending_len().await, 1);
    }
}
