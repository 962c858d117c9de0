//! Peer session state.
//!
//! One [`PeerSession`] exists per connected link.  The broker owns the
//! two cooperative tasks that drive it (inbound decoder, outbound
//! writer); this module holds the shared state both consult: identity,
//! the lifecycle state machine, activity stamps, counters, the outbound
//! queue handle, and the ExactlyOnce inbound dedup window.

use crate::dedup::RecentIds;
use crate::link::LinkMeta;
use crate::queue::OutboundQueue;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::debug;

/// Ids the ExactlyOnce receive-side dedup window remembers per session.
pub const RECENT_ID_WINDOW: usize = 4096;

// ---------------------------------------------------------------------------
// Kinds and states
// ---------------------------------------------------------------------------

/// What sits at the far end of the link.  Every peer starts as a client;
/// the first Registration converts it to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Client,
    Device,
}

/// Session lifecycle.  Transitions are driven by the broker:
///
/// ```text
/// Accepted → Authenticating → Authenticated → Live → Draining → Closed
/// ```
///
/// Any state can fall to Closed on an I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Authenticating,
    Authenticated,
    Live,
    Draining,
    Closed,
}

impl SessionState {
    pub fn is_authenticated(self) -> bool {
        matches!(
            self,
            SessionState::Authenticated | SessionState::Live | SessionState::Draining
        )
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Per-session delivery counters.  All atomic; read by status queries
/// without locking.
#[derive(Debug, Default)]
pub struct SessionCounters {
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    acknowledged: AtomicU64,
}

impl SessionCounters {
    pub fn note_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Shared state for one connected peer.
pub struct PeerSession {
    /// Current peer id: a server-assigned UUID for clients, re-keyed to
    /// the device id on Registration.
    id: RwLock<String>,
    kind: RwLock<PeerKind>,
    state: RwLock<SessionState>,
    /// Authenticated identity (username or token name), once known.
    identity: RwLock<Option<String>>,
    pub meta: LinkMeta,
    pub queue: Arc<OutboundQueue>,
    pub counters: Arc<SessionCounters>,
    connected_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    recent_inbound: Mutex<RecentIds>,
    /// Set true to stop both session tasks.
    close_tx: watch::Sender<bool>,
}

impl PeerSession {
    pub fn new(
        initial_id: String,
        meta: LinkMeta,
        queue: Arc<OutboundQueue>,
        counters: Arc<SessionCounters>,
    ) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(PeerSession {
            id: RwLock::new(initial_id),
            kind: RwLock::new(PeerKind::Client),
            state: RwLock::new(SessionState::Accepted),
            identity: RwLock::new(None),
            meta,
            queue,
            counters,
            connected_at: Utc::now(),
            last_activity: RwLock::new(Utc::now()),
            recent_inbound: Mutex::new(RecentIds::new(RECENT_ID_WINDOW)),
            close_tx,
        })
    }

    pub async fn id(&self) -> String {
        self.id.read().await.clone()
    }

    /// Re-key the session to its device id after Registration.
    pub async fn set_id(&self, id: String) {
        *self.id.write().await = id;
    }

    pub async fn kind(&self) -> PeerKind {
        *self.kind.read().await
    }

    pub async fn set_kind(&self, kind: PeerKind) {
        *self.kind.write().await = kind;
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: SessionState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!(from = ?*current, to = ?state, "session state change");
            *current = state;
        }
    }

    pub async fn identity(&self) -> Option<String> {
        self.identity.read().await.clone()
    }

    pub async fn set_identity(&self, identity: String) {
        *self.identity.write().await = Some(identity);
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().await
    }

    /// Stamp activity; called for every inbound frame.
    pub async fn touch(&self) {
        *self.last_activity.write().await = Utc::now();
    }

    /// ExactlyOnce receive-side dedup.  True if this id is new; false
    /// for a duplicate that must be dropped.
    pub async fn note_inbound_id(&self, message_id: &str) -> bool {
        self.recent_inbound.lock().await.insert(message_id)
    }

    /// Signal both session tasks to stop.
    pub fn request_close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}
