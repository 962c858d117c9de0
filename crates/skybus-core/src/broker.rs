//! The broker: sessions wired to the registry, router, subscription
//! manager, authenticator, and recovery supervisor.
//!
//! Each attached link gets one [`PeerSession`] and three tasks: the
//! inbound decoder, the outbound writer, and a small consumer for the
//! queue's delivery-failure events.  The decoder and writer never run
//! concurrently with themselves, so envelopes from one peer reach the
//! dispatch code in wire order and writes stay FIFO within a priority.
//!
//! Dispatch rules live in the `handle_*` methods; they mirror the
//! routing contract: commands look up presence, correlation is recorded
//! before the command is written, responses free the device's ack path
//! before the client sees them, and device errors take the recovery
//! detour in addition to normal delivery.

use crate::auth::{AuthOutcome, Authenticator};
use crate::config::BrokerConfig;
use crate::link::{BoxedSink, BoxedSource, IncomingLink, LinkError};
use crate::queue::{EnqueueError, OutboundQueue, QueueEvent};
use crate::recovery::{ErrorContext, RecoveryDecision, RecoverySupervisor};
use crate::registry::{DeviceRegistry, PresenceStore};
use crate::router::{PendingCommand, Router};
use crate::session::{PeerKind, PeerSession, SessionCounters, SessionState};
use crate::subscription::{SubscriptionKind, SubscriptionManager};
use chrono::Utc;
use serde_json::{json, Map, Value};
use skybus_protocol::{
    decode, encode, error_codes, Envelope, MessageType, Payload, Priority, QoS,
    DEVICE_FAILOVER_EVENT, ERROR_NOTICE_EVENT, PROPERTY_CHANGED_EVENT,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Broker-wide counters, all atomic.
#[derive(Debug, Default)]
pub struct BrokerCounters {
    commands_routed: AtomicU64,
    responses_forwarded: AtomicU64,
    events_fanned_out: AtomicU64,
    fanout_failures: AtomicU64,
    decode_failures: AtomicU64,
    duplicates_dropped: AtomicU64,
}

macro_rules! counter {
    ($note:ident, $get:ident) => {
        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }

        fn $note(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl BrokerCounters {
    counter!(note_command_routed, commands_routed);
    counter!(note_response_forwarded, responses_forwarded);
    counter!(note_event_fanned_out, events_fanned_out);
    counter!(note_fanout_failure, fanout_failures);
    counter!(note_decode_failure, decode_failures);
    counter!(note_duplicate_dropped, duplicates_dropped);
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

struct BrokerCore {
    cfg: BrokerConfig,
    registry: DeviceRegistry,
    subscriptions: SubscriptionManager,
    router: Arc<Router>,
    auth: Authenticator,
    recovery: RecoverySupervisor,
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    store: Option<Arc<dyn PresenceStore>>,
    counters: BrokerCounters,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A single-process device control and telemetry broker.
///
/// Transports call [`Broker::attach_link`] for every accepted peer; the
/// broker runs the session from there.  Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    core: Arc<BrokerCore>,
}

impl Broker {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self::build(cfg, None)
    }

    /// Broker with a persistence collaborator for registry snapshots.
    pub fn with_store(cfg: BrokerConfig, store: Arc<dyn PresenceStore>) -> Self {
        Self::build(cfg, Some(store))
    }

    fn build(cfg: BrokerConfig, store: Option<Arc<dyn PresenceStore>>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let auth = Authenticator::new(&cfg.auth);
        let router = Router::new(Duration::from_millis(cfg.pending_response_timeout_ms));
        let recovery = RecoverySupervisor::new(cfg.retry.max_attempts);
        Broker {
            core: Arc::new(BrokerCore {
                cfg,
                registry: DeviceRegistry::new(),
                subscriptions: SubscriptionManager::new(),
                router,
                auth,
                recovery,
                sessions: RwLock::new(HashMap::new()),
                store,
                counters: BrokerCounters::default(),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Restore persisted state and spawn the background tasks (deadline
    /// wheel, heartbeats, idle sweep, autosave).  Idempotent per broker.
    pub async fn start(&self) {
        let core = &self.core;
        if let Some(store) = &core.store {
            match store.load().await {
                Ok(Some(snapshot)) => core.registry.load_snapshot(snapshot).await,
                Ok(None) => debug!("no presence snapshot to restore"),
                Err(e) => warn!(error = %e, "failed to load presence snapshot"),
            }
        }

        let mut tasks = core.tasks.lock().await;

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        tasks.push(tokio::spawn(core.router.clone().run_deadline_wheel(
            expired_tx,
            core.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(run_expiry_consumer(
            core.clone(),
            expired_rx,
        )));
        tasks.push(tokio::spawn(run_heartbeat(core.clone())));
        tasks.push(tokio::spawn(run_idle_sweep(core.clone())));
        if core.store.is_some() {
            tasks.push(tokio::spawn(run_autosave(core.clone())));
        }
        info!("broker started");
    }

    /// Stop every session (draining outbound queues up to the grace
    /// deadline) and the background tasks.
    pub async fn stop(&self) {
        let _ = self.core.shutdown_tx.send(true);
        let grace = Duration::from_secs(self.core.cfg.drain_grace_secs) + Duration::from_secs(1);
        let handles: Vec<JoinHandle<()>> = self.core.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                // Writer exceeded the drain grace; it is aborted.
            }
        }
        info!("broker stopped");
    }

    /// Accept one framed link and run a peer session over it.  Returns
    /// the initial peer id (a UUID; re-keyed to the device id if the
    /// peer registers as a device).
    pub async fn attach_link(&self, link: IncomingLink) -> String {
        let core = self.core.clone();
        let peer_id = Uuid::new_v4().to_string();
        let counters = Arc::new(SessionCounters::default());
        let (queue, queue_events) =
            OutboundQueue::new(core.cfg.retry, core.cfg.queue, counters.clone());
        let session = PeerSession::new(peer_id.clone(), link.meta.clone(), queue, counters);

        let IncomingLink { meta, source, mut sink } = link;

        if !core.cfg.auth.enabled {
            session.set_state(SessionState::Authenticated).await;
        } else if let Some(creds) = &meta.handshake_credentials {
            // Transport carried credentials in its connect handshake;
            // authenticate before the session joins the live set.
            session.set_state(SessionState::Authenticating).await;
            let hint = peer_hint(&session);
            match core
                .auth
                .authenticate(creds.method, &creds.credentials, &hint)
                .await
            {
                AuthOutcome::Ok(identity) => {
                    session.set_identity(identity).await;
                    session.set_state(SessionState::Authenticated).await;
                }
                outcome => {
                    let (code, reason) = denial(&outcome);
                    let err = Envelope::error(code, reason);
                    let _ = sink.send(&encode(&err)).await;
                    sink.close().await;
                    warn!(peer = %hint, code, "handshake authentication failed");
                    return peer_id;
                }
            }
        } else {
            session.set_state(SessionState::Authenticating).await;
            spawn_auth_watchdog(core.clone(), session.clone());
        }

        core.sessions
            .write()
            .await
            .insert(peer_id.clone(), session.clone());
        info!(peer_id = %peer_id, transport = %meta.kind, "peer attached");

        let mut tasks = core.tasks.lock().await;
        tasks.push(tokio::spawn(run_inbound(
            core.clone(),
            session.clone(),
            source,
        )));
        tasks.push(tokio::spawn(run_writer(core.clone(), session.clone(), sink)));
        tasks.push(tokio::spawn(run_queue_events(
            core.clone(),
            queue_events,
        )));
        peer_id
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &BrokerConfig {
        &self.core.cfg
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.core.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.core.subscriptions
    }

    pub fn recovery(&self) -> &RecoverySupervisor {
        &self.core.recovery
    }

    pub fn counters(&self) -> &BrokerCounters {
        &self.core.counters
    }

    pub fn router(&self) -> &Router {
        &self.core.router
    }

    pub async fn session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.core.sessions.read().await.get(peer_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.core.sessions.read().await.len()
    }
}

fn peer_hint(session: &PeerSession) -> String {
    session
        .meta
        .remote
        .clone()
        .unwrap_or_else(|| session.meta.kind.as_str().to_owned())
}

fn denial(outcome: &AuthOutcome) -> (&'static str, &'static str) {
    match outcome {
        AuthOutcome::RateLimited => (
            error_codes::RATE_LIMITED,
            "too many failed authentication attempts",
        ),
        _ => (error_codes::UNAUTHENTICATED, "authentication failed"),
    }
}

// ---------------------------------------------------------------------------
// Session tasks
// ---------------------------------------------------------------------------

/// Inbound decoder: frames → envelopes → dispatch, strictly in wire
/// order.  Exits on transport failure, session close, or broker stop.
async fn run_inbound(core: Arc<BrokerCore>, session: Arc<PeerSession>, mut source: BoxedSource) {
    let mut shutdown = core.shutdown_tx.subscribe();
    let mut closed = session.close_signal();
    let mut decode_failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = closed.changed() => {
                if *closed.borrow() { break; }
            }
            frame = source.recv() => match frame {
                Ok(Some(bytes)) => {
                    session.touch().await;
                    session.counters.note_received();
                    match decode(&bytes) {
                        Ok(envelope) => {
                            decode_failures = 0;
                            core.handle_envelope(&session, envelope).await;
                        }
                        Err(e) => {
                            decode_failures += 1;
                            core.counters.note_decode_failure();
                            warn!(error = %e, "undecodable frame");
                            let reply = Envelope::error(error_codes::INVALID_ENVELOPE, e.to_string());
                            let _ = session.queue.enqueue(reply).await;
                            if decode_failures >= core.cfg.max_decode_failures {
                                warn!("too many consecutive decode failures, closing session");
                                break;
                            }
                        }
                    }
                }
                Ok(None) => break,
                // A quiet link is not a dead link; the idle sweeper
                // owns the idle-session policy.
                Err(LinkError::Timeout) => {}
                Err(e) => {
                    if !e.is_fatal() {
                        warn!(error = %e, "inbound transport error");
                    }
                    break;
                }
            }
        }
    }

    core.detach_session(&session).await;
}

/// Outbound writer: pulls due entries off the queue and writes frames.
/// On broker shutdown it drains the backlog up to the grace deadline;
/// whatever remains afterwards is failed with `CANCELLED`.
async fn run_writer(core: Arc<BrokerCore>, session: Arc<PeerSession>, mut sink: BoxedSink) {
    let mut shutdown = core.shutdown_tx.subscribe();
    let mut closed = session.close_signal();
    let queue = session.queue.clone();
    let grace = Duration::from_secs(core.cfg.drain_grace_secs);
    let mut drain_deadline: Option<Instant> = None;

    'outer: loop {
        if let Some(deadline) = drain_deadline {
            match tokio::time::timeout_at(deadline, queue.next_due()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(entry)) => {
                    if write_one(&mut sink, &queue, entry).await {
                        break 'outer;
                    }
                }
            }
        } else {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        session.set_state(SessionState::Draining).await;
                        queue.close_for_drain().await;
                        drain_deadline = Some(Instant::now() + grace);
                    }
                }
                _ = closed.changed() => {
                    if *closed.borrow() { break; }
                }
                due = queue.next_due() => match due {
                    None => break,
                    Some(entry) => {
                        if write_one(&mut sink, &queue, entry).await {
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    queue.fail_remaining(error_codes::CANCELLED).await;
    sink.close().await;
    // Writer is gone; nothing useful can arrive either.
    session.request_close();
}

/// Write one entry.  Returns true when the sink is dead.
async fn write_one(
    sink: &mut BoxedSink,
    queue: &Arc<OutboundQueue>,
    entry: crate::queue::QueuedEntry,
) -> bool {
    let frame = encode(&entry.envelope);
    match sink.send(&frame).await {
        Ok(()) => {
            queue.on_write_success(entry).await;
            false
        }
        Err(e) => {
            let fatal = e.is_fatal();
            debug!(error = %e, fatal, "frame write failed");
            queue.on_write_failure(entry).await;
            fatal
        }
    }
}

/// Delivery failures become Error envelopes for whoever is still
/// waiting on the correlated command.
async fn run_queue_events(
    core: Arc<BrokerCore>,
    mut events: mpsc::UnboundedReceiver<QueueEvent>,
) {
    let mut shutdown = core.shutdown_tx.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            QueueEvent::Failed { envelope, code } => {
                if let Some(pending) = core.router.resolve(&envelope.message_id).await {
                    let err = Envelope::error_to(&envelope, code, "delivery failed");
                    core.enqueue_to_peer(&pending.client_peer_id, err).await;
                }
            }
            // AtMostOnce write failure: clean the correlation, tell
            // nobody.
            QueueEvent::Dropped { message_id } => {
                let _ = core.router.resolve(&message_id).await;
            }
        }
    }
}

/// Pending-response deadline expiries become synthetic TIMEOUT errors.
async fn run_expiry_consumer(
    core: Arc<BrokerCore>,
    mut expired: mpsc::UnboundedReceiver<PendingCommand>,
) {
    while let Some(pending) = expired.recv().await {
        let err = Envelope::error_to(
            &pending.command,
            error_codes::TIMEOUT,
            "no response before the deadline",
        );
        core.enqueue_to_peer(&pending.client_peer_id, err).await;
    }
}

/// Close sessions that never finish authenticating.
fn spawn_auth_watchdog(core: Arc<BrokerCore>, session: Arc<PeerSession>) {
    let timeout = Duration::from_secs(core.cfg.auth_handshake_timeout_secs);
    tokio::spawn(async move {
        let mut closed = session.close_signal();
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if !session.state().await.is_authenticated() {
                    warn!("authentication handshake timed out");
                    session.request_close();
                }
            }
            _ = closed.changed() => {}
        }
    });
}

async fn run_heartbeat(core: Arc<BrokerCore>) {
    if core.cfg.heartbeat_interval_secs == 0 {
        return;
    }
    let mut shutdown = core.shutdown_tx.subscribe();
    let mut ticker =
        tokio::time::interval(Duration::from_secs(core.cfg.heartbeat_interval_secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            _ = ticker.tick() => {
                let sessions: Vec<Arc<PeerSession>> =
                    core.sessions.read().await.values().cloned().collect();
                for session in sessions {
                    if session.state().await.is_authenticated() {
                        let ping = Envelope::event("", "heartbeat").with_priority(Priority::Low);
                        let _ = session.queue.enqueue(ping).await;
                    }
                }
            }
        }
    }
}

async fn run_idle_sweep(core: Arc<BrokerCore>) {
    if core.cfg.session_timeout_minutes == 0 {
        return;
    }
    let idle_limit = chrono::Duration::minutes(core.cfg.session_timeout_minutes as i64);
    let mut shutdown = core.shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            _ = ticker.tick() => {
                let now = Utc::now();
                let sessions: Vec<Arc<PeerSession>> =
                    core.sessions.read().await.values().cloned().collect();
                for session in sessions {
                    if session.state().await.is_authenticated()
                        && now - session.last_activity().await > idle_limit
                    {
                        let peer_id = session.id().await;
                        info!(peer_id = %peer_id, "closing idle session");
                        session.request_close();
                    }
                }
            }
        }
    }
}

/// Debounced registry snapshots to the persistence collaborator.
async fn run_autosave(core: Arc<BrokerCore>) {
    let Some(store) = core.store.clone() else {
        return;
    };
    let debounce = Duration::from_secs(core.cfg.autosave_interval_secs.max(1));
    let mut dirty = core.registry.subscribe_dirty();
    let mut shutdown = core.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let snapshot = core.registry.snapshot().await;
                    if let Err(e) = store.save(&snapshot).await {
                        warn!(error = %e, "final presence save failed");
                    }
                    break;
                }
            }
            changed = dirty.changed() => {
                if changed.is_err() { break; }
                tokio::time::sleep(debounce).await;
                dirty.borrow_and_update();
                let snapshot = core.registry.snapshot().await;
                match store.save(&snapshot).await {
                    Ok(()) => debug!(devices = snapshot.devices.len(), "presence snapshot saved"),
                    Err(e) => warn!(error = %e, "presence save failed"),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl BrokerCore {
    async fn handle_envelope(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        match session.state().await {
            SessionState::Closed | SessionState::Draining => return,
            SessionState::Accepted | SessionState::Authenticating => {
                self.handle_preauth(session, envelope).await;
                return;
            }
            SessionState::Authenticated => {
                // Clients become Live implicitly with their first
                // post-auth envelope; devices on Registration below.
                session.set_state(SessionState::Live).await;
            }
            SessionState::Live => {}
        }

        if envelope.qos == QoS::ExactlyOnce
            && !session.note_inbound_id(&envelope.message_id).await
        {
            self.counters.note_duplicate_dropped();
            debug!(message_id = %envelope.message_id, "duplicate ExactlyOnce delivery dropped");
            return;
        }

        match envelope.message_type() {
            MessageType::Authentication => {
                // Already authenticated; answer idempotently.
                let reply = Envelope::response_to(&envelope, "OK");
                self.enqueue_to_session(session, reply).await;
            }
            MessageType::Registration => self.handle_registration(session, envelope).await,
            MessageType::Command => self.handle_command(session, envelope).await,
            MessageType::Response => self.handle_response(session, envelope).await,
            MessageType::Error => self.handle_device_error(session, envelope).await,
            MessageType::Event => self.handle_event(session, envelope).await,
            MessageType::DiscoveryRequest => self.handle_discovery(session, envelope).await,
            MessageType::DiscoveryResponse => {
                debug!("ignoring unsolicited DiscoveryResponse");
            }
        }
    }

    /// Before authentication only an Authentication envelope is
    /// acceptable; anything else is answered and the session closed.
    async fn handle_preauth(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        session.set_state(SessionState::Authenticating).await;
        let Payload::Authentication(auth) = &envelope.payload else {
            let err = Envelope::error_to(
                &envelope,
                error_codes::UNAUTHENTICATED,
                "authentication required before any other message",
            );
            self.reply_and_close(session, err).await;
            return;
        };

        let hint = peer_hint(session);
        match self
            .auth
            .authenticate(auth.method, &auth.credentials, &hint)
            .await
        {
            AuthOutcome::Ok(identity) => {
                info!(peer = %hint, identity = %identity, "peer authenticated");
                session.set_identity(identity).await;
                session.set_state(SessionState::Authenticated).await;
                let reply = Envelope::response_to(&envelope, "OK");
                self.enqueue_to_session(session, reply).await;
            }
            outcome => {
                let (code, reason) = denial(&outcome);
                let err = Envelope::error_to(&envelope, code, reason);
                self.reply_and_close(session, err).await;
            }
        }
    }

    async fn handle_registration(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        let Payload::Registration(reg) = &envelope.payload else {
            return;
        };
        let device_info = reg.device_info.clone();
        let device_id = device_info.id.clone();

        if !self.registry.register(device_info.clone()).await {
            // Later registration wins only if the earlier session is
            // Closed (or gone entirely).
            let earlier = self.sessions.read().await.get(&device_id).cloned();
            let earlier_alive = match earlier {
                // The same session refreshing its own registration is
                // an update, not a conflict.
                Some(ref s) if Arc::ptr_eq(s, session) => false,
                Some(s) => s.state().await != SessionState::Closed,
                None => false,
            };
            if earlier_alive {
                warn!(device_id = %device_id, "duplicate registration rejected");
                let err = Envelope::error_to(
                    &envelope,
                    error_codes::DUPLICATE_REGISTRATION,
                    "a session for this device is already active",
                );
                self.enqueue_to_session(session, err).await;
                return;
            }
            self.registry.force_register(device_info).await;
        }

        // Re-key the session from its provisional UUID to the device id.
        let old_id = session.id().await;
        if old_id != device_id {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&old_id);
            sessions.insert(device_id.clone(), session.clone());
            drop(sessions);
            session.set_id(device_id.clone()).await;
        }
        session.set_kind(PeerKind::Device).await;
        session.set_state(SessionState::Live).await;
        info!(device_id = %device_id, transport = %session.meta.kind, "device session live");

        let reply = Envelope::response_to(&envelope, "OK");
        self.enqueue_to_session(session, reply).await;
    }

    async fn handle_command(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        let Payload::Command(cmd) = &envelope.payload else {
            return;
        };
        let target = envelope.device_id.clone().unwrap_or_default();
        if target.is_empty() {
            self.handle_broker_command(session, &envelope, &cmd.command.clone())
                .await;
            return;
        }

        if self.cfg.enable_command_filtering && !self.cfg.allowed_commands.contains(&cmd.command)
        {
            let err = Envelope::error_to(
                &envelope,
                error_codes::UNSUPPORTED_COMMAND,
                format!("command '{}' is not allowed", cmd.command),
            );
            self.enqueue_to_session(session, err).await;
            return;
        }

        if !self.registry.is_connected(&target).await {
            let err = Envelope::error_to(
                &envelope,
                error_codes::DEVICE_UNAVAILABLE,
                format!("device '{}' is not connected", target),
            );
            self.enqueue_to_session(session, err).await;
            return;
        }

        let device_session = self.sessions.read().await.get(&target).cloned();
        let Some(device_session) = device_session else {
            // Registry said connected but the session is gone; heal the
            // record and answer as unavailable.
            self.registry.set_connected(&target, false).await;
            let err = Envelope::error_to(
                &envelope,
                error_codes::DEVICE_UNAVAILABLE,
                format!("device '{}' is not connected", target),
            );
            self.enqueue_to_session(session, err).await;
            return;
        };

        // Correlation is recorded before the write so the response can
        // never outrun it.
        let sender_id = session.id().await;
        self.router.register_pending(&sender_id, &envelope).await;
        self.counters.note_command_routed();

        if let Err(e) = device_session.queue.enqueue(envelope.clone()).await {
            let _ = self.router.resolve(&envelope.message_id).await;
            let code = match e {
                EnqueueError::Backpressure => error_codes::BACKPRESSURE,
                EnqueueError::Closed => error_codes::DEVICE_UNAVAILABLE,
            };
            let err = Envelope::error_to(&envelope, code, "command could not be queued");
            self.enqueue_to_session(session, err).await;
        }
    }

    /// Commands with an empty device id address the broker itself:
    /// `ping` and the subscribe/unsubscribe surface.
    async fn handle_broker_command(
        &self,
        session: &Arc<PeerSession>,
        envelope: &Envelope,
        command: &str,
    ) {
        let Payload::Command(cmd) = &envelope.payload else {
            return;
        };
        let subscriber = session.id().await;

        let reply = match command {
            "ping" => Envelope::response_to(envelope, "OK"),
            "subscribe_property" | "unsubscribe_property" | "subscribe_event"
            | "unsubscribe_event" => {
                let kind = if command.ends_with("_property") {
                    SubscriptionKind::Property
                } else {
                    SubscriptionKind::Event
                };
                let name_key = match kind {
                    SubscriptionKind::Property => "property",
                    SubscriptionKind::Event => "event",
                };
                match (
                    param_str(&cmd.parameters, "device"),
                    param_str(&cmd.parameters, name_key),
                ) {
                    (Some(device), Some(name)) => {
                        if command.starts_with("subscribe") {
                            self.subscriptions
                                .subscribe(&subscriber, &device, kind, &name)
                                .await;
                        } else {
                            self.subscriptions
                                .unsubscribe(&subscriber, &device, kind, &name)
                                .await;
                        }
                        Envelope::response_to(envelope, "OK")
                    }
                    _ => Envelope::error_to(
                        envelope,
                        error_codes::INVALID_ENVELOPE,
                        format!("'{}' requires 'device' and '{}' parameters", command, name_key),
                    ),
                }
            }
            other => Envelope::error_to(
                envelope,
                error_codes::UNSUPPORTED_COMMAND,
                format!("unknown broker command '{}'", other),
            ),
        };
        self.enqueue_to_session(session, reply).await;
    }

    async fn handle_response(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        let Payload::Response(resp) = &envelope.payload else {
            return;
        };

        // 1. Free the device-side ack path first; the client must never
        //    see the response while the command still counts as
        //    unacknowledged.
        if let Some(original) = &envelope.original_message_id {
            session.queue.acknowledge(original).await;
        }

        // 2. Property-change detection against the registry cache.
        if session.kind().await == PeerKind::Device {
            if let Some(properties) = resp.properties.clone() {
                let device_id = session.id().await;
                self.apply_property_changes(&device_id, &envelope, properties)
                    .await;
            }
        }

        // 3. Correlate back to the originating client.
        match &envelope.original_message_id {
            Some(original) => match self.router.resolve(original).await {
                Some(pending) => {
                    self.recovery.note_resolved(original).await;
                    self.counters.note_response_forwarded();
                    self.enqueue_to_peer(&pending.client_peer_id, envelope.clone())
                        .await;
                }
                None => self.router.note_uncorrelated_drop(),
            },
            None => self.router.note_uncorrelated_drop(),
        }
    }

    /// Diff `properties` against the cache and fan out one
    /// `property_changed` event per observed transition.
    async fn apply_property_changes(
        &self,
        device_id: &str,
        source: &Envelope,
        properties: Map<String, Value>,
    ) {
        for (name, value) in properties {
            let old = match self
                .registry
                .set_property(device_id, &name, value.clone())
                .await
            {
                Ok(old) => old,
                Err(_) => return,
            };
            // A transition needs a prior value: the first observation
            // of a property seeds the cache without an event.
            let changed = match &old {
                Some(previous) => *previous != value,
                None => false,
            };
            if !changed {
                continue;
            }
            let mut event = Envelope::event(device_id, PROPERTY_CHANGED_EVENT)
                .with_priority(source.priority);
            if let Payload::Event(ev) = &mut event.payload {
                ev.details = Some(json!({
                    "property": name,
                    "value": value,
                    "previous": old,
                }));
                ev.related_message_id = Some(source.message_id.clone());
            }
            self.fan_out(&event).await;
        }
    }

    /// Device-reported errors: ack, forward to the originator, then the
    /// recovery detour.
    async fn handle_device_error(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        let Payload::Error(err) = &envelope.payload else {
            return;
        };
        let sender_id = session.id().await;
        let device_id = envelope
            .device_id
            .clone()
            .unwrap_or_else(|| sender_id.clone());

        if let Some(original) = &envelope.original_message_id {
            session.queue.acknowledge(original).await;
        }

        let pending = match &envelope.original_message_id {
            Some(original) => self.router.resolve(original).await,
            None => None,
        };
        match &pending {
            Some(p) => {
                self.enqueue_to_peer(&p.client_peer_id, envelope.clone())
                    .await;
            }
            None if envelope.original_message_id.is_some() => {
                self.router.note_uncorrelated_drop();
            }
            None => {}
        }

        if session.kind().await != PeerKind::Device {
            return;
        }

        let ctx = ErrorContext {
            device_id: device_id.clone(),
            error_code: err.error_code.clone(),
            error_message: err.error_message.clone(),
            command: pending.as_ref().map(|p| p.command.clone()),
            attempts: 0,
            occurred_at: Utc::now(),
        };
        match self.recovery.handle_error(&ctx).await {
            RecoveryDecision::Recorded { .. } => {}
            RecoveryDecision::Resend(command) => {
                if let Some(p) = &pending {
                    self.router.rearm(&p.client_peer_id, &command).await;
                }
                debug!(device_id = %device_id, command = %command.message_id, "retrying failed command");
                let _ = session.queue.enqueue(command).await;
            }
            RecoveryDecision::Notify => {
                let mut notice = Envelope::event(&device_id, ERROR_NOTICE_EVENT);
                if let Payload::Event(ev) = &mut notice.payload {
                    ev.details = Some(json!({
                        "errorCode": err.error_code,
                        "errorMessage": err.error_message,
                    }));
                }
                self.fan_out(&notice).await;
            }
            RecoveryDecision::Restart => {
                let reset = Envelope::command(&device_id, "reset", Map::new());
                let _ = session.queue.enqueue(reset).await;
            }
            RecoveryDecision::Failover => {
                self.registry.set_connected(&device_id, false).await;
                let mut failover = Envelope::event(&device_id, DEVICE_FAILOVER_EVENT);
                if let Payload::Event(ev) = &mut failover.payload {
                    ev.details = Some(json!({ "errorCode": err.error_code }));
                }
                self.fan_out(&failover).await;
            }
        }
    }

    async fn handle_event(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        let device_id = match &envelope.device_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => session.id().await,
        };
        self.registry.touch(&device_id).await;
        self.fan_out(&envelope).await;
    }

    async fn handle_discovery(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        let Payload::DiscoveryRequest(req) = &envelope.payload else {
            return;
        };
        let devices = self.registry.list(&req.device_types).await;
        let reply = Envelope::discovery_response(&envelope, devices);
        self.enqueue_to_session(session, reply).await;
    }

    /// Deliver one event envelope to every matching subscriber.  A
    /// failure for one subscriber never affects the others.
    async fn fan_out(&self, envelope: &Envelope) {
        let Payload::Event(ev) = &envelope.payload else {
            return;
        };
        let device_id = envelope.device_id.as_deref().unwrap_or_default();
        let (kind, name) = if ev.event == PROPERTY_CHANGED_EVENT {
            let property = ev
                .details
                .as_ref()
                .and_then(|d| d.get("property"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            (SubscriptionKind::Property, property)
        } else {
            (SubscriptionKind::Event, ev.event.clone())
        };

        let subscribers = self
            .subscriptions
            .subscribers_of(device_id, kind, &name)
            .await;
        for subscriber in subscribers {
            let target = self.sessions.read().await.get(&subscriber).cloned();
            match target {
                Some(target_session) => {
                    match target_session.queue.enqueue(envelope.clone()).await {
                        Ok(()) => self.counters.note_event_fanned_out(),
                        Err(e) => {
                            debug!(subscriber = %subscriber, error = %e, "fan-out delivery failed");
                            self.counters.note_fanout_failure();
                            target_session.counters.note_failed();
                        }
                    }
                }
                None => self.counters.note_fanout_failure(),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn enqueue_to_session(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        if let Err(e) = session.queue.enqueue(envelope).await {
            debug!(error = %e, "reply could not be queued");
            session.counters.note_failed();
        }
    }

    async fn enqueue_to_peer(&self, peer_id: &str, envelope: Envelope) {
        let target = self.sessions.read().await.get(peer_id).cloned();
        match target {
            Some(session) => self.enqueue_to_session(&session, envelope).await,
            None => debug!(peer_id, "delivery target is gone"),
        }
    }

    /// Queue a final envelope, then let the writer flush and shut the
    /// session down.
    async fn reply_and_close(&self, session: &Arc<PeerSession>, envelope: Envelope) {
        self.enqueue_to_session(session, envelope).await;
        session.queue.close_for_drain().await;
    }

    /// Tear down one session's footprint: live set, presence,
    /// subscriptions, correlations, queued messages.
    async fn detach_session(&self, session: &Arc<PeerSession>) {
        let id = session.id().await;
        let was_closed = session.state().await == SessionState::Closed;
        session.set_state(SessionState::Closed).await;

        let is_current = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&id) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(&id);
                    true
                }
                _ => false,
            }
        };

        if is_current {
            if session.kind().await == PeerKind::Device {
                self.registry.set_connected(&id, false).await;
            }
            self.subscriptions.clear_for(&id).await;
            self.router.forget_client(&id).await;
        }
        session.queue.fail_remaining(error_codes::CANCELLED).await;
        session.request_close();
        if !was_closed {
            info!(peer_id = %id, "session closed");
        }
    }
}

fn param_str(parameters: &Map<String, Value>, key: &str) -> Option<String> {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}
