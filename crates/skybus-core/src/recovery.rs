//! Strategies applied to device-reported errors.
//!
//! The supervisor is a pure decision component: given an error context
//! it looks up the applicable strategy — `(device, code)` first, then
//! `code`, then the default — and returns a decision.  The broker
//! executes the decision (re-enqueue, fan out a notice, send a reset,
//! flip presence); keeping I/O out of here makes every strategy testable
//! in isolation.
//!
//! Outcomes append to a bounded history callers can query.

use chrono::{DateTime, Utc};
use skybus_protocol::Envelope;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Default bound on the outcome history.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// Strategies and context
// ---------------------------------------------------------------------------

/// Selectable behavior for a class of device errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Record only.
    Ignore,
    /// Re-enqueue the failing command, up to the configured cap.
    Retry,
    /// Emit an `error_notice` event to the device's subscribers.
    Notify,
    /// Send a `reset` command to the device.
    RestartDevice,
    /// Mark the device disconnected and emit `device_failover`.
    Failover,
    /// Invoke the registered handler; its return value decides whether
    /// the error counts as resolved.
    Custom,
}

/// Handler for [`RecoveryStrategy::Custom`].  Returns true when the
/// error is considered resolved.
pub type CustomHandler = Arc<dyn Fn(&ErrorContext) -> bool + Send + Sync>;

/// Everything known about one device-reported error.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub device_id: String,
    pub error_code: String,
    pub error_message: String,
    /// The command that triggered the error, when the router still had
    /// the correlation.
    pub command: Option<Envelope>,
    /// Retries already performed for this correlation.
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

/// What the broker should do about an error.
#[derive(Debug, Clone)]
pub enum RecoveryDecision {
    /// Nothing beyond recording (Ignore, exhausted Retry, or resolved
    /// Custom).
    Recorded { resolved: bool },
    /// Re-enqueue this command to the device.
    Resend(Envelope),
    /// Fan out `error_notice` to the device's event subscribers.
    Notify,
    /// Send a `reset` command to the device.
    Restart,
    /// Mark disconnected and fan out `device_failover`.
    Failover,
}

/// One line of the outcome history.
#[derive(Debug, Clone)]
pub struct RecoveryRecord {
    pub device_id: String,
    pub error_code: String,
    pub strategy: RecoveryStrategy,
    pub resolved: bool,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct StrategyMaps {
    by_device: HashMap<(String, String), RecoveryStrategy>,
    by_code: HashMap<String, RecoveryStrategy>,
    default: RecoveryStrategy,
    handlers_by_device: HashMap<(String, String), CustomHandler>,
    handlers_by_code: HashMap<String, CustomHandler>,
}

/// Applies recovery strategies to device-reported errors.
pub struct RecoverySupervisor {
    strategies: RwLock<StrategyMaps>,
    /// Retries taken per original command id, for the Retry cap.
    retry_counts: Mutex<HashMap<String, u32>>,
    retry_cap: u32,
    history: Mutex<VecDeque<RecoveryRecord>>,
    history_limit: usize,
}

impl RecoverySupervisor {
    pub fn new(retry_cap: u32) -> Self {
        RecoverySupervisor {
            strategies: RwLock::new(StrategyMaps {
                by_device: HashMap::new(),
                by_code: HashMap::new(),
                default: RecoveryStrategy::Ignore,
                handlers_by_device: HashMap::new(),
                handlers_by_code: HashMap::new(),
            }),
            retry_counts: Mutex::new(HashMap::new()),
            retry_cap,
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub async fn set_default_strategy(&self, strategy: RecoveryStrategy) {
        self.strategies.write().await.default = strategy;
    }

    pub async fn set_strategy(&self, error_code: &str, strategy: RecoveryStrategy) {
        self.strategies
            .write()
            .await
            .by_code
            .insert(error_code.to_owned(), strategy);
    }

    pub async fn set_device_strategy(
        &self,
        device_id: &str,
        error_code: &str,
        strategy: RecoveryStrategy,
    ) {
        self.strategies
            .write()
            .await
            .by_device
            .insert((device_id.to_owned(), error_code.to_owned()), strategy);
    }

    pub async fn register_custom_handler(&self, error_code: &str, handler: CustomHandler) {
        let mut strategies = self.strategies.write().await;
        strategies
            .by_code
            .insert(error_code.to_owned(), RecoveryStrategy::Custom);
        strategies
            .handlers_by_code
            .insert(error_code.to_owned(), handler);
    }

    pub async fn register_device_custom_handler(
        &self,
        device_id: &str,
        error_code: &str,
        handler: CustomHandler,
    ) {
        let key = (device_id.to_owned(), error_code.to_owned());
        let mut strategies = self.strategies.write().await;
        strategies.by_device.insert(key.clone(), RecoveryStrategy::Custom);
        strategies.handlers_by_device.insert(key, handler);
    }

    /// Decide what to do about one device-reported error.
    pub async fn handle_error(&self, ctx: &ErrorContext) -> RecoveryDecision {
        let strategy = self.find_strategy(&ctx.device_id, &ctx.error_code).await;
        debug!(
            device_id = %ctx.device_id,
            error_code = %ctx.error_code,
            ?strategy,
            "applying recovery strategy"
        );

        let decision = match strategy {
            RecoveryStrategy::Ignore => RecoveryDecision::Recorded { resolved: false },
            RecoveryStrategy::Retry => self.decide_retry(ctx).await,
            RecoveryStrategy::Notify => RecoveryDecision::Notify,
            RecoveryStrategy::RestartDevice => RecoveryDecision::Restart,
            RecoveryStrategy::Failover => {
                info!(device_id = %ctx.device_id, "failover strategy tripped");
                RecoveryDecision::Failover
            }
            RecoveryStrategy::Custom => {
                let resolved = match self.find_handler(&ctx.device_id, &ctx.error_code).await {
                    Some(handler) => handler(ctx),
                    None => false,
                };
                RecoveryDecision::Recorded { resolved }
            }
        };

        let resolved = match &decision {
            RecoveryDecision::Recorded { resolved } => *resolved,
            // Actions count as resolved once the broker executes them;
            // a later error starts a fresh record.
            _ => true,
        };
        self.record(ctx, strategy, resolved).await;
        decision
    }

    async fn decide_retry(&self, ctx: &ErrorContext) -> RecoveryDecision {
        let Some(command) = &ctx.command else {
            // Correlation already gone; nothing to resend.
            return RecoveryDecision::Recorded { resolved: false };
        };
        let mut counts = self.retry_counts.lock().await;
        let taken = counts.entry(command.message_id.clone()).or_insert(0);
        if *taken >= self.retry_cap {
            counts.remove(&command.message_id);
            return RecoveryDecision::Recorded { resolved: false };
        }
        *taken += 1;
        RecoveryDecision::Resend(command.clone())
    }

    /// Forget retry bookkeeping for a command that finally succeeded.
    pub async fn note_resolved(&self, message_id: &str) {
        self.retry_counts.lock().await.remove(message_id);
    }

    async fn find_strategy(&self, device_id: &str, error_code: &str) -> RecoveryStrategy {
        let strategies = self.strategies.read().await;
        strategies
            .by_device
            .get(&(device_id.to_owned(), error_code.to_owned()))
            .or_else(|| strategies.by_code.get(error_code))
            .copied()
            .unwrap_or(strategies.default)
    }

    async fn find_handler(&self, device_id: &str, error_code: &str) -> Option<CustomHandler> {
        let strategies = self.strategies.read().await;
        strategies
            .handlers_by_device
            .get(&(device_id.to_owned(), error_code.to_owned()))
            .or_else(|| strategies.handlers_by_code.get(error_code))
            .cloned()
    }

    async fn record(&self, ctx: &ErrorContext, strategy: RecoveryStrategy, resolved: bool) {
        let mut history = self.history.lock().await;
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(RecoveryRecord {
            device_id: ctx.device_id.clone(),
            error_code: ctx.error_code.clone(),
            strategy,
            resolved,
            at: ctx.occurred_at,
        });
    }

    /// The most recent outcomes, newest last, at most `limit`.
    pub async fn history(&self, limit: usize) -> Vec<RecoveryRecord> {
        let history = self.history.lock().await;
        history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
