//! Credential checks and auth-failure rate limiting.
//!
//! Two methods ship: `basic` (base64 `user:pass` against a salted
//! SHA-256 user table) and `token` (opaque bearer hashed to SHA-256 and
//! compared constant-time against the configured token set — every
//! entry is scanned and every digest byte folded, so timing reveals
//! nothing about which token, or how much of it, matched).  A per-peer
//! sliding window turns repeated failures into `RateLimited` without
//! consulting the tables.
//!
//! Authorization (which peer may command which device) is an extension
//! point; the default is any authenticated peer, any device.

use crate::config::AuthConfig;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use skybus_protocol::AuthMethod;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authenticated; carries the identity (username or token name).
    Ok(String),
    Denied(&'static str),
    /// Too many recent failures from this peer; the tables were not
    /// consulted.
    RateLimited,
}

struct UserRecord {
    salt: [u8; 16],
    password_hash: [u8; 32],
}

/// Validates credentials for incoming sessions.
pub struct Authenticator {
    users: HashMap<String, UserRecord>,
    /// (SHA-256 digest, token name) pairs, scanned in full on every
    /// token check.
    tokens: Vec<([u8; 32], String)>,
    max_failures: u32,
    window: Duration,
    /// Peer hint → failure timestamps inside the window.
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Authenticator {
    pub fn new(cfg: &AuthConfig) -> Self {
        let mut users = HashMap::new();
        for user in &cfg.users {
            let salt: [u8; 16] = rand::random();
            users.insert(
                user.username.clone(),
                UserRecord {
                    salt,
                    password_hash: salted_hash(&salt, &user.password),
                },
            );
        }
        let tokens = cfg
            .tokens
            .iter()
            .map(|t| (digest(&t.token), t.name.clone()))
            .collect();
        Authenticator {
            users,
            tokens,
            max_failures: cfg.max_failed_attempts,
            window: Duration::from_secs(cfg.rate_limit_duration_minutes * 60),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Check one credential presentation.  `peer_hint` identifies the
    /// origin (remote address) for rate limiting.
    pub async fn authenticate(
        &self,
        method: AuthMethod,
        credentials: &str,
        peer_hint: &str,
    ) -> AuthOutcome {
        if self.is_rate_limited(peer_hint).await {
            warn!(peer = peer_hint, "authentication rate limited");
            return AuthOutcome::RateLimited;
        }

        let outcome = match method {
            AuthMethod::Basic => self.check_basic(credentials),
            AuthMethod::Token => self.check_token(credentials),
        };

        match &outcome {
            AuthOutcome::Ok(identity) => {
                debug!(peer = peer_hint, identity = %identity, "authenticated");
            }
            _ => self.record_failure(peer_hint).await,
        }
        outcome
    }

    fn check_basic(&self, credentials: &str) -> AuthOutcome {
        let Ok(decoded) = BASE64.decode(credentials) else {
            return AuthOutcome::Denied("malformed basic credentials");
        };
        let Ok(text) = String::from_utf8(decoded) else {
            return AuthOutcome::Denied("malformed basic credentials");
        };
        let Some((username, password)) = text.split_once(':') else {
            return AuthOutcome::Denied("malformed basic credentials");
        };
        match self.users.get(username) {
            Some(record) if salted_hash(&record.salt, password) == record.password_hash => {
                AuthOutcome::Ok(username.to_owned())
            }
            _ => AuthOutcome::Denied("unknown user or wrong password"),
        }
    }

    fn check_token(&self, credentials: &str) -> AuthOutcome {
        let presented = digest(credentials);
        // Scan every entry and compare every digest byte; no early
        // exit on a mismatch or after a match.
        let mut matched: Option<&str> = None;
        for (stored, name) in &self.tokens {
            if constant_time_eq(stored, &presented) {
                matched = Some(name.as_str());
            }
        }
        match matched {
            Some(name) => AuthOutcome::Ok(name.to_owned()),
            None => AuthOutcome::Denied("unknown token"),
        }
    }

    // -----------------------------------------------------------------------
    // Sliding failure window
    // -----------------------------------------------------------------------

    async fn is_rate_limited(&self, peer_hint: &str) -> bool {
        let mut failures = self.failures.lock().await;
        match failures.get_mut(peer_hint) {
            Some(window) => {
                prune(window, self.window);
                if window.is_empty() {
                    failures.remove(peer_hint);
                    false
                } else {
                    window.len() as u32 >= self.max_failures
                }
            }
            None => false,
        }
    }

    async fn record_failure(&self, peer_hint: &str) {
        let mut failures = self.failures.lock().await;
        let window = failures.entry(peer_hint.to_owned()).or_default();
        prune(window, self.window);
        window.push_back(Instant::now());
    }
}

fn prune(window: &mut VecDeque<Instant>, max_age: Duration) {
    let now = Instant::now();
    while window
        .front()
        .is_some_and(|t| now.duration_since(*t) >= max_age)
    {
        window.pop_front();
    }
}

/// Branchless digest equality: fold the XOR of every byte pair so the
/// comparison takes the same time whatever (and wherever) the
/// difference is.
fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn salted_hash(salt: &[u8; 16], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Build the base64 `user:pass` credential string for the basic method.
pub fn basic_credentials(username: &str, password: &str) -> String {
    BASE64.encode(format!("{}:{}", username, password))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
