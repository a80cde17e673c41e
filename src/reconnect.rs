// src/reconnect.rs - Shared exponential backoff for source and sink connections
use crate::error::ConnectError;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backoff tuning shared by both connection types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Relative jitter, 0.2 means ±20 %
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// A connection held this long resets the attempt counter
    #[serde(default = "default_min_stable_ms")]
    pub min_stable_ms: u64,
}

fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_jitter() -> f64 { 0.2 }
fn default_min_stable_ms() -> u64 { 10_000 }

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            min_stable_ms: default_min_stable_ms(),
        }
    }
}

impl BackoffPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn min_stable(&self) -> Duration {
        Duration::from_millis(self.min_stable_ms)
    }
}

/// Outcome of [`ReconnectSupervisor::connect_with_backoff`]
#[derive(Debug)]
pub enum ConnectOutcome<T> {
    Connected(T),
    /// Non-retriable failure; the caller decides what to wait for
    Failed(ConnectError),
    Cancelled,
}

/// Retry state for one connection.
///
/// `delay = min(max_delay, base_delay * 2^attempt)` with ±jitter. Delays
/// handed out between two resets never decrease and never exceed `max_delay`.
///
/// # Examples
///
/// ```rust
/// use petra_bridge::{BackoffPolicy, ReconnectSupervisor};
///
/// let policy = BackoffPolicy { jitter: 0.0, ..BackoffPolicy::default() };
/// let mut supervisor = ReconnectSupervisor::new("sink", policy);
/// let first = supervisor.next_delay();
/// let second = supervisor.next_delay();
/// assert!(second >= first);
/// ```
#[derive(Debug)]
pub struct ReconnectSupervisor {
    name: &'static str,
    policy: BackoffPolicy,
    attempt: u32,
    last_delay: Duration,
    connected_at: Option<Instant>,
    rng: StdRng,
}

impl ReconnectSupervisor {
    pub fn new(name: &'static str, policy: BackoffPolicy) -> Self {
        Self::with_rng(name, policy, StdRng::from_entropy())
    }

    /// Deterministic jitter, used by tests
    pub fn with_seed(name: &'static str, policy: BackoffPolicy, seed: u64) -> Self {
        Self::with_rng(name, policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(name: &'static str, policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            name,
            policy,
            attempt: 0,
            last_delay: Duration::ZERO,
            connected_at: None,
            rng,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let max = self.policy.max_delay();
        let exp = self.attempt.min(31);
        let raw = self
            .policy
            .base_delay()
            .checked_mul(1u32 << exp)
            .unwrap_or(max)
            .min(max);

        let jitter = if self.policy.jitter.is_finite() {
            self.policy.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let jittered = if jitter > 0.0 {
            let factor = 1.0 + self.rng.gen_range(-jitter..=jitter);
            Duration::try_from_secs_f64(raw.as_secs_f64() * factor).unwrap_or(max)
        } else {
            raw
        };

        let delay = jittered.max(self.last_delay).min(max);
        self.last_delay = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Record a successful connect
    pub fn on_connected(&mut self, now: Instant) {
        self.connected_at = Some(now);
    }

    /// Reset the counter once the current connection has been stable long enough.
    ///
    /// Returns true when a reset happened.
    pub fn observe_stable(&mut self, now: Instant) -> bool {
        match self.connected_at {
            Some(since) if self.attempt > 0 && now.duration_since(since) >= self.policy.min_stable() => {
                debug!(name = self.name, attempts = self.attempt, "Connection stable, resetting backoff");
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Record a lost connection; a flap shorter than `min_stable` keeps the counter
    pub fn on_disconnected(&mut self, now: Instant) {
        self.observe_stable(now);
        self.connected_at = None;
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }

    /// Sleep for the next delay unless cancelled first. Returns false when cancelled.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        debug!(name = self.name, attempt = self.attempt, delay_ms = delay.as_millis() as u64, "Backing off");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Call `connect` until it succeeds, fails permanently, or `cancel` fires.
    ///
    /// Retriable failures sleep for [`next_delay`](Self::next_delay); the sleep
    /// is abandoned immediately on cancellation.
    pub async fn connect_with_backoff<T, F, Fut>(
        &mut self,
        cancel: &CancellationToken,
        mut connect: F,
    ) -> ConnectOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectError>>,
    {
        loop {
            if cancel.is_cancelled() {
                return ConnectOutcome::Cancelled;
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return ConnectOutcome::Cancelled,
                result = connect() => result,
            };
            match result {
                Ok(session) => {
                    info!(name = self.name, attempts = self.attempt, "Connected");
                    self.on_connected(Instant::now());
                    return ConnectOutcome::Connected(session);
                }
                Err(e) if e.is_retriable() => {
                    warn!(name = self.name, attempt = self.attempt + 1, error = %e, "Connect attempt failed");
                    if !self.wait(cancel).await {
                        return ConnectOutcome::Cancelled;
                    }
                }
                Err(e) => {
                    warn!(name = self.name, error = %e, "Connect failed permanently");
                    return ConnectOutcome::Failed(e);
                }
            }
        }
    }
}
