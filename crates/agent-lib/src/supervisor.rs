//! Supervised periodic tasks
//!
//! Every background loop in the agent (health polls, keepalive pings,
//! application heartbeats, relay sweeps) follows the same shape: run a unit
//! of work, sleep, repeat, back off on failure, stop on cancellation. This
//! module provides that shape once.

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff without jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.initial.saturating_mul(1u32 << exponent).min(self.max)
    }
}

/// What to do after a successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Sleep the configured interval
    Normal,
    /// Sleep a custom delay
    After(Duration),
    /// End the task
    Stop,
}

/// One unit of periodic work
#[async_trait]
pub trait PeriodicWork: Send + 'static {
    async fn run_once(&mut self) -> anyhow::Result<Pace>;
}

#[derive(Debug, Clone)]
pub struct PeriodicConfig {
    /// Task name used in logs
    pub name: String,
    pub interval: Duration,
    pub backoff: BackoffPolicy,
    /// Delay before the first run
    pub initial_delay: Duration,
}

impl PeriodicConfig {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            backoff: BackoffPolicy::new(interval, interval),
            initial_delay: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Returns false when cancelled.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Spawn `work` as a supervised periodic task.
///
/// Consecutive failures grow the delay through the backoff policy; any
/// success resets it. Cancellation interrupts both the work and the sleep.
pub fn spawn_periodic<W: PeriodicWork>(
    mut work: W,
    config: PeriodicConfig,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u32 = 0;

        if !sleep_or_cancel(&token, config.initial_delay).await {
            return;
        }

        loop {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                outcome = work.run_once() => outcome,
            };

            let delay = match outcome {
                Ok(Pace::Normal) => {
                    failures = 0;
                    config.interval
                }
                Ok(Pace::After(delay)) => {
                    failures = 0;
                    delay
                }
                Ok(Pace::Stop) => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = config.backoff.delay(failures);
                    warn!(
                        task = %config.name,
                        error = %e,
                        failures = failures,
                        next_backoff_secs = delay.as_secs_f64(),
                        "Periodic task failed"
                    );
                    delay
                }
            };

            if !sleep_or_cancel(&token, delay).await {
                break;
            }
        }

        debug!(task = %config.name, "Periodic task stopped");
    })
}
