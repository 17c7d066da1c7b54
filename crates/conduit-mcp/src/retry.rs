//! Bounded retry loop with exponential backoff and jitter.

use crate::cancel::CancellationToken;
use chrono::{DateTime, Utc};
use conduit_core::{AttemptRecord, ConduitError, ConduitResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Configures retry behaviour for connects and tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap for the backoff delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Jitter spread as a fraction of the delay (0.1 = ±10%).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Upper bound on attempts for one logical operation.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff after the failed attempt `attempt` (zero-based), without
    /// jitter: `min(max_delay, initial_delay * backoff_factor^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.backoff_factor.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped / 1000.0)
        } else if capped.is_nan() || capped <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.max_delay_ms)
        }
    }

    /// Backoff with uniform jitter of ±(delay * jitter_factor), clamped to
    /// `[0, max_delay]`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = base * self.jitter_factor;
        if spread <= 0.0 || !spread.is_finite() {
            return self.base_delay(attempt);
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let max = self.max_delay_ms as f64 / 1000.0;
        Duration::from_secs_f64((base + offset).clamp(0.0, max))
    }

    pub fn validate(&self) -> ConduitResult<()> {
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(ConduitError::Configuration(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConduitError::Configuration(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConduitError::Configuration(format!(
                "initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// How a retried operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOutcome {
    Succeeded,
    /// Stopped on a non-retryable error.
    Failed,
    /// Every allowed attempt failed with a retryable error.
    Exhausted,
    Cancelled,
}

/// Statistics recorded for one logical operation.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    /// Label of the operation, e.g. `connect` or `tools/call:add`.
    pub operation: String,
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Sum of every backoff slept, including one cut short by cancellation.
    pub total_delay_ms: u64,
    pub attempts: Vec<AttemptRecord>,
    pub outcome: RetryOutcome,
}

/// Result of [`with_retry`]: the operation's result plus its statistics.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: ConduitResult<T>,
    pub stats: RetryStats,
}

/// Ephemeral per-operation state.
struct RetryState {
    attempt_count: u32,
    next_delay: Duration,
    started_at: DateTime<Utc>,
    clock: Instant,
    total_delay: Duration,
    history: Vec<AttemptRecord>,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempt_count: 0,
            next_delay: Duration::ZERO,
            started_at: Utc::now(),
            clock: Instant::now(),
            total_delay: Duration::ZERO,
            history: Vec::new(),
        }
    }

    fn finish<T>(
        self,
        operation: &str,
        outcome: RetryOutcome,
        result: ConduitResult<T>,
    ) -> Retried<T> {
        Retried {
            result,
            stats: RetryStats {
                operation: operation.to_string(),
                attempt_count: self.attempt_count,
                started_at: self.started_at,
                elapsed_ms: millis(self.clock.elapsed()),
                total_delay_ms: millis(self.total_delay),
                attempts: self.history,
                outcome,
            },
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or `token` is cancelled.
///
/// `op` receives the zero-based attempt index. The token is checked before
/// every attempt and the backoff sleep ends as soon as it fires.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    token: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ConduitResult<T>>,
{
    let mut state = RetryState::new();

    loop {
        if token.is_cancelled() {
            debug!(operation, attempts = state.attempt_count, "Operation cancelled before attempt");
            return state.finish(operation, RetryOutcome::Cancelled, Err(ConduitError::Cancelled));
        }

        let attempt = state.attempt_count;
        state.attempt_count += 1;
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = op(attempt).await;

        let mut record = AttemptRecord {
            attempt,
            delay_before_ms: millis(state.next_delay),
            started_at,
            duration_ms: millis(clock.elapsed()),
            error_kind: None,
            error: None,
        };

        let err = match result {
            Ok(value) => {
                state.history.push(record);
                if attempt > 0 {
                    info!(operation, attempts = state.attempt_count, "Operation succeeded after retry");
                }
                return state.finish(operation, RetryOutcome::Succeeded, Ok(value));
            }
            Err(err) => err,
        };

        record.error_kind = Some(err.kind());
        record.error = Some(err.to_string());
        state.history.push(record);

        if err.is_cancelled() {
            debug!(operation, attempt, "Operation cancelled");
            return state.finish(operation, RetryOutcome::Cancelled, Err(err));
        }

        if !err.is_retryable() {
            warn!(operation, attempt, error = %err, "Non-retryable error");
            return state.finish(operation, RetryOutcome::Failed, Err(err));
        }

        if state.attempt_count >= config.max_attempts() {
            warn!(
                operation,
                attempts = state.attempt_count,
                error = %err,
                "Retries exhausted"
            );
            let exhausted = ConduitError::Exhausted {
                attempts: state.attempt_count,
                history: state.history.clone(),
                source: Box::new(err),
            };
            return state.finish(operation, RetryOutcome::Exhausted, Err(exhausted));
        }

        let delay = config.jittered_delay(attempt);
        state.next_delay = delay;
        info!(
            operation,
            attempt,
            max_attempts = config.max_attempts(),
            delay_ms = millis(delay),
            error = %err,
            "Retryable error, backing off"
        );

        let slept = Instant::now();
        tokio::select! {
            _ = token.cancelled() => {
                state.total_delay += slept.elapsed();
                debug!(operation, attempt, "Cancelled during backoff");
                return state.finish(operation, RetryOutcome::Cancelled, Err(ConduitError::Cancelled));
            }
            _ = tokio::time::sleep(delay) => {
                state.total_delay += delay;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conduit_core::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn backoff_computation() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        };

        assert_eq!(config.base_delay(0), Duration::from_millis(500));
        assert_eq!(config.base_delay(1), Duration::from_millis(1000));
        assert_eq!(config.base_delay(2), Duration::from_millis(2000));
        assert_eq!(config.base_delay(3), Duration::from_millis(4000));
        assert_eq!(config.base_delay(5), Duration::from_millis(16000));
        assert_eq!(config.base_delay(6), Duration::from_millis(30_000)); // capped
        assert_eq!(config.base_delay(500), Duration::from_millis(30_000));
    }

    #[test]
    fn backoff_is_monotonic_up_to_cap() {
        let config = no_jitter(20);
        let delays: Vec<Duration> = (0..20).map(|a| config.base_delay(a)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_spread_and_cap() {
        let config = RetryConfig {
            jitter_factor: 0.5,
            ..no_jitter(3)
        };
        for attempt in 0..8 {
            let base = config.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = config.jittered_delay(attempt).as_secs_f64();
                assert!(d >= base * 0.5 - 1e-9, "{d} below spread of {base}");
                assert!(d <= (base * 1.5).min(1.0) + 1e-9, "{d} above spread of {base}");
            }
        }
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(RetryConfig::default().validate().is_ok());
        let bad_factor = RetryConfig {
            backoff_factor: 0.5,
            ..RetryConfig::default()
        };
        assert_eq!(bad_factor.validate().unwrap_err().kind(), ErrorKind::Configuration);
        let bad_jitter = RetryConfig {
            jitter_factor: 2.0,
            ..RetryConfig::default()
        };
        assert!(bad_jitter.validate().is_err());
        let inverted = RetryConfig {
            initial_delay_ms: 10,
            max_delay_ms: 1,
            ..RetryConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn config_defaults_from_json() {
        let config: RetryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay_ms, 100);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.max_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let run = with_retry(&no_jitter(3), &CancellationToken::new(), "connect", |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ConduitError::Connection("refused".into()))
                } else {
                    Ok("up")
                }
            }
        })
        .await;

        assert_eq!(run.result.unwrap(), "up");
        assert_eq!(run.stats.attempt_count, 3);
        assert_eq!(run.stats.outcome, RetryOutcome::Succeeded);
        assert_eq!(run.stats.total_delay_ms, 300); // 100 + 200
        let delays: Vec<u64> = run.stats.attempts.iter().map(|a| a.delay_before_ms).collect();
        assert_eq!(delays, vec![0, 100, 200]);
        assert!(run.stats.attempts[2].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_carry_history() {
        let run: Retried<()> = with_retry(&no_jitter(2), &CancellationToken::new(), "op", |_| async {
            Err(ConduitError::Timeout("slow".into()))
        })
        .await;

        let err = run.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.history().len(), 3);
        assert_eq!(run.stats.attempt_count, 3);
        assert_eq!(run.stats.outcome, RetryOutcome::Exhausted);
        assert!(matches!(err, ConduitError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let run: Retried<()> = with_retry(&no_jitter(5), &CancellationToken::new(), "op", |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ConduitError::Protocol("garbage".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.stats.outcome, RetryOutcome::Failed);
        assert_eq!(run.result.unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn cancelled_token_performs_no_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let run: Retried<()> = with_retry(&no_jitter(3), &token, "op", |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.stats.attempt_count, 0);
        assert!(run.result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_during_backoff_returns_promptly() {
        let config = RetryConfig {
            initial_delay_ms: 10_000,
            max_delay_ms: 60_000,
            ..no_jitter(5)
        };
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let started = Instant::now();
        let run: Retried<()> = with_retry(&config, &token, "op", |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ConduitError::Connection("down".into())) }
        })
        .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.stats.outcome, RetryOutcome::Cancelled);
        assert!(run.result.unwrap_err().is_cancelled());
    }
}
