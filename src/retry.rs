//! Bounded exponential backoff with jitter.
//!
//! Ledger operations are synchronous, so the policy sleeps the calling thread.
//! Only errors the caller marks as transient are retried; everything else is
//! returned on the first attempt.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let clamped_attempts = max_attempts.max(1);
        let clamped_base = base_delay_ms.max(1);
        let clamped_max_delay = max_delay_ms.max(clamped_base);
        let clamped_jitter = jitter_pct.clamp(0.0, 1.0);
        Self {
            max_attempts: clamped_attempts,
            base_delay_ms: clamped_base,
            max_delay_ms: clamped_max_delay,
            jitter_pct: clamped_jitter,
        }
    }

    /// One attempt, no waiting.
    pub fn no_retry() -> Self {
        Self::new(1, 1, 1, 0.0)
    }

    pub(crate) fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let jittered = if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            delay.saturating_add_signed(delta)
        } else {
            delay
        };
        Duration::from_millis(jittered)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget runs out. The last error is returned unchanged.
    pub fn retry<T, E, F, R>(&self, operation: &str, mut is_transient: R, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Result<T, E>,
        R: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !is_transient(&err) || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, 10, 200, 0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn new_clamps_input_parameters() {
        let policy = RetryPolicy::new(0, 0, 0, 2.0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay_ms, 1);
        assert_eq!(policy.max_delay_ms, 1);
        assert_eq!(policy.jitter_pct, 1.0);
    }

    #[test]
    fn next_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 500, 0.0);
        let delays: Vec<_> = (0..5).map(|attempt| policy.next_delay(attempt)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(500)); // capped
        assert_eq!(delays[4], Duration::from_millis(500));
    }

    #[test]
    fn retries_transient_until_success() {
        let policy = RetryPolicy::new(3, 1, 1, 0.0);
        let calls = Cell::new(0);
        let result: Result<&str, String> = policy.retry(
            "test",
            |_| true,
            |attempt| {
                calls.set(calls.get() + 1);
                if attempt < 2 {
                    Err("busy".to_string())
                } else {
                    Ok("ok")
                }
            },
        );
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn stops_after_budget() {
        let policy = RetryPolicy::new(2, 1, 1, 0.0);
        let calls = Cell::new(0);
        let result: Result<(), String> = policy.retry(
            "test",
            |_| true,
            |_| {
                calls.set(calls.get() + 1);
                Err("busy".to_string())
            },
        );
        assert_eq!(result, Err("busy".to_string()));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, 1, 1, 0.0);
        let calls = Cell::new(0);
        let result: Result<(), String> = policy.retry(
            "test",
            |e: &String| e == "busy",
            |_| {
                calls.set(calls.get() + 1);
                Err("broke".to_string())
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
