//! Exponential backoff with jitter for flaky external calls.
use crate::log::JobLog;
use crate::sysexit::{JobExit, MemoryExhausted};
use anyhow::Result;
use rand::RngExt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (1-based), jittered.
    ///
    /// Once `backoff^attempt` passes `max_delay` the cap dominates and the
    /// jitter is lost.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::rng().random_range(0.5..1.0);
        self.delay_with_jitter(attempt, jitter)
    }

    fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = jitter * self.backoff.powi(exponent);
        let seconds = raw
            .max(self.min_delay.as_secs_f64())
            .min(self.max_delay.as_secs_f64());
        if seconds.is_finite() {
            Duration::from_secs_f64(seconds)
        } else {
            self.max_delay
        }
    }
}

/// Call `op` until it succeeds or `policy.max_attempts` calls have failed.
///
/// The last error is returned unchanged; classification is left to the
/// enclosing guard. Decided exits and memory exhaustion are never retried.
pub fn retry<T>(
    policy: &RetryPolicy,
    log: &JobLog,
    label: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !qualifies(&err) {
                    return Err(err);
                }
                let sleep = policy.delay_for(attempt);
                log.warning(format!(
                    "{label} raised {err:#}, using retry {attempt} of {max_attempts}, sleeping for {:.2} seconds",
                    sleep.as_secs_f64()
                ));
                std::thread::sleep(sleep);
            }
        }
    }
}

fn qualifies(err: &anyhow::Error) -> bool {
    !err.chain().any(|cause| cause.is::<JobExit>() || cause.is::<MemoryExhausted>())
}
