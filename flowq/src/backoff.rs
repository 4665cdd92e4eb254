//! Retry delays.
//!
//! A strategy maps the number of attempts made so far to a delay in
//! milliseconds. `fixed` and `exponential` are built in; other names are
//! looked up in a [`Backoffs`] registry supplied to the worker. A strategy
//! returning `-1` stops retrying even when attempts remain.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::opts::{BackoffOptions, MAX_DELAY_MS};

/// Custom retry delay strategy.
pub trait BackoffStrategy: Send + Sync {
    /// Delay before the next attempt. `attempts_made` already counts the
    /// attempt that just failed.
    fn delay(&self, attempts_made: u32, error: &anyhow::Error, job: &Job) -> i64;
}

impl<F> BackoffStrategy for F
where
    F: Fn(u32, &anyhow::Error, &Job) -> i64 + Send + Sync,
{
    fn delay(&self, attempts_made: u32, error: &anyhow::Error, job: &Job) -> i64 {
        self(attempts_made, error, job)
    }
}

pub fn fixed(delay_ms: i64) -> i64 {
    delay_ms
}

/// `round((2^attempts_made - 1) * delay_ms)`, capped at [`MAX_DELAY_MS`].
pub fn exponential(attempts_made: u32, delay_ms: i64) -> i64 {
    let factor = 2f64.powi(attempts_made.min(1_023) as i32) - 1.0;
    let delay = (factor * delay_ms as f64).round();
    if delay >= MAX_DELAY_MS as f64 {
        MAX_DELAY_MS
    } else {
        delay as i64
    }
}

/// Named custom strategies.
#[derive(Clone, Default)]
pub struct Backoffs {
    custom: HashMap<String, Arc<dyn BackoffStrategy>>,
}

impl std::fmt::Debug for Backoffs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("Backoffs").field("custom", &names).finish()
    }
}

impl Backoffs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(
        mut self,
        name: impl Into<String>,
        strategy: impl BackoffStrategy + 'static,
    ) -> Self {
        self.custom.insert(name.into(), Arc::new(strategy));
        self
    }

    /// Delay for a job configured with `opts`. No backoff means retry now.
    ///
    /// Results above [`MAX_DELAY_MS`] are clamped; `-1` passes through.
    pub fn calculate(
        &self,
        opts: Option<&BackoffOptions>,
        attempts_made: u32,
        error: &anyhow::Error,
        job: &Job,
    ) -> QueueResult<i64> {
        let Some(opts) = opts else {
            return Ok(0);
        };
        let delay = match opts.kind.as_str() {
            "fixed" => fixed(opts.delay),
            "exponential" => exponential(attempts_made, opts.delay),
            name => self
                .custom
                .get(name)
                .map(|strategy| strategy.delay(attempts_made, error, job))
                .ok_or_else(|| {
                    QueueError::InvalidOptions(format!("unknown backoff strategy {name}"))
                })?,
        };
        Ok(delay.min(MAX_DELAY_MS))
    }
}

/// What to do with a job whose processor failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Move to `failed`.
    Fail,
    /// Back to `wait` immediately.
    RetryNow,
    /// To `delayed` for this many milliseconds.
    RetryAfter(i64),
}

/// Classify a failed attempt. `unrecoverable` skips the remaining budget.
pub fn decide(
    job: &Job,
    error: &anyhow::Error,
    backoffs: &Backoffs,
    unrecoverable: bool,
) -> RetryDecision {
    if unrecoverable || !job.has_attempts_left() {
        return RetryDecision::Fail;
    }
    let attempts_made = job.attempts_made.saturating_add(1);
    match backoffs.calculate(job.opts.backoff.as_ref(), attempts_made, error, job) {
        Ok(delay) if delay < 0 => RetryDecision::Fail,
        Ok(0) => RetryDecision::RetryNow,
        Ok(delay) => RetryDecision::RetryAfter(delay),
        Err(err) => {
            tracing::warn!(job_id = %job.id, error = %err, "failing job without retry");
            RetryDecision::Fail
        }
    }
}
