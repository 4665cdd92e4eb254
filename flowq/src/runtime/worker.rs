use serde::{Deserialize, Serialize};

use crate::opts::KeepJobs;
use crate::scripts::LimiterArgs;

/// Queue-wide or per-group claim rate limit.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterOptions {
    /// Jobs allowed per window.
    pub max: u64,
    /// Window length in milliseconds.
    pub duration_ms: u64,
    /// Field of the job data to limit by, instead of the whole queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
}

impl RateLimiterOptions {
    pub fn new(max: u64, duration_ms: u64) -> Self {
        Self {
            max,
            duration_ms,
            group_key: None,
        }
    }

    pub fn with_group_key(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    pub(crate) fn to_args(&self) -> LimiterArgs {
        LimiterArgs {
            max: self.max,
            duration_ms: self.duration_ms,
            group_key: self.group_key.clone(),
        }
    }
}

/// Configuration of one worker process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Recorded on claimed jobs as `processedBy`.
    pub name: String,
    /// Number of execution slots.
    pub concurrency: usize,
    pub lock_duration_ms: u64,
    /// Renewal period; half the lock duration when unset.
    pub lock_renew_time_ms: Option<u64>,
    pub stalled_interval_ms: u64,
    /// Times a job may be recovered from a stall before it fails.
    pub max_stalled_count: u32,
    /// Longest blocking wait for new work once the queue looked empty.
    pub drain_delay_ms: u64,
    /// Pause before retrying after a store error.
    pub run_retry_delay_ms: u64,
    pub limiter: Option<RateLimiterOptions>,
    pub skip_stalled_check: bool,
    pub skip_lock_renewal: bool,
    pub skip_delayed_promotion: bool,
    /// Retention for completed jobs that set none.
    pub remove_on_complete: Option<KeepJobs>,
    /// Retention for failed jobs that set none.
    pub remove_on_fail: Option<KeepJobs>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lock_duration(mut self, ms: u64) -> Self {
        self.lock_duration_ms = ms;
        self
    }

    pub fn with_lock_renew_time(mut self, ms: u64) -> Self {
        self.lock_renew_time_ms = Some(ms);
        self
    }

    pub fn with_stalled_interval(mut self, ms: u64) -> Self {
        self.stalled_interval_ms = ms;
        self
    }

    pub fn with_max_stalled_count(mut self, count: u32) -> Self {
        self.max_stalled_count = count;
        self
    }

    pub fn with_drain_delay(mut self, ms: u64) -> Self {
        self.drain_delay_ms = ms;
        self
    }

    pub fn with_run_retry_delay(mut self, ms: u64) -> Self {
        self.run_retry_delay_ms = ms;
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimiterOptions) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_skip_stalled_check(mut self, skip: bool) -> Self {
        self.skip_stalled_check = skip;
        self
    }

    pub fn with_skip_lock_renewal(mut self, skip: bool) -> Self {
        self.skip_lock_renewal = skip;
        self
    }

    pub fn with_skip_delayed_promotion(mut self, skip: bool) -> Self {
        self.skip_delayed_promotion = skip;
        self
    }

    pub fn with_remove_on_complete(mut self, keep: KeepJobs) -> Self {
        self.remove_on_complete = Some(keep);
        self
    }

    pub fn with_remove_on_fail(mut self, keep: KeepJobs) -> Self {
        self.remove_on_fail = Some(keep);
        self
    }

    /// Effective renewal period in milliseconds.
    pub fn renew_interval_ms(&self) -> u64 {
        crate::lease::renew_interval_ms(self.lock_duration_ms, self.lock_renew_time_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.lock_duration_ms == 0 {
            anyhow::bail!("lock duration must be positive");
        }
        if self.stalled_interval_ms == 0 {
            anyhow::bail!("stalled interval must be positive");
        }
        if let Some(limiter) = &self.limiter {
            if limiter.max == 0 || limiter.duration_ms == 0 {
                anyhow::bail!("limiter max and duration must be positive");
            }
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "flowq-worker".to_string(),
            concurrency: 1,
            lock_duration_ms: 30_000,
            lock_renew_time_ms: None,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            drain_delay_ms: 5_000,
            run_retry_delay_ms: 15_000,
            limiter: None,
            skip_stalled_check: false,
            skip_lock_renewal: false,
            skip_delayed_promotion: false,
            remove_on_complete: None,
            remove_on_fail: None,
        }
    }
}
