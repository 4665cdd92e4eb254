use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueueError, QueueResult};
use crate::job_scheduler::RepeatOptions;

/// Highest accepted priority value. Lower values run first; `0` means the
/// job is not prioritized at all.
pub const MAX_PRIORITY: u32 = 1 << 21;

/// Longest accepted delay, a little under 35 years. Backoff results are
/// clamped to it as well.
pub const MAX_DELAY_MS: i64 = 1 << 40;

/// Options accepted when adding a job.
///
/// Stored on the job hash as JSON. Rarely used flags are serialized under
/// short codes to keep the hash compact.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOptions {
    /// Custom id. Must not be an integer, which would collide with the
    /// auto-increment counter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Milliseconds to wait before the job becomes eligible.
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub delay: i64,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub priority: u32,
    /// Total attempts including the first one.
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffOptions>,
    #[serde(skip_serializing_if = "is_false")]
    pub lifo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<KeepJobs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<KeepJobs>,
    #[serde(rename = "kl", skip_serializing_if = "Option::is_none")]
    pub keep_logs: Option<usize>,
    #[serde(rename = "stl", skip_serializing_if = "Option::is_none")]
    pub stack_trace_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(rename = "fpof", skip_serializing_if = "is_false")]
    pub fail_parent_on_failure: bool,
    #[serde(rename = "cpof", skip_serializing_if = "is_false")]
    pub continue_parent_on_failure: bool,
    #[serde(rename = "idof", skip_serializing_if = "is_false")]
    pub ignore_dependency_on_failure: bool,
    #[serde(rename = "rdof", skip_serializing_if = "is_false")]
    pub remove_dependency_on_failure: bool,
    #[serde(rename = "de", skip_serializing_if = "Option::is_none")]
    pub deduplication: Option<DeduplicationOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_delay(mut self, delay_ms: i64) -> Self {
        self.delay = delay_ms;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
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

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_fail_parent_on_failure(mut self) -> Self {
        self.fail_parent_on_failure = true;
        self
    }

    pub fn with_continue_parent_on_failure(mut self) -> Self {
        self.continue_parent_on_failure = true;
        self
    }

    pub fn with_ignore_dependency_on_failure(mut self) -> Self {
        self.ignore_dependency_on_failure = true;
        self
    }

    pub fn with_remove_dependency_on_failure(mut self) -> Self {
        self.remove_dependency_on_failure = true;
        self
    }

    pub fn with_deduplication(mut self, dedup: DeduplicationOptions) -> Self {
        self.deduplication = Some(dedup);
        self
    }

    pub fn with_repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// Attempts allowed before the job is moved to `failed`.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// What happens to the parent when this job fails.
    pub fn parent_failure_policy(&self) -> ParentFailurePolicy {
        if self.fail_parent_on_failure {
            ParentFailurePolicy::Fail
        } else if self.continue_parent_on_failure {
            ParentFailurePolicy::Continue
        } else if self.ignore_dependency_on_failure {
            ParentFailurePolicy::Ignore
        } else if self.remove_dependency_on_failure {
            ParentFailurePolicy::Remove
        } else {
            ParentFailurePolicy::Block
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if let Some(job_id) = &self.job_id {
            if job_id.is_empty() {
                return Err(QueueError::InvalidOptions(
                    "custom job id cannot be empty".into(),
                ));
            }
            if job_id.parse::<i64>().is_ok() {
                return Err(QueueError::InvalidOptions(format!(
                    "custom job id {job_id} cannot be an integer"
                )));
            }
        }
        if !(0..=MAX_DELAY_MS).contains(&self.delay) {
            return Err(QueueError::InvalidOptions(format!(
                "delay must be between 0 and {MAX_DELAY_MS}"
            )));
        }
        if self
            .backoff
            .as_ref()
            .is_some_and(|backoff| !(0..=MAX_DELAY_MS).contains(&backoff.delay))
        {
            return Err(QueueError::InvalidOptions(format!(
                "backoff delay must be between 0 and {MAX_DELAY_MS}"
            )));
        }
        if self.priority > MAX_PRIORITY {
            return Err(QueueError::InvalidOptions(format!(
                "priority must be between 0 and {MAX_PRIORITY}"
            )));
        }
        if self.priority > 0 && self.lifo {
            return Err(QueueError::InvalidOptions(
                "priority cannot be combined with lifo".into(),
            ));
        }
        let policies = [
            self.fail_parent_on_failure,
            self.continue_parent_on_failure,
            self.ignore_dependency_on_failure,
            self.remove_dependency_on_failure,
        ];
        if policies.iter().filter(|flag| **flag).count() > 1 {
            return Err(QueueError::InvalidOptions(
                "only one parent failure policy may be set".into(),
            ));
        }
        if self
            .deduplication
            .as_ref()
            .is_some_and(|dedup| dedup.id.is_empty())
        {
            return Err(QueueError::InvalidOptions(
                "deduplication id cannot be empty".into(),
            ));
        }
        Ok(())
    }

    /// Overlay these options on `defaults`; every field set here wins.
    pub fn merged_over(&self, defaults: &JobOptions) -> QueueResult<JobOptions> {
        let mut base = serde_json::to_value(defaults)?;
        let overlay = serde_json::to_value(self)?;
        if let (Value::Object(base), Value::Object(overlay)) =
            (&mut base, overlay)
        {
            base.extend(overlay);
        }
        Ok(serde_json::from_value(base)?)
    }
}

/// Reaction of a parent to one of its children failing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParentFailurePolicy {
    /// The parent fails as well.
    Fail,
    /// The parent starts immediately.
    Continue,
    /// The failure is recorded and the dependency counts as resolved.
    Ignore,
    /// The dependency edge is dropped without a trace.
    Remove,
    /// The parent stays in `waiting-children` until the child is retried.
    Block,
}

/// Back-reference from a child job to its parent.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: String,
    /// `prefix:name` of the queue holding the parent.
    #[serde(rename = "queueKey")]
    pub queue: String,
}

impl ParentRef {
    pub fn new(id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
        }
    }

    /// Full store key of the parent job hash.
    pub fn job_key(&self) -> String {
        format!("{}:{}", self.queue, self.id)
    }
}

/// Retry delay strategy attached to a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffOptions {
    /// `fixed`, `exponential`, or the name of a custom strategy.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub delay: i64,
}

impl BackoffOptions {
    pub fn fixed(delay_ms: i64) -> Self {
        Self {
            kind: "fixed".into(),
            delay: delay_ms,
        }
    }

    pub fn exponential(delay_ms: i64) -> Self {
        Self {
            kind: "exponential".into(),
            delay: delay_ms,
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self {
            kind: name.into(),
            delay: 0,
        }
    }
}

/// Retention policy for finished jobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeepJobs {
    /// `true` removes the job immediately, `false` keeps every job.
    Remove(bool),
    /// Keep only the newest `n` jobs.
    Count(usize),
    Policy {
        /// Maximum age in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        age: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
        /// Maximum number of jobs removed in one pass.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
}

/// Deduplication (debounce) settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationOptions {
    pub id: String,
    /// Window in milliseconds. Without a ttl the key lives until the job
    /// finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    /// Refresh the ttl when a duplicate is rejected.
    #[serde(default, skip_serializing_if = "is_false")]
    pub extend: bool,
}

impl DeduplicationOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ttl: None,
            extend: false,
        }
    }

    pub fn with_ttl(mut self, ttl_ms: i64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_extend(mut self, extend: bool) -> Self {
        self.extend = extend;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_codes_on_the_wire() {
        let opts = JobOptions::new()
            .with_attempts(3)
            .with_fail_parent_on_failure()
            .with_deduplication(DeduplicationOptions::new("d1"));
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["fpof"], true);
        assert_eq!(json["de"]["id"], "d1");
        assert_eq!(json["attempts"], 3);
        assert!(json.get("lifo").is_none());

        let back: JobOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back, opts);
    }

    #[test]
    fn test_keep_jobs_shapes() {
        let parsed: KeepJobs = serde_json::from_str("true").unwrap();
        assert_eq!(parsed, KeepJobs::Remove(true));
        let parsed: KeepJobs = serde_json::from_str("10").unwrap();
        assert_eq!(parsed, KeepJobs::Count(10));
        let parsed: KeepJobs =
            serde_json::from_str(r#"{"age":60,"count":5}"#).unwrap();
        assert_eq!(
            parsed,
            KeepJobs::Policy {
                age: Some(60),
                count: Some(5),
                limit: None
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(JobOptions::new().with_job_id("42").validate().is_err());
        assert!(JobOptions::new().with_job_id("job-42").validate().is_ok());
        assert!(JobOptions::new().with_delay(-1).validate().is_err());
        assert!(JobOptions::new().with_delay(MAX_DELAY_MS).validate().is_ok());
        assert!(JobOptions::new().with_delay(1 << 52).validate().is_err());
        assert!(
            JobOptions::new()
                .with_backoff(BackoffOptions::fixed(MAX_DELAY_MS + 1))
                .validate()
                .is_err()
        );
        assert!(
            JobOptions::new()
                .with_priority(MAX_PRIORITY + 1)
                .validate()
                .is_err()
        );
        assert!(
            JobOptions::new()
                .with_fail_parent_on_failure()
                .with_ignore_dependency_on_failure()
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_merged_over_defaults() {
        let defaults = JobOptions::new()
            .with_attempts(5)
            .with_backoff(BackoffOptions::fixed(10));
        let merged = JobOptions::new()
            .with_attempts(2)
            .merged_over(&defaults)
            .unwrap();
        assert_eq!(merged.attempts, 2);
        assert_eq!(merged.backoff, Some(BackoffOptions::fixed(10)));
    }

    #[test]
    fn test_parent_failure_policy() {
        assert_eq!(
            JobOptions::new().parent_failure_policy(),
            ParentFailurePolicy::Block
        );
        assert_eq!(
            JobOptions::new()
                .with_continue_parent_on_failure()
                .parent_failure_policy(),
            ParentFailurePolicy::Continue
        );
    }
}
