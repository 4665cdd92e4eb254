use std::collections::HashMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueueError, QueueResult};
use crate::keys::QueueKeys;
use crate::lease::LockToken;
use crate::opts::{JobOptions, ParentRef};
use crate::scripts::Scripts;
use crate::store::Store;

/// Hash field names of the job wire format.
pub(crate) mod field {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const DATA: &str = "data";
    pub const OPTS: &str = "opts";
    pub const TIMESTAMP: &str = "timestamp";
    pub const DELAY: &str = "delay";
    pub const PRIORITY: &str = "priority";
    pub const PROGRESS: &str = "progress";
    pub const RETURN_VALUE: &str = "returnvalue";
    pub const FAILED_REASON: &str = "failedReason";
    pub const STACKTRACE: &str = "stacktrace";
    pub const ATTEMPTS_MADE: &str = "attemptsMade";
    pub const ATTEMPTS_STARTED: &str = "attemptsStarted";
    pub const STALLED_COUNTER: &str = "stc";
    pub const PROCESSED_ON: &str = "processedOn";
    pub const FINISHED_ON: &str = "finishedOn";
    pub const PROCESSED_BY: &str = "pb";
    pub const PARENT_KEY: &str = "parentKey";
    pub const PARENT: &str = "parent";
    pub const REPEAT_JOB_KEY: &str = "repeatJobKey";
    pub const DEDUPLICATION_ID: &str = "deduplicationId";
}

/// Primary state of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// In `wait` or, while the queue is paused, in `paused`.
    Waiting,
    Prioritized,
    Delayed,
    Active,
    WaitingChildren,
    Completed,
    Failed,
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Prioritized => "prioritized",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::WaitingChildren => "waiting-children",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Unknown => "unknown",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned when adding a job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    /// `false` when a deduplication key or an existing custom id absorbed
    /// the add; `id` then names the job that already exists.
    pub accepted: bool,
}

/// In-memory projection of a job hash.
///
/// Fields are only ever written back through the script protocol; mutating
/// this struct has no effect on the store.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub opts: JobOptions,
    pub timestamp: i64,
    pub delay: i64,
    pub priority: u32,
    pub progress: Value,
    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
    pub stacktrace: Vec<String>,
    pub attempts_made: u32,
    pub attempts_started: u32,
    pub stalled_counter: u32,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
    pub processed_by: Option<String>,
    pub parent_key: Option<String>,
    pub parent: Option<ParentRef>,
    pub repeat_job_key: Option<String>,
    pub deduplication_id: Option<String>,
    /// Lock token when this copy was claimed by a worker.
    pub token: Option<LockToken>,
    queue: QueueKeys,
}

fn parse_num<T: std::str::FromStr + Default>(
    hash: &HashMap<String, String>,
    name: &str,
) -> T {
    hash.get(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

fn parse_opt_num(hash: &HashMap<String, String>, name: &str) -> Option<i64> {
    hash.get(name).and_then(|value| value.parse().ok())
}

fn parse_json(hash: &HashMap<String, String>, name: &str) -> QueueResult<Option<Value>> {
    match hash.get(name) {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

impl Job {
    /// Decode a job from its stored hash.
    pub fn from_hash(
        queue: &QueueKeys,
        hash: &HashMap<String, String>,
    ) -> QueueResult<Self> {
        let id = hash
            .get(field::ID)
            .cloned()
            .ok_or_else(|| QueueError::InvalidOptions("job hash without id".into()))?;
        let opts = match hash.get(field::OPTS) {
            Some(raw) => serde_json::from_str(raw)?,
            None => JobOptions::default(),
        };
        let stacktrace = match hash.get(field::STACKTRACE) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        let parent = match hash.get(field::PARENT) {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };

        Ok(Self {
            name: hash.get(field::NAME).cloned().unwrap_or_default(),
            data: parse_json(hash, field::DATA)?.unwrap_or(Value::Null),
            opts,
            timestamp: parse_num(hash, field::TIMESTAMP),
            delay: parse_num(hash, field::DELAY),
            priority: parse_num(hash, field::PRIORITY),
            progress: parse_json(hash, field::PROGRESS)?
                .unwrap_or(Value::from(0)),
            return_value: parse_json(hash, field::RETURN_VALUE)?,
            failed_reason: hash.get(field::FAILED_REASON).cloned(),
            stacktrace,
            attempts_made: parse_num(hash, field::ATTEMPTS_MADE),
            attempts_started: parse_num(hash, field::ATTEMPTS_STARTED),
            stalled_counter: parse_num(hash, field::STALLED_COUNTER),
            processed_on: parse_opt_num(hash, field::PROCESSED_ON),
            finished_on: parse_opt_num(hash, field::FINISHED_ON),
            processed_by: hash.get(field::PROCESSED_BY).cloned(),
            parent_key: hash.get(field::PARENT_KEY).cloned(),
            parent,
            repeat_job_key: hash.get(field::REPEAT_JOB_KEY).cloned(),
            deduplication_id: hash.get(field::DEDUPLICATION_ID).cloned(),
            token: None,
            queue: queue.clone(),
            id,
        })
    }

    pub fn queue_keys(&self) -> &QueueKeys {
        &self.queue
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Full store key of this job's hash.
    pub fn key(&self) -> String {
        self.queue.job(&self.id)
    }

    /// Reference children use to point at this job.
    pub fn as_parent(&self) -> ParentRef {
        ParentRef::new(self.id.clone(), self.queue.base())
    }

    /// Deserialize the payload into a concrete type.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Whether another failure would still be retried, attempts-wise.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made.saturating_add(1) < self.opts.max_attempts()
    }

    pub async fn state<S: Store>(
        &self,
        scripts: &Scripts<S>,
    ) -> QueueResult<JobState> {
        scripts.get_state(&self.id).await
    }

    /// Reload every field from the store.
    pub async fn refresh<S: Store>(
        &mut self,
        scripts: &Scripts<S>,
    ) -> QueueResult<()> {
        let token = self.token;
        match scripts.get_job(&self.id).await? {
            Some(fresh) => {
                *self = fresh;
                self.token = token;
                Ok(())
            }
            None => Err(QueueError::script(
                "getJob",
                self.id.clone(),
                crate::error::ScriptError::JobNotExist,
            )),
        }
    }

    pub async fn update_progress<S: Store>(
        &mut self,
        scripts: &Scripts<S>,
        progress: Value,
    ) -> QueueResult<()> {
        scripts.update_progress(&self.id, &progress).await?;
        self.progress = progress;
        Ok(())
    }

    pub async fn update_data<S: Store>(
        &mut self,
        scripts: &Scripts<S>,
        data: Value,
    ) -> QueueResult<()> {
        scripts.update_data(&self.id, &data).await?;
        self.data = data;
        Ok(())
    }

    /// Append a log line, returning the number of lines kept.
    pub async fn log<S: Store>(
        &self,
        scripts: &Scripts<S>,
        line: impl Into<String>,
    ) -> QueueResult<usize> {
        scripts
            .add_log(&self.id, line.into(), self.opts.keep_logs)
            .await
    }

    pub async fn promote<S: Store>(&mut self, scripts: &Scripts<S>) -> QueueResult<()> {
        scripts.promote(&self.id).await?;
        self.delay = 0;
        Ok(())
    }

    pub async fn change_delay<S: Store>(
        &mut self,
        scripts: &Scripts<S>,
        delay_ms: i64,
    ) -> QueueResult<()> {
        scripts.change_delay(&self.id, delay_ms).await?;
        self.delay = delay_ms;
        Ok(())
    }

    pub async fn change_priority<S: Store>(
        &mut self,
        scripts: &Scripts<S>,
        priority: u32,
        lifo: bool,
    ) -> QueueResult<()> {
        scripts.change_priority(&self.id, priority, lifo).await?;
        self.priority = priority;
        Ok(())
    }

    /// Move a finished job back to `wait`.
    pub async fn retry<S: Store>(
        &mut self,
        scripts: &Scripts<S>,
        state: JobState,
        reset_attempts: bool,
    ) -> QueueResult<()> {
        scripts.reprocess_job(&self.id, state, reset_attempts).await?;
        self.failed_reason = None;
        self.finished_on = None;
        self.processed_on = None;
        self.return_value = None;
        if reset_attempts {
            self.attempts_made = 0;
            self.attempts_started = 0;
        }
        Ok(())
    }

    /// Remove the job, refusing if it or a descendant is locked.
    pub async fn remove<S: Store>(
        &self,
        scripts: &Scripts<S>,
        remove_children: bool,
    ) -> QueueResult<bool> {
        scripts.remove_job(&self.id, remove_children).await
    }

    pub async fn extend_lock<S: Store>(
        &self,
        scripts: &Scripts<S>,
        duration_ms: u64,
    ) -> QueueResult<()> {
        let token = self.require_token("extendLock")?;
        scripts.extend_lock(&self.id, token, duration_ms).await
    }

    /// Move an active job to `delayed` until `timestamp` without charging
    /// an attempt.
    pub async fn move_to_delayed<S: Store>(
        &mut self,
        scripts: &Scripts<S>,
        timestamp: i64,
    ) -> QueueResult<()> {
        let token = self.require_token("moveToDelayed")?;
        let delay = scripts
            .move_to_delayed(&self.id, Some(token), timestamp, true, None)
            .await?;
        self.delay = delay;
        Ok(())
    }

    /// Park an active job until its children finish. Returns `false` when
    /// nothing is pending and the job stays active.
    pub async fn move_to_waiting_children<S: Store>(
        &self,
        scripts: &Scripts<S>,
    ) -> QueueResult<bool> {
        let token = self.require_token("moveToWaitingChildren")?;
        scripts.move_to_waiting_children(&self.id, Some(token)).await
    }

    fn require_token(&self, command: &'static str) -> QueueResult<LockToken> {
        self.token.ok_or_else(|| {
            QueueError::script(
                command,
                self.id.clone(),
                crate::error::ScriptError::JobLockNotExist,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> HashMap<String, String> {
        let mut hash = HashMap::new();
        hash.insert(field::ID.into(), "7".into());
        hash.insert(field::NAME.into(), "send-mail".into());
        hash.insert(field::DATA.into(), r#"{"to":"a@b.c"}"#.into());
        hash.insert(field::OPTS.into(), r#"{"attempts":3,"fpof":true}"#.into());
        hash.insert(field::TIMESTAMP.into(), "1000".into());
        hash.insert(field::ATTEMPTS_MADE.into(), "1".into());
        hash.insert(field::STACKTRACE.into(), r#"["boom"]"#.into());
        hash.insert(
            field::PARENT.into(),
            r#"{"id":"p","queueKey":"flowq:parents"}"#.into(),
        );
        hash
    }

    #[test]
    fn test_from_hash_decodes_wire_format() {
        let keys = QueueKeys::new("flowq", "mail");
        let job = Job::from_hash(&keys, &sample_hash()).unwrap();

        assert_eq!(job.id, "7");
        assert_eq!(job.name, "send-mail");
        assert_eq!(job.data["to"], "a@b.c");
        assert_eq!(job.opts.attempts, 3);
        assert!(job.opts.fail_parent_on_failure);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.stacktrace, vec!["boom".to_string()]);
        assert_eq!(job.progress, Value::from(0));
        assert_eq!(job.key(), "flowq:mail:7");
        assert_eq!(
            job.parent.as_ref().map(ParentRef::job_key).as_deref(),
            Some("flowq:parents:p")
        );
        assert!(job.has_attempts_left());
    }

    #[test]
    fn test_from_hash_requires_id() {
        let keys = QueueKeys::new("flowq", "mail");
        let mut hash = sample_hash();
        hash.remove(field::ID);
        assert!(Job::from_hash(&keys, &hash).is_err());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::WaitingChildren.to_string(), "waiting-children");
        assert!(JobState::Failed.is_finished());
        assert!(!JobState::Delayed.is_finished());
    }
}
