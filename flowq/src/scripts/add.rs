use serde_json::Value;

use super::{
    Ctx, Scripts, add_delayed, add_prioritized, parent_json, push_to_wait,
};
use crate::error::{QueueResult, ScriptError};
use crate::job::{JobState, field};
use crate::keys::QueueKeys;
use crate::opts::{JobOptions, ParentRef};
use crate::store::{Commands, Store};

/// A job about to be inserted.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub name: String,
    pub data: Value,
    pub opts: JobOptions,
    /// Start in `waiting-children`; set for flow parents.
    pub waiting_children: bool,
    /// Scheduler that produced this job.
    pub repeat_job_key: Option<String>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: Value, opts: JobOptions) -> Self {
        Self {
            name: name.into(),
            data,
            opts,
            waiting_children: false,
            repeat_job_key: None,
        }
    }

    /// Serialize payloads up front so the script itself cannot fail on
    /// encoding.
    pub(crate) fn encode(&self, keys: QueueKeys) -> QueueResult<EncodedJob> {
        let mut opts = self.opts.clone();
        let parent = opts.parent.take();
        opts.repeat = None;
        Ok(EncodedJob {
            keys,
            name: self.name.clone(),
            data: serde_json::to_string(&self.data)?,
            opts_json: serde_json::to_string(&opts)?,
            opts,
            parent,
            waiting_children: self.waiting_children,
            repeat_job_key: self.repeat_job_key.clone(),
        })
    }
}

/// A [`NewJob`] with its payloads already encoded.
#[derive(Clone, Debug)]
pub(crate) struct EncodedJob {
    pub keys: QueueKeys,
    pub name: String,
    pub data: String,
    pub opts: JobOptions,
    pub opts_json: String,
    pub parent: Option<ParentRef>,
    pub waiting_children: bool,
    pub repeat_job_key: Option<String>,
}

/// Result of an add.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AddOutcome {
    /// `due` is set when the job was placed in the delayed set.
    Created {
        id: String,
        state: JobState,
        due: Option<i64>,
    },
    /// A job with the requested custom id already exists.
    Duplicate { id: String },
    /// The deduplication key is held by `id`.
    Deduplicated { id: String, dedup_id: String },
}

impl AddOutcome {
    pub fn id(&self) -> &str {
        match self {
            AddOutcome::Created { id, .. }
            | AddOutcome::Duplicate { id }
            | AddOutcome::Deduplicated { id, .. } => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, AddOutcome::Created { .. })
    }
}

/// Insert one encoded job into the queue named by its keys.
pub(crate) fn add_encoded(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job: &EncodedJob,
) -> Result<AddOutcome, ScriptError> {
    let ctx = ctx.for_queue(job.keys.clone());
    let keys = &ctx.keys;
    let now = cmd.now_ms();
    let timestamp = job.opts.timestamp.unwrap_or(now);

    let parent_key = match &job.parent {
        Some(parent) => {
            let (parent_key, parent_keys) = resolve_parent(parent)?;
            if !cmd.exists(&parent_key) {
                return Err(ScriptError::ParentJobNotExist);
            }
            Some((parent_key, parent_keys))
        }
        None => None,
    };

    if let Some(dedup) = &job.opts.deduplication {
        let dedup_key = keys.deduplication(&dedup.id);
        if let Some(existing) = cmd.get(&dedup_key) {
            if dedup.extend {
                if let Some(ttl) = dedup.ttl {
                    cmd.pexpire(&dedup_key, ttl);
                }
            }
            ctx.emit(
                cmd,
                "deduplicated",
                &existing,
                &[("deduplicationId", dedup.id.clone())],
            );
            return Ok(AddOutcome::Deduplicated {
                id: existing,
                dedup_id: dedup.id.clone(),
            });
        }
    }

    let job_id = match &job.opts.job_id {
        Some(custom) => {
            let job_key = keys.job(custom);
            if cmd.exists(&job_key) {
                let existing_parent = cmd.hget(&job_key, field::PARENT_KEY);
                if let Some((parent_key, _)) = &parent_key {
                    if existing_parent.as_ref() != Some(parent_key) {
                        return Err(ScriptError::ParentJobCannotBeReplaced);
                    }
                }
                ctx.emit(cmd, "duplicated", custom, &[]);
                return Ok(AddOutcome::Duplicate { id: custom.clone() });
            }
            custom.clone()
        }
        None => cmd.incr_by(&keys.id(), 1).to_string(),
    };

    let job_key = keys.job(&job_id);
    let delay = job.opts.delay.max(0);
    cmd.hset(&job_key, field::ID, &job_id);
    cmd.hset(&job_key, field::NAME, &job.name);
    cmd.hset(&job_key, field::DATA, &job.data);
    cmd.hset(&job_key, field::OPTS, &job.opts_json);
    cmd.hset(&job_key, field::TIMESTAMP, &timestamp.to_string());
    cmd.hset(&job_key, field::DELAY, &delay.to_string());
    cmd.hset(&job_key, field::PRIORITY, &job.opts.priority.to_string());
    if let (Some(parent), Some((parent_key, parent_keys))) = (&job.parent, &parent_key) {
        cmd.hset(&job_key, field::PARENT_KEY, parent_key);
        cmd.hset(&job_key, field::PARENT, &parent_json(parent));
        cmd.sadd(&parent_keys.dependencies(&parent.id), &job_key);
    }
    if let Some(repeat_job_key) = &job.repeat_job_key {
        cmd.hset(&job_key, field::REPEAT_JOB_KEY, repeat_job_key);
    }
    if let Some(dedup) = &job.opts.deduplication {
        cmd.hset(&job_key, field::DEDUPLICATION_ID, &dedup.id);
        cmd.set_nx(&keys.deduplication(&dedup.id), &job_id, dedup.ttl);
    }

    ctx.emit(cmd, "added", &job_id, &[("name", job.name.clone())]);

    let mut due = None;
    let state = if job.waiting_children {
        cmd.zadd(&keys.waiting_children(), timestamp, &job_id);
        ctx.emit(cmd, "waiting-children", &job_id, &[]);
        JobState::WaitingChildren
    } else if delay > 0 {
        let until = timestamp.saturating_add(delay);
        add_delayed(cmd, keys, &job_id, until);
        ctx.emit(cmd, "delayed", &job_id, &[("delay", until.to_string())]);
        due = Some(until);
        JobState::Delayed
    } else if job.opts.priority > 0 {
        add_prioritized(cmd, keys, &job_id, job.opts.priority);
        ctx.emit(cmd, "waiting", &job_id, &[]);
        JobState::Prioritized
    } else {
        push_to_wait(cmd, keys, &job_id, job.opts.lifo);
        ctx.emit(cmd, "waiting", &job_id, &[]);
        JobState::Waiting
    };

    Ok(AddOutcome::Created {
        id: job_id,
        state,
        due,
    })
}

fn resolve_parent(parent: &ParentRef) -> Result<(String, QueueKeys), ScriptError> {
    let keys = QueueKeys::from_base(&parent.queue).ok_or(ScriptError::ParentJobNotExist)?;
    Ok((parent.job_key(), keys))
}

/// Run every check [`add_encoded`] can fail on for all nodes of a flow,
/// before the first node is written.
///
/// `jobs` is ordered parents first. Only the first node's parent must exist
/// already; the others are inserted by the same script. A node that has
/// children may not reuse an existing id, and an existing child id must
/// already belong to the same parent.
pub(crate) fn check_flow(cmd: &mut dyn Commands, jobs: &[EncodedJob]) -> Result<(), ScriptError> {
    for (idx, job) in jobs.iter().enumerate() {
        let parent_key = match &job.parent {
            Some(parent) => {
                let (parent_key, _) = resolve_parent(parent)?;
                if idx == 0 && !cmd.exists(&parent_key) {
                    return Err(ScriptError::ParentJobNotExist);
                }
                Some(parent_key)
            }
            None => None,
        };
        let Some(custom) = &job.opts.job_id else {
            continue;
        };
        let job_key = job.keys.job(custom);
        if !cmd.exists(&job_key) {
            continue;
        }
        if job.waiting_children {
            return Err(ScriptError::ParentJobCannotBeReplaced);
        }
        if parent_key.is_some() && cmd.hget(&job_key, field::PARENT_KEY) != parent_key {
            return Err(ScriptError::ParentJobCannotBeReplaced);
        }
    }
    Ok(())
}

impl<S: Store> Scripts<S> {
    pub async fn add_job(&self, job: &NewJob) -> QueueResult<AddOutcome> {
        let encoded = job.encode(self.keys.clone())?;
        let job_id = job.opts.job_id.clone().unwrap_or_default();
        self.exec("addJob", &job_id, move |cmd, ctx| {
            add_encoded(cmd, ctx, &encoded)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_support::scripts_at;
    use super::*;
    use crate::opts::DeduplicationOptions;

    #[tokio::test]
    async fn test_ids_auto_increment_and_fifo() {
        let (scripts, _clock) = scripts_at(1_000);
        for n in 0..3 {
            let outcome = scripts
                .add_job(&NewJob::new("n", json!(n), JobOptions::new()))
                .await
                .unwrap();
            assert_eq!(
                outcome,
                AddOutcome::Created {
                    id: (n + 1).to_string(),
                    state: JobState::Waiting,
                    due: None,
                }
            );
        }
        let wait = scripts
            .exec_infallible(|cmd, ctx| cmd.lrange(&ctx.keys.wait(), 0, -1))
            .await
            .unwrap();
        // Workers pop from the tail.
        assert_eq!(wait, vec!["3", "2", "1"]);
    }

    #[tokio::test]
    async fn test_custom_id_duplicate() {
        let (scripts, _clock) = scripts_at(0);
        let opts = JobOptions::new().with_job_id("only-once");
        let first = scripts
            .add_job(&NewJob::new("x", Value::Null, opts.clone()))
            .await
            .unwrap();
        assert!(first.is_created());
        let second = scripts
            .add_job(&NewJob::new("x", Value::Null, opts))
            .await
            .unwrap();
        assert_eq!(
            second,
            AddOutcome::Duplicate {
                id: "only-once".into()
            }
        );
    }

    #[tokio::test]
    async fn test_deduplication_window() {
        let (scripts, clock) = scripts_at(0);
        let opts = JobOptions::new()
            .with_deduplication(DeduplicationOptions::new("d").with_ttl(1_000));
        let first = scripts
            .add_job(&NewJob::new("x", Value::Null, opts.clone()))
            .await
            .unwrap();
        let second = scripts
            .add_job(&NewJob::new("x", Value::Null, opts.clone()))
            .await
            .unwrap();
        assert_eq!(
            second,
            AddOutcome::Deduplicated {
                id: first.id().to_string(),
                dedup_id: "d".into()
            }
        );

        clock.advance(1_001);
        let third = scripts
            .add_job(&NewJob::new("x", Value::Null, opts))
            .await
            .unwrap();
        assert!(third.is_created());
    }

    #[tokio::test]
    async fn test_delayed_and_prioritized_placement() {
        let (scripts, _clock) = scripts_at(0);
        let delayed = scripts
            .add_job(&NewJob::new("d", Value::Null, JobOptions::new().with_delay(50)))
            .await
            .unwrap();
        let prioritized = scripts
            .add_job(&NewJob::new("p", Value::Null, JobOptions::new().with_priority(3)))
            .await
            .unwrap();
        assert!(matches!(
            delayed,
            AddOutcome::Created {
                state: JobState::Delayed,
                ..
            }
        ));
        assert!(matches!(
            prioritized,
            AddOutcome::Created {
                state: JobState::Prioritized,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_parent_is_rejected() {
        let (scripts, _clock) = scripts_at(0);
        let opts = JobOptions::new().with_parent(ParentRef::new("nope", "flowq:test"));
        let err = scripts
            .add_job(&NewJob::new("child", Value::Null, opts))
            .await
            .unwrap_err();
        assert_eq!(err.script_error(), Some(ScriptError::ParentJobNotExist));
    }

    #[tokio::test]
    async fn test_malformed_parent_queue_writes_nothing() {
        let (scripts, _clock) = scripts_at(0);
        let opts = JobOptions::new()
            .with_job_id("orphan")
            .with_parent(ParentRef::new("1", "no-separator"));
        let err = scripts
            .add_job(&NewJob::new("child", Value::Null, opts))
            .await
            .unwrap_err();
        assert_eq!(err.script_error(), Some(ScriptError::ParentJobNotExist));

        let written = scripts
            .exec_infallible(|cmd, ctx| cmd.keys_with_prefix(ctx.keys.base()))
            .await
            .unwrap();
        assert!(written.is_empty(), "left behind {written:?}");
    }
}
