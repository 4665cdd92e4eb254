use super::{
    Ctx, PROMOTE_BATCH, Scripts, add_delayed, add_prioritized, check_lock, enqueue_ready,
    load_opts, load_parent, promote_due_delayed, push_stacktrace, push_to_wait,
    refresh_delay_marker, require_job,
};
use crate::error::{QueueError, QueueResult, ScriptError};
use crate::job::{JobState, field};
use crate::keys::QueueKeys;
use crate::lease::LockToken;
use crate::opts::MAX_DELAY_MS;
use crate::store::{Commands, Store};

/// Failure recorded on a job that is retried rather than failed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttemptFailure {
    pub reason: String,
    pub stacktrace: Vec<String>,
}

impl AttemptFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            stacktrace: Vec::new(),
        }
    }
}

/// Take a job out of `active`, releasing its lock.
fn leave_active(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    token: Option<LockToken>,
) -> Result<(), ScriptError> {
    require_job(cmd, keys, job_id)?;
    check_lock(cmd, keys, job_id, token)?;
    if cmd.lrem(&keys.active(), -1, job_id) == 0 {
        return Err(ScriptError::JobNotInState);
    }
    cmd.del(&keys.lock(job_id));
    Ok(())
}

fn record_attempt(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    failure: Option<&AttemptFailure>,
) {
    cmd.hincrby(&keys.job(job_id), field::ATTEMPTS_MADE, 1);
    if let Some(failure) = failure {
        cmd.hset(&keys.job(job_id), field::FAILED_REASON, &failure.reason);
        let limit = load_opts(cmd, keys, job_id).stack_trace_limit;
        push_stacktrace(cmd, keys, job_id, &failure.stacktrace, limit);
    }
}

fn move_to_delayed(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    token: Option<LockToken>,
    timestamp: i64,
    skip_attempt: bool,
    failure: Option<&AttemptFailure>,
) -> Result<i64, ScriptError> {
    let keys = &ctx.keys;
    leave_active(cmd, keys, job_id, token)?;
    if !skip_attempt {
        record_attempt(cmd, keys, job_id, failure);
    }
    let now = cmd.now_ms();
    let due = timestamp.max(now);
    let delay = due - now;
    cmd.hset(&keys.job(job_id), field::DELAY, &delay.to_string());
    add_delayed(cmd, keys, job_id, due);
    ctx.emit(cmd, "delayed", job_id, &[("delay", due.to_string())]);
    Ok(delay)
}

fn retry_job(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    token: Option<LockToken>,
    failure: Option<&AttemptFailure>,
) -> Result<(), ScriptError> {
    let keys = &ctx.keys;
    leave_active(cmd, keys, job_id, token)?;
    record_attempt(cmd, keys, job_id, failure);
    let lifo = load_opts(cmd, keys, job_id).lifo;
    enqueue_ready(cmd, keys, job_id, lifo);
    ctx.emit(cmd, "waiting", job_id, &[("prev", "failed".into())]);
    Ok(())
}

/// Return a job to the head of `wait` without charging the attempt.
fn move_job_from_active_to_wait(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    token: Option<LockToken>,
) -> Result<i64, ScriptError> {
    let keys = &ctx.keys;
    leave_active(cmd, keys, job_id, token)?;
    let job_key = keys.job(job_id);
    let started: i64 = cmd
        .hget(&job_key, field::ATTEMPTS_STARTED)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    if started > 0 {
        cmd.hincrby(&job_key, field::ATTEMPTS_STARTED, -1);
    }
    let priority: u32 = cmd
        .hget(&job_key, field::PRIORITY)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    if priority > 0 {
        add_prioritized(cmd, keys, job_id, priority);
    } else {
        push_to_wait(cmd, keys, job_id, true);
    }
    ctx.emit(cmd, "waiting", job_id, &[("prev", "active".into())]);
    Ok(cmd.pttl(&keys.limiter()).max(0))
}

fn reprocess_job(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    state: JobState,
    reset_attempts: bool,
) -> Result<(), ScriptError> {
    let keys = &ctx.keys;
    require_job(cmd, keys, job_id)?;
    let set = match state {
        JobState::Completed => keys.completed(),
        JobState::Failed => keys.failed(),
        _ => return Err(ScriptError::JobNotInState),
    };
    if !cmd.zrem(&set, job_id) {
        return Err(ScriptError::JobNotInState);
    }
    let job_key = keys.job(job_id);
    for name in [
        field::FINISHED_ON,
        field::PROCESSED_ON,
        field::FAILED_REASON,
        field::RETURN_VALUE,
    ] {
        cmd.hdel(&job_key, name);
    }
    if reset_attempts {
        cmd.hset(&job_key, field::ATTEMPTS_MADE, "0");
        cmd.hset(&job_key, field::ATTEMPTS_STARTED, "0");
    }
    if let Some(parent) = load_parent(cmd, keys, job_id) {
        if let Some(parent_keys) = QueueKeys::from_base(&parent.queue) {
            cmd.zrem(&parent_keys.unsuccessful(&parent.id), &job_key);
            cmd.hdel(&parent_keys.failed_children(&parent.id), &job_key);
        }
    }
    let lifo = load_opts(cmd, keys, job_id).lifo;
    enqueue_ready(cmd, keys, job_id, lifo);
    ctx.emit(cmd, "waiting", job_id, &[("prev", state.as_str().into())]);
    Ok(())
}

fn promote(cmd: &mut dyn Commands, ctx: &Ctx, job_id: &str) -> Result<(), ScriptError> {
    let keys = &ctx.keys;
    require_job(cmd, keys, job_id)?;
    if !cmd.zrem(&keys.delayed(), job_id) {
        return Err(ScriptError::JobNotInState);
    }
    cmd.hset(&keys.job(job_id), field::DELAY, "0");
    let lifo = load_opts(cmd, keys, job_id).lifo;
    enqueue_ready(cmd, keys, job_id, lifo);
    refresh_delay_marker(cmd, keys);
    ctx.emit(cmd, "waiting", job_id, &[("prev", "delayed".into())]);
    Ok(())
}

fn promote_jobs(cmd: &mut dyn Commands, ctx: &Ctx, limit: usize) -> usize {
    let delayed = cmd.zrange(&ctx.keys.delayed(), 0, limit as i64 - 1);
    let mut promoted = 0;
    for (job_id, _) in delayed {
        if promote(cmd, ctx, &job_id).is_ok() {
            promoted += 1;
        }
    }
    promoted
}

fn change_delay(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    delay: i64,
) -> Result<(), ScriptError> {
    let keys = &ctx.keys;
    require_job(cmd, keys, job_id)?;
    if !cmd.zrem(&keys.delayed(), job_id) {
        return Err(ScriptError::JobNotInState);
    }
    let due = cmd.now_ms().saturating_add(delay.max(0));
    cmd.hset(&keys.job(job_id), field::DELAY, &delay.max(0).to_string());
    add_delayed(cmd, keys, job_id, due);
    ctx.emit(cmd, "delayed", job_id, &[("delay", due.to_string())]);
    Ok(())
}

fn change_priority(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    priority: u32,
    lifo: bool,
) -> Result<(), ScriptError> {
    let keys = &ctx.keys;
    require_job(cmd, keys, job_id)?;
    cmd.hset(&keys.job(job_id), field::PRIORITY, &priority.to_string());
    let was_ready = cmd.zrem(&keys.prioritized(), job_id)
        || cmd.lrem(&keys.wait(), 0, job_id) > 0
        || cmd.lrem(&keys.paused(), 0, job_id) > 0;
    if was_ready {
        if priority > 0 {
            add_prioritized(cmd, keys, job_id, priority);
        } else {
            push_to_wait(cmd, keys, job_id, lifo);
        }
    }
    Ok(())
}

fn move_to_waiting_children(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    token: Option<LockToken>,
) -> Result<bool, ScriptError> {
    let keys = &ctx.keys;
    require_job(cmd, keys, job_id)?;
    check_lock(cmd, keys, job_id, token)?;
    if cmd.scard(&keys.dependencies(job_id)) == 0 {
        if cmd.zcard(&keys.unsuccessful(job_id)) > 0 {
            return Err(ScriptError::JobHasFailedChildren);
        }
        return Ok(false);
    }
    if cmd.lrem(&keys.active(), -1, job_id) == 0 {
        return Err(ScriptError::JobNotInState);
    }
    cmd.del(&keys.lock(job_id));
    let now = cmd.now_ms();
    cmd.zadd(&keys.waiting_children(), now, job_id);
    ctx.emit(cmd, "waiting-children", job_id, &[("prev", "active".into())]);
    Ok(true)
}

impl<S: Store> Scripts<S> {
    /// Move an active job to `delayed` until `timestamp`. Returns the delay
    /// that was applied.
    pub async fn move_to_delayed(
        &self,
        job_id: &str,
        token: Option<LockToken>,
        timestamp: i64,
        skip_attempt: bool,
        failure: Option<AttemptFailure>,
    ) -> QueueResult<i64> {
        let id = job_id.to_string();
        self.exec("moveToDelayed", job_id, move |cmd, ctx| {
            move_to_delayed(
                cmd,
                ctx,
                &id,
                token,
                timestamp,
                skip_attempt,
                failure.as_ref(),
            )
        })
        .await
    }

    /// Charge the attempt and put an active job straight back in line.
    pub async fn retry_job(
        &self,
        job_id: &str,
        token: Option<LockToken>,
        failure: Option<AttemptFailure>,
    ) -> QueueResult<()> {
        let id = job_id.to_string();
        self.exec("retryJob", job_id, move |cmd, ctx| {
            retry_job(cmd, ctx, &id, token, failure.as_ref())
        })
        .await
    }

    /// Return an active job to `wait` uncharged. Returns the remaining rate
    /// limit window.
    pub async fn move_job_from_active_to_wait(
        &self,
        job_id: &str,
        token: Option<LockToken>,
    ) -> QueueResult<i64> {
        let id = job_id.to_string();
        self.exec("moveJobFromActiveToWait", job_id, move |cmd, ctx| {
            move_job_from_active_to_wait(cmd, ctx, &id, token)
        })
        .await
    }

    pub async fn reprocess_job(
        &self,
        job_id: &str,
        state: JobState,
        reset_attempts: bool,
    ) -> QueueResult<()> {
        let id = job_id.to_string();
        self.exec("reprocessJob", job_id, move |cmd, ctx| {
            reprocess_job(cmd, ctx, &id, state, reset_attempts)
        })
        .await
    }

    pub async fn promote(&self, job_id: &str) -> QueueResult<()> {
        let id = job_id.to_string();
        self.exec("promote", job_id, move |cmd, ctx| promote(cmd, ctx, &id))
            .await
    }

    /// Promote up to `limit` delayed jobs regardless of due time.
    pub async fn promote_jobs(&self, limit: usize) -> QueueResult<usize> {
        self.exec_infallible(move |cmd, ctx| promote_jobs(cmd, ctx, limit))
            .await
    }

    /// Promote delayed jobs that are due, one batch per call.
    pub async fn promote_due(&self) -> QueueResult<usize> {
        self.exec_infallible(|cmd, ctx| {
            let now = cmd.now_ms();
            promote_due_delayed(cmd, ctx, now, PROMOTE_BATCH)
        })
        .await
    }

    pub async fn change_delay(&self, job_id: &str, delay_ms: i64) -> QueueResult<()> {
        if !(0..=MAX_DELAY_MS).contains(&delay_ms) {
            return Err(QueueError::InvalidOptions(format!(
                "delay must be between 0 and {MAX_DELAY_MS}"
            )));
        }
        let id = job_id.to_string();
        self.exec("changeDelay", job_id, move |cmd, ctx| {
            change_delay(cmd, ctx, &id, delay_ms)
        })
        .await
    }

    pub async fn change_priority(
        &self,
        job_id: &str,
        priority: u32,
        lifo: bool,
    ) -> QueueResult<()> {
        let id = job_id.to_string();
        self.exec("changePriority", job_id, move |cmd, ctx| {
            change_priority(cmd, ctx, &id, priority, lifo)
        })
        .await
    }

    /// Park an active job until its dependencies resolve. Returns whether
    /// it was parked.
    pub async fn move_to_waiting_children(
        &self,
        job_id: &str,
        token: Option<LockToken>,
    ) -> QueueResult<bool> {
        let id = job_id.to_string();
        self.exec("moveToWaitingChildren", job_id, move |cmd, ctx| {
            move_to_waiting_children(cmd, ctx, &id, token)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_support::scripts_at;
    use super::super::{FetchArgs, FinishArgs, Fetched, NewJob};
    use super::*;
    use crate::opts::JobOptions;
    use crate::store::MemoryStore;

    async fn add_and_claim(scripts: &Scripts<MemoryStore>, token: LockToken) -> String {
        scripts
            .add_job(&NewJob::new("x", json!({}), JobOptions::new()))
            .await
            .unwrap();
        let args = FetchArgs {
            token,
            lock_duration_ms: 30_000,
            worker_name: None,
            limiter: None,
        };
        match scripts.move_to_active(&args).await.unwrap() {
            Fetched::Job(job) => job.id,
            other => panic!("expected a job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_move_to_delayed_and_promote() {
        let (scripts, _clock) = scripts_at(100);
        let token = LockToken::new();
        let id = add_and_claim(&scripts, token).await;

        let delay = scripts
            .move_to_delayed(&id, Some(token), 600, false, Some(AttemptFailure::new("later")))
            .await
            .unwrap();
        assert_eq!(delay, 500);
        let job = scripts.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.failed_reason.as_deref(), Some("later"));
        assert_eq!(scripts.get_state(&id).await.unwrap(), JobState::Delayed);

        scripts.promote(&id).await.unwrap();
        assert_eq!(scripts.get_state(&id).await.unwrap(), JobState::Waiting);
        let err = scripts.promote(&id).await.unwrap_err();
        assert_eq!(err.script_error(), Some(ScriptError::JobNotInState));
    }

    #[tokio::test]
    async fn test_rate_limited_return_is_not_charged() {
        let (scripts, _clock) = scripts_at(0);
        let token = LockToken::new();
        let id = add_and_claim(&scripts, token).await;
        scripts
            .move_job_from_active_to_wait(&id, Some(token))
            .await
            .unwrap();
        let job = scripts.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.attempts_started, 0);
        assert_eq!(scripts.get_state(&id).await.unwrap(), JobState::Waiting);
    }

    #[tokio::test]
    async fn test_reprocess_finished_job() {
        let (scripts, _clock) = scripts_at(0);
        let token = LockToken::new();
        let id = add_and_claim(&scripts, token).await;
        scripts
            .move_to_finished(&id, FinishArgs::failed(Some(token), "nope"))
            .await
            .unwrap();
        let err = scripts
            .reprocess_job(&id, JobState::Completed, false)
            .await
            .unwrap_err();
        assert_eq!(err.script_error(), Some(ScriptError::JobNotInState));

        scripts.reprocess_job(&id, JobState::Failed, true).await.unwrap();
        let job = scripts.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.failed_reason, None);
        assert_eq!(scripts.get_state(&id).await.unwrap(), JobState::Waiting);
    }

    #[tokio::test]
    async fn test_change_priority_reorders_waiting_job() {
        let (scripts, _clock) = scripts_at(0);
        scripts
            .add_job(&NewJob::new("x", json!({}), JobOptions::new()))
            .await
            .unwrap();
        scripts.change_priority("1", 4, false).await.unwrap();
        assert_eq!(scripts.get_state("1").await.unwrap(), JobState::Prioritized);
        scripts.change_priority("1", 0, false).await.unwrap();
        assert_eq!(scripts.get_state("1").await.unwrap(), JobState::Waiting);
    }

    #[tokio::test]
    async fn test_waiting_children_requires_pending_dependencies() {
        let (scripts, _clock) = scripts_at(0);
        let token = LockToken::new();
        let id = add_and_claim(&scripts, token).await;
        assert!(!scripts.move_to_waiting_children(&id, Some(token)).await.unwrap());
        assert_eq!(scripts.get_state(&id).await.unwrap(), JobState::Active);
    }
}
