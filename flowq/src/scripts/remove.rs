use super::{Ctx, Scripts, is_paused, purge_job, require_job, split_job_key};
use crate::error::{QueueResult, ScriptError};
use crate::job::{JobState, field};
use crate::job_scheduler::{field as scheduler_field, iteration_job_id};
use crate::keys::QueueKeys;
use crate::store::{Commands, Store};

/// Full keys of every child ever attached to a job.
fn child_keys(cmd: &mut dyn Commands, keys: &QueueKeys, job_id: &str) -> Vec<String> {
    let mut children = cmd.smembers(&keys.dependencies(job_id));
    children.extend(cmd.hgetall(&keys.processed(job_id)).into_keys());
    children.extend(cmd.hgetall(&keys.failed_children(job_id)).into_keys());
    children.sort();
    children.dedup();
    children
}

fn is_locked(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    with_children: bool,
) -> bool {
    if cmd.exists(&keys.lock(job_id)) {
        return true;
    }
    if !with_children {
        return false;
    }
    for child_key in child_keys(cmd, keys, job_id) {
        if let Some((child_queue, child_id)) = split_job_key(cmd, &child_key) {
            if is_locked(cmd, &child_queue, &child_id, true) {
                return true;
            }
        }
    }
    false
}

fn remove_tree(cmd: &mut dyn Commands, ctx: &Ctx, job_id: &str, with_children: bool) {
    if with_children {
        for child_key in child_keys(cmd, &ctx.keys, job_id) {
            if let Some((child_queue, child_id)) = split_job_key(cmd, &child_key) {
                remove_tree(cmd, &ctx.for_queue(child_queue), &child_id, true);
            }
        }
    }
    let prev = purge_job(cmd, ctx, job_id);
    ctx.emit(cmd, "removed", job_id, &[("prev", prev.as_str().into())]);
}

/// Whether the job is the pending iteration of a live scheduler.
fn is_pending_iteration(cmd: &mut dyn Commands, keys: &QueueKeys, job_id: &str) -> bool {
    let Some(scheduler_id) = cmd.hget(&keys.job(job_id), field::REPEAT_JOB_KEY) else {
        return false;
    };
    if cmd.zscore(&keys.delayed(), job_id).is_none() {
        return false;
    }
    cmd.hget(&keys.job_scheduler(&scheduler_id), scheduler_field::NEXT)
        .and_then(|raw| raw.parse::<i64>().ok())
        .is_some_and(|next| iteration_job_id(&scheduler_id, next) == job_id)
}

fn remove_job(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    with_children: bool,
) -> Result<bool, ScriptError> {
    let keys = &ctx.keys;
    require_job(cmd, keys, job_id)?;
    if is_pending_iteration(cmd, keys, job_id) {
        return Err(ScriptError::JobBelongsToJobScheduler);
    }
    if is_locked(cmd, keys, job_id, with_children) {
        return Ok(false);
    }
    remove_tree(cmd, ctx, job_id, with_children);
    Ok(true)
}

fn obliterate(cmd: &mut dyn Commands, ctx: &Ctx, force: bool) -> Result<usize, ScriptError> {
    let keys = &ctx.keys;
    if !force && !is_paused(cmd, keys) {
        return Err(ScriptError::QueueNotPaused);
    }
    if !force && cmd.llen(&keys.active()) > 0 {
        return Err(ScriptError::ActiveJobsExist);
    }

    // Jobs with parents elsewhere must release those parents first.
    let mut job_ids: Vec<String> = Vec::new();
    for list in [keys.wait(), keys.paused(), keys.active()] {
        job_ids.extend(cmd.lrange(&list, 0, -1));
    }
    for set in [
        keys.delayed(),
        keys.prioritized(),
        keys.completed(),
        keys.failed(),
        keys.waiting_children(),
    ] {
        job_ids.extend(cmd.zrange(&set, 0, -1).into_iter().map(|(id, _)| id));
    }
    let removed = job_ids.len();
    for job_id in &job_ids {
        purge_job(cmd, ctx, job_id);
    }

    let namespace = format!("{}:", keys.base());
    for key in cmd.keys_with_prefix(&namespace) {
        cmd.del(&key);
    }
    Ok(removed)
}

/// Ordering timestamp used to age jobs in a state.
fn clean_timestamp(cmd: &mut dyn Commands, keys: &QueueKeys, job_id: &str, state: JobState) -> i64 {
    let name = match state {
        JobState::Active => field::PROCESSED_ON,
        JobState::Completed | JobState::Failed => field::FINISHED_ON,
        _ => field::TIMESTAMP,
    };
    cmd.hget(&keys.job(job_id), name)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default()
}

fn clean_jobs_in_set(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    state: JobState,
    grace_ms: i64,
    limit: usize,
) -> Vec<String> {
    let keys = &ctx.keys;
    let cutoff = cmd.now_ms() - grace_ms.max(0);
    let candidates: Vec<String> = match state {
        JobState::Waiting => {
            let mut ids = cmd.lrange(&keys.wait(), 0, -1);
            ids.extend(cmd.lrange(&keys.paused(), 0, -1));
            ids
        }
        JobState::Active => cmd.lrange(&keys.active(), 0, -1),
        JobState::Delayed => ids_of(cmd.zrange(&keys.delayed(), 0, -1)),
        JobState::Prioritized => ids_of(cmd.zrange(&keys.prioritized(), 0, -1)),
        JobState::WaitingChildren => ids_of(cmd.zrange(&keys.waiting_children(), 0, -1)),
        JobState::Completed => ids_of(cmd.zrange(&keys.completed(), 0, -1)),
        JobState::Failed => ids_of(cmd.zrange(&keys.failed(), 0, -1)),
        JobState::Unknown => Vec::new(),
    };

    let mut removed = Vec::new();
    for job_id in candidates {
        if limit > 0 && removed.len() >= limit {
            break;
        }
        if clean_timestamp(cmd, keys, &job_id, state) > cutoff {
            continue;
        }
        if cmd.exists(&keys.lock(&job_id)) || is_pending_iteration(cmd, keys, &job_id) {
            continue;
        }
        purge_job(cmd, ctx, &job_id);
        removed.push(job_id);
    }
    if !removed.is_empty() {
        ctx.emit_queue(
            cmd,
            "cleaned",
            &[("count", removed.len().to_string()), ("state", state.as_str().into())],
        );
    }
    removed
}

fn ids_of(entries: Vec<(String, i64)>) -> Vec<String> {
    entries.into_iter().map(|(id, _)| id).collect()
}

fn drain(cmd: &mut dyn Commands, ctx: &Ctx, include_delayed: bool) -> usize {
    let keys = &ctx.keys;
    let mut job_ids = cmd.lrange(&keys.wait(), 0, -1);
    job_ids.extend(cmd.lrange(&keys.paused(), 0, -1));
    job_ids.extend(ids_of(cmd.zrange(&keys.prioritized(), 0, -1)));
    if include_delayed {
        for job_id in ids_of(cmd.zrange(&keys.delayed(), 0, -1)) {
            if !is_pending_iteration(cmd, keys, &job_id) {
                job_ids.push(job_id);
            }
        }
    }
    for job_id in &job_ids {
        purge_job(cmd, ctx, job_id);
    }
    if cmd.zcard(&keys.prioritized()) == 0 {
        cmd.del(&keys.priority_counter());
    }
    job_ids.len()
}

impl<S: Store> Scripts<S> {
    /// Remove a job, optionally with its whole subtree. Returns `false`
    /// when the job or one of its descendants is locked.
    pub async fn remove_job(&self, job_id: &str, with_children: bool) -> QueueResult<bool> {
        let id = job_id.to_string();
        self.exec("removeJob", job_id, move |cmd, ctx| {
            remove_job(cmd, ctx, &id, with_children)
        })
        .await
    }

    /// Delete every key of the queue. Returns the number of jobs removed.
    pub async fn obliterate(&self, force: bool) -> QueueResult<usize> {
        let base = self.keys.base().to_string();
        self.exec("obliterate", &base, move |cmd, ctx| obliterate(cmd, ctx, force))
            .await
    }

    /// Remove up to `limit` jobs (0 for no limit) in `state` older than
    /// `grace_ms`.
    pub async fn clean_jobs_in_set(
        &self,
        state: JobState,
        grace_ms: i64,
        limit: usize,
    ) -> QueueResult<Vec<String>> {
        self.exec_infallible(move |cmd, ctx| {
            clean_jobs_in_set(cmd, ctx, state, grace_ms, limit)
        })
        .await
    }

    /// Remove every job that has not started yet.
    pub async fn drain(&self, include_delayed: bool) -> QueueResult<usize> {
        self.exec_infallible(move |cmd, ctx| drain(cmd, ctx, include_delayed))
            .await
    }
}
