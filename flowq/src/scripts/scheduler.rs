use std::collections::HashMap;

use super::{Ctx, EncodedJob, Scripts, add_encoded, locate, purge_job};
use crate::error::QueueResult;
use crate::job::JobState;
use crate::job_scheduler::{
    JobScheduler, JobTemplate, RepeatOptions, field, iteration_job_id, next_run,
};
use crate::opts::JobOptions;
use crate::store::{Commands, Store};

fn scheduler_next(hash: &HashMap<String, String>) -> Option<i64> {
    hash.get(field::NEXT).and_then(|raw| raw.parse().ok())
}

fn scheduler_iterations(hash: &HashMap<String, String>) -> u32 {
    hash.get(field::ITERATIONS)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default()
}

/// Drop the pending iteration unless a worker already holds it. Returns
/// whether an iteration was dropped.
fn discard_pending(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    scheduler_id: &str,
    next: i64,
) -> bool {
    let pending = iteration_job_id(scheduler_id, next);
    match locate(cmd, &ctx.keys, &pending) {
        JobState::Delayed | JobState::Waiting | JobState::Prioritized => {
            purge_job(cmd, ctx, &pending);
            true
        }
        _ => false,
    }
}

fn stop_scheduler(cmd: &mut dyn Commands, ctx: &Ctx, scheduler_id: &str) {
    cmd.hdel(&ctx.keys.job_scheduler(scheduler_id), field::NEXT);
    cmd.zrem(&ctx.keys.repeat(), scheduler_id);
}

/// Create the iteration due at `at` from the stored template.
fn create_iteration(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    scheduler_id: &str,
    at: i64,
) -> Option<String> {
    let keys = &ctx.keys;
    let record_key = keys.job_scheduler(scheduler_id);
    let now = cmd.now_ms();
    let name = cmd.hget(&record_key, field::NAME)?;
    let data = cmd
        .hget(&record_key, field::DATA)
        .unwrap_or_else(|| "null".into());
    let mut opts: JobOptions = cmd
        .hget(&record_key, field::OPTS)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    let job_id = iteration_job_id(scheduler_id, at);
    opts.job_id = Some(job_id.clone());
    opts.timestamp = Some(now);
    opts.delay = at.saturating_sub(now).max(0);
    opts.repeat = None;
    opts.parent = None;
    let opts_json = serde_json::to_string(&opts).ok()?;

    let encoded = EncodedJob {
        keys: keys.clone(),
        name,
        data,
        opts,
        opts_json,
        parent: None,
        waiting_children: false,
        repeat_job_key: Some(scheduler_id.to_string()),
    };
    let outcome = add_encoded(cmd, ctx, &encoded).ok()?;
    if outcome.is_created() {
        cmd.hincrby(&record_key, field::ITERATIONS, 1);
    }
    cmd.hset(&record_key, field::NEXT, &at.to_string());
    cmd.zadd(&keys.repeat(), at, scheduler_id);
    Some(job_id)
}

/// Advance a scheduler after its pending iteration was claimed.
///
/// Claims of anything but the pending iteration are ignored, so stale or
/// duplicated iterations never fork the schedule.
pub(crate) fn schedule_next_iteration(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    scheduler_id: &str,
    claimed_id: &str,
) {
    let record = cmd.hgetall(&ctx.keys.job_scheduler(scheduler_id));
    let Some(current) = scheduler_next(&record) else {
        return;
    };
    if iteration_job_id(scheduler_id, current) != claimed_id {
        return;
    }
    let Some(repeat) = record
        .get(field::REPEAT)
        .and_then(|raw| serde_json::from_str::<RepeatOptions>(raw).ok())
    else {
        return;
    };
    if repeat
        .limit
        .is_some_and(|limit| scheduler_iterations(&record) >= limit)
    {
        stop_scheduler(cmd, ctx, scheduler_id);
        return;
    }
    let now = cmd.now_ms();
    match next_run(&repeat, now, Some(current)).ok().flatten() {
        Some(at) => {
            if create_iteration(cmd, ctx, scheduler_id, at).is_none() {
                stop_scheduler(cmd, ctx, scheduler_id);
            }
        }
        None => stop_scheduler(cmd, ctx, scheduler_id),
    }
}

/// Scheduler definition with payloads already encoded.
struct EncodedScheduler {
    repeat: RepeatOptions,
    repeat_json: String,
    name: String,
    data_json: String,
    opts_json: String,
}

fn upsert_job_scheduler(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    scheduler_id: &str,
    scheduler: &EncodedScheduler,
) -> Option<String> {
    let record_key = ctx.keys.job_scheduler(scheduler_id);
    let record = cmd.hgetall(&record_key);
    let mut iterations = scheduler_iterations(&record);
    if let Some(next) = scheduler_next(&record) {
        if discard_pending(cmd, ctx, scheduler_id, next) {
            iterations = iterations.saturating_sub(1);
        }
    }

    cmd.hset(&record_key, field::NAME, &scheduler.name);
    cmd.hset(&record_key, field::DATA, &scheduler.data_json);
    cmd.hset(&record_key, field::OPTS, &scheduler.opts_json);
    cmd.hset(&record_key, field::REPEAT, &scheduler.repeat_json);
    cmd.hset(&record_key, field::ITERATIONS, &iterations.to_string());

    let within_limit = scheduler
        .repeat
        .limit
        .is_none_or(|limit| iterations < limit);
    let now = cmd.now_ms();
    let next = next_run(&scheduler.repeat, now, None).ok().flatten();
    match next.filter(|_| within_limit) {
        Some(at) => create_iteration(cmd, ctx, scheduler_id, at),
        None => {
            stop_scheduler(cmd, ctx, scheduler_id);
            None
        }
    }
}

fn remove_job_scheduler(cmd: &mut dyn Commands, ctx: &Ctx, scheduler_id: &str) -> bool {
    let record_key = ctx.keys.job_scheduler(scheduler_id);
    let record = cmd.hgetall(&record_key);
    if record.is_empty() {
        return false;
    }
    if let Some(next) = scheduler_next(&record) {
        discard_pending(cmd, ctx, scheduler_id, next);
    }
    cmd.del(&record_key);
    cmd.zrem(&ctx.keys.repeat(), scheduler_id);
    true
}

impl<S: Store> Scripts<S> {
    /// Store a scheduler and create its first iteration. Returns the id of
    /// that iteration.
    pub async fn upsert_job_scheduler(
        &self,
        scheduler_id: &str,
        repeat: RepeatOptions,
        template: JobTemplate,
    ) -> QueueResult<Option<String>> {
        let encoded = EncodedScheduler {
            repeat_json: serde_json::to_string(&repeat)?,
            repeat,
            name: template.name,
            data_json: serde_json::to_string(&template.data)?,
            opts_json: serde_json::to_string(&template.opts)?,
        };
        let scheduler_id = scheduler_id.to_string();
        self.exec_infallible(move |cmd, ctx| {
            upsert_job_scheduler(cmd, ctx, &scheduler_id, &encoded)
        })
        .await
    }

    pub async fn remove_job_scheduler(&self, scheduler_id: &str) -> QueueResult<bool> {
        let scheduler_id = scheduler_id.to_string();
        self.exec_infallible(move |cmd, ctx| remove_job_scheduler(cmd, ctx, &scheduler_id))
            .await
    }

    pub async fn get_job_scheduler(
        &self,
        scheduler_id: &str,
    ) -> QueueResult<Option<JobScheduler>> {
        let record_key = self.keys.job_scheduler(scheduler_id);
        let record = self
            .exec_infallible(move |cmd, _| cmd.hgetall(&record_key))
            .await?;
        JobScheduler::from_hash(scheduler_id, &record)
    }

    /// Schedulers with a pending iteration, soonest first.
    pub async fn get_job_schedulers(&self) -> QueueResult<Vec<JobScheduler>> {
        let records = self
            .exec_infallible(|cmd, ctx| {
                cmd.zrange(&ctx.keys.repeat(), 0, -1)
                    .into_iter()
                    .map(|(id, _)| {
                        let record = cmd.hgetall(&ctx.keys.job_scheduler(&id));
                        (id, record)
                    })
                    .collect::<Vec<_>>()
            })
            .await?;
        let mut schedulers = Vec::with_capacity(records.len());
        for (id, record) in records {
            if let Some(scheduler) = JobScheduler::from_hash(&id, &record)? {
                schedulers.push(scheduler);
            }
        }
        Ok(schedulers)
    }
}
