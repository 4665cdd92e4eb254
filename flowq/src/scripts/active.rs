use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Ctx, PROMOTE_BATCH, Scripts, add_base_marker, add_delayed, is_maxed, is_paused,
    next_delayed_timestamp, promote_due_delayed, scheduler::schedule_next_iteration,
};
use crate::error::QueueResult;
use crate::job::{Job, JobState, field};
use crate::keys::QueueKeys;
use crate::lease::LockToken;
use crate::store::{Commands, Store};

/// Rate limiter settings applied while claiming.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LimiterArgs {
    /// Jobs allowed per window.
    pub max: u64,
    pub duration_ms: u64,
    /// Limit per value of this field of the job data instead of queue-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
}

/// Arguments of a claim.
#[derive(Clone, Debug)]
pub struct FetchArgs {
    pub token: LockToken,
    pub lock_duration_ms: u64,
    pub worker_name: Option<String>,
    pub limiter: Option<LimiterArgs>,
}

/// What a claim produced.
#[derive(Clone, Debug, PartialEq)]
pub enum Fetched {
    Job(Box<Job>),
    /// The queue-wide window is exhausted for this many milliseconds.
    RateLimited(i64),
    /// Nothing claimable. Carries the due time of the earliest delayed job.
    Idle { next_delayed: Option<i64> },
}

/// Raw result of the claim script, decoded outside of it.
#[derive(Clone, Debug)]
pub(crate) enum Claim {
    Job(HashMap<String, String>),
    RateLimited(i64),
    Idle { next_delayed: Option<i64> },
}

impl Claim {
    pub(crate) fn decode(self, keys: &QueueKeys, token: LockToken) -> QueueResult<Fetched> {
        Ok(match self {
            Claim::Job(hash) => {
                let mut job = Job::from_hash(keys, &hash)?;
                job.token = Some(token);
                Fetched::Job(Box::new(job))
            }
            Claim::RateLimited(ttl) => Fetched::RateLimited(ttl),
            Claim::Idle { next_delayed } => Fetched::Idle { next_delayed },
        })
    }
}

/// Remaining window when the counter at `key` has reached `max`, else 0.
fn limiter_ttl(cmd: &mut dyn Commands, key: &str, max: i64) -> i64 {
    let used: i64 = cmd
        .get(key)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    if used < max {
        return 0;
    }
    match cmd.pttl(key) {
        ttl if ttl > 0 => ttl,
        _ => 0,
    }
}

fn count_in_window(cmd: &mut dyn Commands, key: &str, duration_ms: u64) {
    if cmd.incr_by(key, 1) == 1 {
        cmd.pexpire(key, duration_ms as i64);
    }
}

/// Group value of a job: the string or number stored under `group_key`.
fn group_of(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    group_key: &str,
) -> Option<String> {
    let data: Value = cmd
        .hget(&keys.job(job_id), field::DATA)
        .and_then(|raw| serde_json::from_str(&raw).ok())?;
    match data.get(group_key)? {
        Value::String(group) => Some(group.clone()),
        Value::Number(group) => Some(group.to_string()),
        _ => None,
    }
}

fn pop_next(cmd: &mut dyn Commands, keys: &QueueKeys) -> Option<String> {
    if let Some(job_id) = cmd.rpoplpush(&keys.wait(), &keys.active()) {
        return Some(job_id);
    }
    let (job_id, _) = cmd.zpopmin(&keys.prioritized())?;
    cmd.lpush(&keys.active(), &job_id);
    Some(job_id)
}

/// Claim the next job for `args.token`.
pub(crate) fn move_to_active(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    args: &FetchArgs,
) -> Claim {
    let keys = &ctx.keys;
    let now = cmd.now_ms();
    promote_due_delayed(cmd, ctx, now, PROMOTE_BATCH);

    if is_paused(cmd, keys) || is_maxed(cmd, keys) {
        return Claim::Idle { next_delayed: None };
    }

    let queue_max = match &args.limiter {
        Some(limiter) if limiter.group_key.is_none() => limiter.max as i64,
        _ => i64::MAX,
    };
    let ttl = limiter_ttl(cmd, &keys.limiter(), queue_max);
    if ttl > 0 {
        return Claim::RateLimited(ttl);
    }

    // Each pass either claims a job or parks one whose group is exhausted.
    let candidates = cmd.llen(&keys.wait()) + cmd.zcard(&keys.prioritized());
    for _ in 0..candidates.max(1) {
        let Some(job_id) = pop_next(cmd, keys) else {
            break;
        };
        let job_key = keys.job(&job_id);
        if !cmd.exists(&job_key) {
            cmd.lrem(&keys.active(), 1, &job_id);
            continue;
        }

        if let Some(limiter) = &args.limiter {
            match &limiter.group_key {
                Some(group_key) => {
                    if let Some(group) = group_of(cmd, keys, &job_id, group_key) {
                        let group_limiter = keys.limiter_group(&group);
                        let ttl = limiter_ttl(cmd, &group_limiter, limiter.max as i64);
                        if ttl > 0 {
                            cmd.lrem(&keys.active(), 1, &job_id);
                            add_delayed(cmd, keys, &job_id, now.saturating_add(ttl));
                            ctx.emit(
                                cmd,
                                "delayed",
                                &job_id,
                                &[("delay", now.saturating_add(ttl).to_string())],
                            );
                            continue;
                        }
                        count_in_window(cmd, &group_limiter, limiter.duration_ms);
                    }
                }
                None => count_in_window(cmd, &keys.limiter(), limiter.duration_ms),
            }
        }

        cmd.set_px(
            &keys.lock(&job_id),
            &args.token.to_string(),
            args.lock_duration_ms as i64,
        );
        cmd.hincrby(&job_key, field::ATTEMPTS_STARTED, 1);
        cmd.hset(&job_key, field::PROCESSED_ON, &now.to_string());
        if let Some(worker) = &args.worker_name {
            cmd.hset(&job_key, field::PROCESSED_BY, worker);
        }
        ctx.emit(
            cmd,
            "active",
            &job_id,
            &[("prev", JobState::Waiting.as_str().into())],
        );

        if let Some(scheduler_id) = cmd.hget(&job_key, field::REPEAT_JOB_KEY) {
            schedule_next_iteration(cmd, ctx, &scheduler_id, &job_id);
        }

        if !is_maxed(cmd, keys)
            && (cmd.llen(&keys.wait()) > 0 || cmd.zcard(&keys.prioritized()) > 0)
        {
            add_base_marker(cmd, keys);
        }
        return Claim::Job(cmd.hgetall(&job_key));
    }

    Claim::Idle {
        next_delayed: next_delayed_timestamp(cmd, keys),
    }
}

impl<S: Store> Scripts<S> {
    /// Claim the next eligible job, if any.
    pub async fn move_to_active(&self, args: &FetchArgs) -> QueueResult<Fetched> {
        let script_args = args.clone();
        let claim = self
            .exec_infallible(move |cmd, ctx| move_to_active(cmd, ctx, &script_args))
            .await?;
        claim.decode(&self.keys, args.token)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::NewJob;
    use super::super::test_support::scripts_at;
    use super::*;
    use crate::opts::JobOptions;

    fn fetch_args(limiter: Option<LimiterArgs>) -> FetchArgs {
        FetchArgs {
            token: LockToken::new(),
            lock_duration_ms: 30_000,
            worker_name: Some("w1".into()),
            limiter,
        }
    }

    #[tokio::test]
    async fn test_claims_in_fifo_order_and_locks() {
        let (scripts, _clock) = scripts_at(10);
        for name in ["a", "b"] {
            scripts
                .add_job(&NewJob::new(name, json!({}), JobOptions::new()))
                .await
                .unwrap();
        }
        let args = fetch_args(None);
        let Fetched::Job(job) = scripts.move_to_active(&args).await.unwrap() else {
            panic!("expected a job");
        };
        assert_eq!(job.name, "a");
        assert_eq!(job.attempts_started, 1);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.processed_on, Some(10));
        assert_eq!(job.token, Some(args.token));

        let lock = scripts
            .exec_infallible(|cmd, ctx| cmd.get(&ctx.keys.lock("1")))
            .await
            .unwrap();
        assert_eq!(lock, Some(args.token.to_string()));
    }

    #[tokio::test]
    async fn test_wait_runs_before_prioritized() {
        let (scripts, _clock) = scripts_at(0);
        scripts
            .add_job(&NewJob::new("p", json!({}), JobOptions::new().with_priority(1)))
            .await
            .unwrap();
        scripts
            .add_job(&NewJob::new("w", json!({}), JobOptions::new()))
            .await
            .unwrap();
        let Fetched::Job(job) = scripts.move_to_active(&fetch_args(None)).await.unwrap()
        else {
            panic!("expected a job");
        };
        assert_eq!(job.name, "w");
    }

    #[tokio::test]
    async fn test_idle_reports_next_delayed() {
        let (scripts, _clock) = scripts_at(0);
        scripts
            .add_job(&NewJob::new("d", json!({}), JobOptions::new().with_delay(700)))
            .await
            .unwrap();
        let fetched = scripts.move_to_active(&fetch_args(None)).await.unwrap();
        assert_eq!(
            fetched,
            Fetched::Idle {
                next_delayed: Some(700)
            }
        );
    }

    #[tokio::test]
    async fn test_queue_limiter_blocks_before_pop() {
        let (scripts, clock) = scripts_at(0);
        for _ in 0..3 {
            scripts
                .add_job(&NewJob::new("x", json!({}), JobOptions::new()))
                .await
                .unwrap();
        }
        let limiter = Some(LimiterArgs {
            max: 2,
            duration_ms: 1_000,
            group_key: None,
        });
        let args = fetch_args(limiter);
        assert!(matches!(
            scripts.move_to_active(&args).await.unwrap(),
            Fetched::Job(_)
        ));
        clock.advance(100);
        assert!(matches!(
            scripts.move_to_active(&args).await.unwrap(),
            Fetched::Job(_)
        ));
        assert_eq!(
            scripts.move_to_active(&args).await.unwrap(),
            Fetched::RateLimited(900)
        );
        let waiting = scripts
            .exec_infallible(|cmd, ctx| cmd.llen(&ctx.keys.wait()))
            .await
            .unwrap();
        assert_eq!(waiting, 1);

        clock.advance(900);
        assert!(matches!(
            scripts.move_to_active(&args).await.unwrap(),
            Fetched::Job(_)
        ));
    }

    #[tokio::test]
    async fn test_group_limiter_parks_exhausted_group() {
        let (scripts, _clock) = scripts_at(0);
        for group in ["a", "a", "b"] {
            scripts
                .add_job(&NewJob::new("x", json!({ "tenant": group }), JobOptions::new()))
                .await
                .unwrap();
        }
        let args = fetch_args(Some(LimiterArgs {
            max: 1,
            duration_ms: 1_000,
            group_key: Some("tenant".into()),
        }));
        let first = scripts.move_to_active(&args).await.unwrap();
        let second = scripts.move_to_active(&args).await.unwrap();
        let (Fetched::Job(first), Fetched::Job(second)) = (first, second) else {
            panic!("expected two jobs");
        };
        assert_eq!(first.data["tenant"], "a");
        assert_eq!(second.data["tenant"], "b");

        let state = scripts.get_state("2").await.unwrap();
        assert_eq!(state, JobState::Delayed);
    }
}
