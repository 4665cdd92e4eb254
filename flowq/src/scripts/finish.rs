use serde_json::Value;

use super::active::{Claim, move_to_active};
use super::{
    Ctx, FetchArgs, Fetched, Scripts, apply_keep, check_lock, fail_job, load_opts,
    load_parent, on_child_completed, push_stacktrace, release_dedup, require_job,
    signal_if_ready,
};
use crate::error::{QueueResult, ScriptError};
use crate::job::field;
use crate::lease::LockToken;
use crate::opts::KeepJobs;
use crate::store::{Commands, Store};

/// Terminal state requested by a worker.
#[derive(Clone, Debug, PartialEq)]
pub enum FinishTarget {
    Completed { return_value: Value },
    Failed { reason: String, stacktrace: Vec<String> },
}

/// Arguments of `moveToFinished`.
#[derive(Clone, Debug)]
pub struct FinishArgs {
    pub token: Option<LockToken>,
    pub target: FinishTarget,
    /// Retention applied when the job does not set its own.
    pub keep: Option<KeepJobs>,
    /// Claim the next job in the same script.
    pub fetch_next: Option<FetchArgs>,
}

impl FinishArgs {
    pub fn completed(token: Option<LockToken>, return_value: Value) -> Self {
        Self {
            token,
            target: FinishTarget::Completed { return_value },
            keep: None,
            fetch_next: None,
        }
    }

    pub fn failed(token: Option<LockToken>, reason: impl Into<String>) -> Self {
        Self {
            token,
            target: FinishTarget::Failed {
                reason: reason.into(),
                stacktrace: Vec::new(),
            },
            keep: None,
            fetch_next: None,
        }
    }

    pub fn with_keep(mut self, keep: Option<KeepJobs>) -> Self {
        self.keep = keep;
        self
    }

    pub fn with_fetch_next(mut self, fetch: FetchArgs) -> Self {
        self.fetch_next = Some(fetch);
        self
    }
}

/// Encoded return value or failure; built outside the script.
enum EncodedTarget {
    Completed { return_value: String },
    Failed { reason: String, stacktrace: Vec<String> },
}

fn move_to_finished(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    token: Option<LockToken>,
    target: &EncodedTarget,
    fallback_keep: Option<&KeepJobs>,
    fetch_next: Option<&FetchArgs>,
) -> Result<Option<Claim>, ScriptError> {
    let keys = &ctx.keys;
    require_job(cmd, keys, job_id)?;
    check_lock(cmd, keys, job_id, token)?;
    if cmd.lpos(&keys.active(), job_id).is_none() {
        return Err(ScriptError::JobNotInState);
    }
    if let EncodedTarget::Completed { .. } = target {
        if cmd.scard(&keys.dependencies(job_id)) > 0 {
            return Err(ScriptError::JobPendingDependencies);
        }
        if cmd.zcard(&keys.unsuccessful(job_id)) > 0 {
            return Err(ScriptError::JobHasFailedChildren);
        }
    }

    let now = cmd.now_ms();
    let job_key = keys.job(job_id);
    cmd.del(&keys.lock(job_id));
    cmd.lrem(&keys.active(), -1, job_id);
    cmd.hincrby(&job_key, field::ATTEMPTS_MADE, 1);
    let opts = load_opts(cmd, keys, job_id);

    match target {
        EncodedTarget::Completed { return_value } => {
            cmd.hset(&job_key, field::RETURN_VALUE, return_value);
            cmd.hset(&job_key, field::FINISHED_ON, &now.to_string());
            cmd.zadd(&keys.completed(), now, job_id);
            ctx.emit(
                cmd,
                "completed",
                job_id,
                &[("returnvalue", return_value.clone()), ("prev", "active".into())],
            );
            release_dedup(cmd, keys, job_id);
            if let Some(parent) = load_parent(cmd, keys, job_id) {
                on_child_completed(cmd, ctx, &job_key, &parent, return_value);
            }
            let keep = opts.remove_on_complete.as_ref().or(fallback_keep);
            apply_keep(cmd, ctx, &keys.completed(), keep, job_id, now);
        }
        EncodedTarget::Failed { reason, stacktrace } => {
            push_stacktrace(cmd, keys, job_id, stacktrace, opts.stack_trace_limit);
            fail_job(cmd, ctx, job_id, reason, "active", now, fallback_keep);
        }
    }

    signal_if_ready(cmd, keys);
    let next = match fetch_next {
        Some(args) => Some(move_to_active(cmd, ctx, args)),
        None => None,
    };
    if cmd.llen(&keys.wait()) == 0
        && cmd.zcard(&keys.prioritized()) == 0
        && !matches!(next, Some(Claim::Job(_)))
    {
        ctx.emit_queue(cmd, "drained", &[]);
    }
    Ok(next)
}

impl<S: Store> Scripts<S> {
    /// Move an active job to `completed` or `failed`. Returns the next job
    /// when `fetch_next` was requested.
    pub async fn move_to_finished(
        &self,
        job_id: &str,
        args: FinishArgs,
    ) -> QueueResult<Option<Fetched>> {
        let target = match args.target {
            FinishTarget::Completed { return_value } => EncodedTarget::Completed {
                return_value: serde_json::to_string(&return_value)?,
            },
            FinishTarget::Failed { reason, stacktrace } => {
                EncodedTarget::Failed { reason, stacktrace }
            }
        };
        let id = job_id.to_string();
        let keep = args.keep;
        let fetch = args.fetch_next;
        let next_token = fetch.as_ref().map(|fetch| fetch.token);
        let claim = self
            .exec("moveToFinished", job_id, move |cmd, ctx| {
                move_to_finished(
                    cmd,
                    ctx,
                    &id,
                    args.token,
                    &target,
                    keep.as_ref(),
                    fetch.as_ref(),
                )
            })
            .await?;
        match (claim, next_token) {
            (Some(claim), Some(token)) => Ok(Some(claim.decode(&self.keys, token)?)),
            _ => Ok(None),
        }
    }
}
