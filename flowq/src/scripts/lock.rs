use super::{Ctx, STALLED_REASON, Scripts, enqueue_ready, fail_job};
use crate::error::{QueueResult, ScriptError};
use crate::job::field;
use crate::lease::LockToken;
use crate::opts::KeepJobs;
use crate::store::{Commands, Store};

/// Jobs found in `active` without a live lock during one sweep.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StalledReport {
    /// Returned to `wait`.
    pub recovered: Vec<String>,
    /// Moved to `failed` after exceeding the stalled limit.
    pub failed: Vec<String>,
}

impl StalledReport {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.failed.is_empty()
    }
}

fn extend_lock(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    token: LockToken,
    duration_ms: u64,
) -> Result<(), ScriptError> {
    let lock_key = ctx.keys.lock(job_id);
    match cmd.get(&lock_key) {
        None => Err(ScriptError::JobLockNotExist),
        Some(holder) if holder != token.to_string() => Err(ScriptError::JobLockMismatch),
        Some(_) => {
            cmd.pexpire(&lock_key, duration_ms as i64);
            Ok(())
        }
    }
}

fn move_stalled_jobs_to_wait(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    max_stalled_count: u32,
    stalled_interval_ms: u64,
    fallback_keep: Option<&KeepJobs>,
) -> StalledReport {
    let keys = &ctx.keys;
    let now = cmd.now_ms();
    let mut report = StalledReport::default();
    if !cmd.set_nx(
        &keys.stalled_check(),
        &now.to_string(),
        Some(stalled_interval_ms as i64),
    ) {
        return report;
    }

    for job_id in cmd.lrange(&keys.active(), 0, -1) {
        if cmd.exists(&keys.lock(&job_id)) {
            continue;
        }
        cmd.lrem(&keys.active(), 1, &job_id);
        let job_key = keys.job(&job_id);
        if !cmd.exists(&job_key) {
            continue;
        }
        let stalled = cmd.hincrby(&job_key, field::STALLED_COUNTER, 1);
        if stalled > i64::from(max_stalled_count) {
            fail_job(cmd, ctx, &job_id, STALLED_REASON, "active", now, fallback_keep);
            report.failed.push(job_id);
        } else {
            // Recovered jobs run next.
            enqueue_ready(cmd, keys, &job_id, true);
            ctx.emit(cmd, "stalled", &job_id, &[]);
            report.recovered.push(job_id);
        }
    }
    report
}

impl<S: Store> Scripts<S> {
    /// Refresh a lock held under `token`.
    pub async fn extend_lock(
        &self,
        job_id: &str,
        token: LockToken,
        duration_ms: u64,
    ) -> QueueResult<()> {
        let id = job_id.to_string();
        self.exec("extendLock", job_id, move |cmd, ctx| {
            extend_lock(cmd, ctx, &id, token, duration_ms)
        })
        .await
    }

    /// Refresh several locks in one script. Returns the ids whose lock was
    /// lost or taken over.
    pub async fn extend_locks(
        &self,
        locks: Vec<(String, LockToken)>,
        duration_ms: u64,
    ) -> QueueResult<Vec<String>> {
        self.exec_infallible(move |cmd, ctx| {
            locks
                .into_iter()
                .filter(|(job_id, token)| {
                    extend_lock(cmd, ctx, job_id, *token, duration_ms).is_err()
                })
                .map(|(job_id, _)| job_id)
                .collect()
        })
        .await
    }

    /// Recover jobs whose worker stopped renewing their lock. Runs at most
    /// once per `stalled_interval_ms` across all callers.
    pub async fn move_stalled_jobs_to_wait(
        &self,
        max_stalled_count: u32,
        stalled_interval_ms: u64,
        fallback_keep: Option<KeepJobs>,
    ) -> QueueResult<StalledReport> {
        self.exec_infallible(move |cmd, ctx| {
            move_stalled_jobs_to_wait(
                cmd,
                ctx,
                max_stalled_count,
                stalled_interval_ms,
                fallback_keep.as_ref(),
            )
        })
        .await
    }
}
