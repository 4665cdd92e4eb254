use std::collections::HashMap;

use serde_json::Value;

use super::{
    Ctx, META_CONCURRENCY, META_PAUSED, Scripts, global_concurrency, is_paused, job_hash,
    locate, refresh_delay_marker, require_job, signal_if_ready,
};
use crate::error::{QueueResult, ScriptError};
use crate::job::{Job, JobState, field};
use crate::keys::QueueKeys;
use crate::queue::JobCounts;
use crate::store::{Commands, StreamEntry, Store};

/// Raw dependency bookkeeping of a parent job. Child entries are full job
/// keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dependencies {
    /// Children still pending.
    pub pending: Vec<String>,
    /// Completed children and their encoded return values.
    pub processed: HashMap<String, String>,
    /// Failed children whose failure was recorded on the parent.
    pub failed: HashMap<String, String>,
    /// Failed children blocking the parent.
    pub unsuccessful: Vec<String>,
}

fn pause(cmd: &mut dyn Commands, ctx: &Ctx) -> bool {
    let keys = &ctx.keys;
    if is_paused(cmd, keys) {
        return false;
    }
    cmd.hset(&keys.meta(), META_PAUSED, "1");
    if cmd.exists(&keys.wait()) {
        cmd.rename(&keys.wait(), &keys.paused());
    }
    cmd.del(&keys.marker());
    ctx.emit_queue(cmd, "paused", &[]);
    true
}

fn resume(cmd: &mut dyn Commands, ctx: &Ctx) -> bool {
    let keys = &ctx.keys;
    if !is_paused(cmd, keys) {
        return false;
    }
    cmd.hdel(&keys.meta(), META_PAUSED);
    if cmd.exists(&keys.paused()) {
        cmd.rename(&keys.paused(), &keys.wait());
    }
    signal_if_ready(cmd, keys);
    refresh_delay_marker(cmd, keys);
    ctx.emit_queue(cmd, "resumed", &[]);
    true
}

fn counts(cmd: &mut dyn Commands, keys: &QueueKeys) -> JobCounts {
    JobCounts {
        waiting: cmd.llen(&keys.wait()) + cmd.llen(&keys.paused()),
        prioritized: cmd.zcard(&keys.prioritized()),
        delayed: cmd.zcard(&keys.delayed()),
        active: cmd.llen(&keys.active()),
        waiting_children: cmd.zcard(&keys.waiting_children()),
        completed: cmd.zcard(&keys.completed()),
        failed: cmd.zcard(&keys.failed()),
        paused: is_paused(cmd, keys),
    }
}

fn reversed(mut ids: Vec<String>) -> Vec<String> {
    ids.reverse();
    ids
}

fn ids_of(entries: Vec<(String, i64)>) -> Vec<String> {
    entries.into_iter().map(|(id, _)| id).collect()
}

/// Ids in `state`: pending states in the order they will run, finished
/// states newest first.
fn job_ids(cmd: &mut dyn Commands, keys: &QueueKeys, state: JobState) -> Vec<String> {
    match state {
        JobState::Waiting => {
            let list = if is_paused(cmd, keys) {
                keys.paused()
            } else {
                keys.wait()
            };
            reversed(cmd.lrange(&list, 0, -1))
        }
        JobState::Active => reversed(cmd.lrange(&keys.active(), 0, -1)),
        JobState::Prioritized => ids_of(cmd.zrange(&keys.prioritized(), 0, -1)),
        JobState::Delayed => ids_of(cmd.zrange(&keys.delayed(), 0, -1)),
        JobState::WaitingChildren => ids_of(cmd.zrange(&keys.waiting_children(), 0, -1)),
        JobState::Completed => ids_of(cmd.zrevrange(&keys.completed(), 0, -1)),
        JobState::Failed => ids_of(cmd.zrevrange(&keys.failed(), 0, -1)),
        JobState::Unknown => Vec::new(),
    }
}

fn add_log(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    line: &str,
    keep: Option<usize>,
) -> Result<usize, ScriptError> {
    require_job(cmd, keys, job_id)?;
    let logs = keys.logs(job_id);
    cmd.rpush(&logs, line);
    if let Some(keep) = keep {
        if keep == 0 {
            cmd.del(&logs);
        } else {
            cmd.ltrim(&logs, -(keep as i64), -1);
        }
    }
    Ok(cmd.llen(&logs))
}

impl<S: Store> Scripts<S> {
    /// Stop handing out jobs. Returns `false` when already paused.
    pub async fn pause(&self) -> QueueResult<bool> {
        self.exec_infallible(pause).await
    }

    pub async fn resume(&self) -> QueueResult<bool> {
        self.exec_infallible(resume).await
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        self.exec_infallible(|cmd, ctx| is_paused(cmd, &ctx.keys)).await
    }

    /// Current state of a job, [`JobState::Unknown`] when it does not exist.
    pub async fn get_state(&self, job_id: &str) -> QueueResult<JobState> {
        let id = job_id.to_string();
        self.exec_infallible(move |cmd, ctx| locate(cmd, &ctx.keys, &id))
            .await
    }

    pub async fn get_counts(&self) -> QueueResult<JobCounts> {
        self.exec_infallible(|cmd, ctx| counts(cmd, &ctx.keys)).await
    }

    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        let id = job_id.to_string();
        let hash = self
            .exec_infallible(move |cmd, ctx| job_hash(cmd, &ctx.keys, &id))
            .await?;
        hash.map(|hash| Job::from_hash(&self.keys, &hash)).transpose()
    }

    /// Jobs in `state` between positions `start` and `end` inclusive.
    pub async fn get_jobs(
        &self,
        state: JobState,
        start: usize,
        end: usize,
    ) -> QueueResult<Vec<Job>> {
        let hashes = self
            .exec_infallible(move |cmd, ctx| {
                job_ids(cmd, &ctx.keys, state)
                    .into_iter()
                    .skip(start)
                    .take(end.saturating_sub(start).saturating_add(1))
                    .filter_map(|id| job_hash(cmd, &ctx.keys, &id))
                    .collect::<Vec<_>>()
            })
            .await?;
        hashes
            .iter()
            .map(|hash| Job::from_hash(&self.keys, hash))
            .collect()
    }

    pub async fn update_progress(&self, job_id: &str, progress: &Value) -> QueueResult<()> {
        let id = job_id.to_string();
        let encoded = serde_json::to_string(progress)?;
        self.exec("updateProgress", job_id, move |cmd, ctx| {
            require_job(cmd, &ctx.keys, &id)?;
            cmd.hset(&ctx.keys.job(&id), field::PROGRESS, &encoded);
            ctx.emit(cmd, "progress", &id, &[("data", encoded.clone())]);
            Ok(())
        })
        .await
    }

    pub async fn update_data(&self, job_id: &str, data: &Value) -> QueueResult<()> {
        let id = job_id.to_string();
        let encoded = serde_json::to_string(data)?;
        self.exec("updateData", job_id, move |cmd, ctx| {
            require_job(cmd, &ctx.keys, &id)?;
            cmd.hset(&ctx.keys.job(&id), field::DATA, &encoded);
            Ok(())
        })
        .await
    }

    /// Append a log line, keeping at most `keep` lines. Returns the number
    /// of lines stored.
    pub async fn add_log(
        &self,
        job_id: &str,
        line: String,
        keep: Option<usize>,
    ) -> QueueResult<usize> {
        let id = job_id.to_string();
        self.exec("addLog", job_id, move |cmd, ctx| {
            add_log(cmd, &ctx.keys, &id, &line, keep)
        })
        .await
    }

    /// Log lines in `[start, end]` plus the total count.
    pub async fn get_logs(
        &self,
        job_id: &str,
        start: i64,
        end: i64,
    ) -> QueueResult<(Vec<String>, usize)> {
        let logs = self.keys.logs(job_id);
        self.exec_infallible(move |cmd, _| (cmd.lrange(&logs, start, end), cmd.llen(&logs)))
            .await
    }

    /// Block the whole queue for `ttl_ms`.
    pub async fn rate_limit(&self, ttl_ms: i64) -> QueueResult<()> {
        self.exec_infallible(move |cmd, ctx| {
            if ttl_ms > 0 {
                cmd.set_px(&ctx.keys.limiter(), &i64::MAX.to_string(), ttl_ms);
            } else {
                cmd.del(&ctx.keys.limiter());
            }
        })
        .await
    }

    /// Remaining limiter window. With `max_jobs`, 0 unless the counter
    /// reached it.
    pub async fn get_rate_limit_ttl(&self, max_jobs: Option<u64>) -> QueueResult<i64> {
        self.exec_infallible(move |cmd, ctx| {
            let limiter = ctx.keys.limiter();
            if let Some(max) = max_jobs {
                let used: i64 = cmd
                    .get(&limiter)
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or_default();
                if used < max as i64 {
                    return 0;
                }
            }
            cmd.pttl(&limiter).max(0)
        })
        .await
    }

    pub async fn set_global_concurrency(&self, concurrency: usize) -> QueueResult<()> {
        self.exec_infallible(move |cmd, ctx| {
            cmd.hset(&ctx.keys.meta(), META_CONCURRENCY, &concurrency.to_string());
        })
        .await
    }

    pub async fn get_global_concurrency(&self) -> QueueResult<Option<usize>> {
        self.exec_infallible(|cmd, ctx| global_concurrency(cmd, &ctx.keys))
            .await
    }

    pub async fn remove_global_concurrency(&self) -> QueueResult<()> {
        self.exec_infallible(|cmd, ctx| {
            cmd.hdel(&ctx.keys.meta(), META_CONCURRENCY);
            signal_if_ready(cmd, &ctx.keys);
        })
        .await
    }

    /// Oldest entries of the queue's event stream.
    pub async fn read_events(&self, count: Option<usize>) -> QueueResult<Vec<StreamEntry>> {
        self.exec_infallible(move |cmd, ctx| cmd.xrange(&ctx.keys.events(), count))
            .await
    }

    pub async fn get_dependencies(&self, job_id: &str) -> QueueResult<Dependencies> {
        let id = job_id.to_string();
        self.exec("getDependencies", job_id, move |cmd, ctx| {
            let keys = &ctx.keys;
            require_job(cmd, keys, &id)?;
            let mut pending = cmd.smembers(&keys.dependencies(&id));
            pending.sort();
            Ok(Dependencies {
                pending,
                processed: cmd.hgetall(&keys.processed(&id)),
                failed: cmd.hgetall(&keys.failed_children(&id)),
                unsuccessful: ids_of(cmd.zrange(&keys.unsuccessful(&id), 0, -1)),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::NewJob;
    use super::super::test_support::scripts_at;
    use super::*;
    use crate::opts::JobOptions;

    #[tokio::test]
    async fn test_pause_moves_wait_to_paused() {
        let (scripts, _clock) = scripts_at(0);
        scripts
            .add_job(&NewJob::new("x", json!({}), JobOptions::new()))
            .await
            .unwrap();
        assert!(scripts.pause().await.unwrap());
        assert!(!scripts.pause().await.unwrap());
        let counts = scripts.get_counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert!(counts.paused);
        assert_eq!(scripts.get_state("1").await.unwrap(), JobState::Waiting);

        assert!(scripts.resume().await.unwrap());
        let wait = scripts
            .exec_infallible(|cmd, ctx| cmd.llen(&ctx.keys.wait()))
            .await
            .unwrap();
        assert_eq!(wait, 1);
    }

    #[tokio::test]
    async fn test_logs_are_capped() {
        let (scripts, _clock) = scripts_at(0);
        scripts
            .add_job(&NewJob::new("x", json!({}), JobOptions::new()))
            .await
            .unwrap();
        for n in 0..5 {
            scripts.add_log("1", format!("line {n}"), Some(2)).await.unwrap();
        }
        let (lines, total) = scripts.get_logs("1", 0, -1).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(lines, vec!["line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_progress_and_events() {
        let (scripts, _clock) = scripts_at(0);
        scripts
            .add_job(&NewJob::new("x", json!({}), JobOptions::new()))
            .await
            .unwrap();
        scripts.update_progress("1", &json!(50)).await.unwrap();
        let job = scripts.get_job("1").await.unwrap().unwrap();
        assert_eq!(job.progress, json!(50));

        let events = scripts.read_events(None).await.unwrap();
        let names: Vec<_> = events.iter().filter_map(|e| e.field("event")).collect();
        assert_eq!(names, vec!["added", "waiting", "progress"]);

        let err = scripts.update_progress("2", &json!(1)).await.unwrap_err();
        assert_eq!(err.script_error(), Some(ScriptError::JobNotExist));
    }

    #[tokio::test]
    async fn test_manual_rate_limit() {
        let (scripts, clock) = scripts_at(0);
        scripts.rate_limit(2_000).await.unwrap();
        assert_eq!(scripts.get_rate_limit_ttl(None).await.unwrap(), 2_000);
        assert_eq!(scripts.get_rate_limit_ttl(Some(10)).await.unwrap(), 2_000);
        clock.advance(2_000);
        assert_eq!(scripts.get_rate_limit_ttl(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_jobs_in_processing_order() {
        let (scripts, _clock) = scripts_at(0);
        for name in ["a", "b", "c"] {
            scripts
                .add_job(&NewJob::new(name, json!({}), JobOptions::new()))
                .await
                .unwrap();
        }
        let jobs = scripts.get_jobs(JobState::Waiting, 0, 1).await.unwrap();
        let names: Vec<_> = jobs.iter().map(|job| job.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
