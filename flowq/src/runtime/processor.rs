use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DelayedError, QueueResult, WaitingChildrenError};
use crate::job::Job;
use crate::queue::Queue;
use crate::store::Store;

/// What a worker slot hands to a processor: the claimed job and the queue
/// it came from.
pub struct JobContext<S> {
    job: Job,
    queue: Queue<S>,
}

impl<S> std::fmt::Debug for JobContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("job_name", &self.job.name)
            .field("queue", &self.job.queue_name())
            .finish()
    }
}

impl<S: Store> JobContext<S> {
    pub fn new(job: Job, queue: Queue<S>) -> Self {
        Self { job, queue }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn queue(&self) -> &Queue<S> {
        &self.queue
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> QueueResult<T> {
        self.job.data_as()
    }

    /// Store progress and publish a `progress` event.
    pub async fn update_progress(&mut self, progress: Value) -> QueueResult<()> {
        self.queue
            .update_job_progress(&self.job.id, progress.clone())
            .await?;
        self.job.progress = progress;
        Ok(())
    }

    pub async fn log(&self, line: impl Into<String>) -> QueueResult<usize> {
        self.job.log(self.queue.scripts(), line).await
    }

    /// Move the job to `delayed` until `timestamp` without charging the
    /// attempt. Return the resulting error from the processor so the worker
    /// leaves the job alone.
    pub async fn move_to_delayed(&mut self, timestamp: i64) -> anyhow::Result<DelayedError> {
        self.job
            .move_to_delayed(self.queue.scripts(), timestamp)
            .await?;
        Ok(DelayedError)
    }

    /// Park the job until its children finish. `None` when no child is
    /// pending and processing should continue.
    pub async fn move_to_waiting_children(
        &self,
    ) -> anyhow::Result<Option<WaitingChildrenError>> {
        let parked = self
            .job
            .move_to_waiting_children(self.queue.scripts())
            .await?;
        Ok(parked.then_some(WaitingChildrenError))
    }
}

/// Work executed for each claimed job.
///
/// Returning `Ok` completes the job with the value; returning an error
/// fails the attempt unless the error is one of the processor signals in
/// [`crate::error`].
#[async_trait]
pub trait Processor<S: Store>: Send + Sync {
    async fn process(&self, ctx: JobContext<S>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<S, F, Fut> Processor<S> for F
where
    S: Store,
    F: Fn(JobContext<S>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext<S>) -> anyhow::Result<Value> {
        self(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::QueueConfig;
    use crate::opts::JobOptions;
    use crate::lease::LockToken;
    use crate::scripts::{FetchArgs, Fetched};
    use crate::store::{ManualClock, MemoryStore};

    async fn claimed(queue: &Queue<MemoryStore>) -> Job {
        let fetched = queue
            .scripts()
            .move_to_active(&FetchArgs {
                token: LockToken::new(),
                lock_duration_ms: 30_000,
                worker_name: None,
                limiter: None,
            })
            .await
            .unwrap();
        match fetched {
            Fetched::Job(job) => *job,
            other => panic!("expected a job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closure_processor() {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(ManualClock::new(0))));
        let queue = Queue::new("ctx", store, QueueConfig::default());
        queue.add("double", json!(21), JobOptions::new()).await.unwrap();
        let job = claimed(&queue).await;

        let processor = |ctx: JobContext<MemoryStore>| async move {
            let n: i64 = ctx.data_as()?;
            Ok::<_, anyhow::Error>(json!(n * 2))
        };
        let out = processor
            .process(JobContext::new(job, queue.clone()))
            .await
            .unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn test_context_progress_and_delay() {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(ManualClock::new(1_000))));
        let queue = Queue::new("ctx", store, QueueConfig::default());
        queue.add("slow", json!({}), JobOptions::new()).await.unwrap();
        let job = claimed(&queue).await;
        let mut ctx = JobContext::new(job, queue.clone());

        ctx.update_progress(json!(50)).await.unwrap();
        assert_eq!(ctx.log("halfway").await.unwrap(), 1);
        ctx.move_to_delayed(5_000).await.unwrap();

        let stored = queue.get_job("1").await.unwrap().unwrap();
        assert_eq!(stored.progress, json!(50));
        assert_eq!(
            queue.get_job_state("1").await.unwrap(),
            crate::job::JobState::Delayed
        );
        // The lock went with the move.
        assert!(ctx.move_to_waiting_children().await.is_err());
    }
}
