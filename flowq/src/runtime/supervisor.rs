//! The worker engine.
//!
//! A [`Worker`] runs `concurrency` slot loops against one queue. Each slot
//! claims a job, hands it to the [`Processor`], and finalizes the attempt
//! (complete, retry, delay or fail) in a single script, claiming the next
//! job in the same call when it can. Next to the slots run the lock
//! renewer and the [`Sweeper`]. Once a claim comes back empty the slots
//! block on the queue marker until new work is signalled, the earliest
//! delayed job is due, or the drain delay passes.

use std::any::{Any, type_name};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backoff::{self, Backoffs, RetryDecision};
use crate::error::{ProcessorSignal, QueueResult};
use crate::events::QueueEventPayload;
use crate::job::Job;
use crate::lease::LockToken;
use crate::queue::Queue;
use crate::scripts::{AttemptFailure, FetchArgs, Fetched, FinishArgs, FinishTarget};
use crate::store::Store;
use crate::telemetry;

use super::lock_manager::LockManager;
use super::processor::{JobContext, Processor};
use super::sweeper::Sweeper;
use super::worker::WorkerConfig;

/// Token for signaling graceful shutdown to background tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct WorkerTasks {
    slots: Vec<JoinHandle<()>>,
    renewer: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

struct WorkerInner<S, P> {
    queue: Queue<S>,
    processor: Arc<P>,
    config: WorkerConfig,
    backoffs: Backoffs,
    locks: LockManager<S>,
    /// Stops the slots and the sweeper.
    closing: ShutdownToken,
    /// Stops lock renewal once every slot has returned.
    locks_stop: ShutdownToken,
    paused: AtomicBool,
    resumed: Notify,
    running: AtomicBool,
    drained: AtomicBool,
    active: AtomicUsize,
    idle: Notify,
    tasks: Mutex<WorkerTasks>,
}

/// Processes jobs of one queue.
pub struct Worker<S, P> {
    inner: Arc<WorkerInner<S, P>>,
}

impl<S, P> Clone for Worker<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, P> fmt::Debug for Worker<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot_count = self
            .inner
            .tasks
            .try_lock()
            .map(|tasks| tasks.slots.len())
            .unwrap_or_default();

        f.debug_struct("Worker")
            .field("queue", &self.inner.queue.name())
            .field("config", &self.inner.config)
            .field("store_type", &type_name::<S>())
            .field("processor_type", &type_name::<P>())
            .field("slot_count", &slot_count)
            .field("active", &self.inner.active.load(Ordering::SeqCst))
            .field("paused", &self.inner.paused.load(Ordering::SeqCst))
            .field("closing", &self.inner.closing.is_cancelled())
            .finish()
    }
}

impl<S: Store, P: Processor<S> + 'static> Worker<S, P> {
    pub fn new(queue: Queue<S>, processor: P, config: WorkerConfig) -> anyhow::Result<Self> {
        Self::from_parts(queue, Arc::new(processor), config, Backoffs::new())
    }

    pub(crate) fn from_parts(
        queue: Queue<S>,
        processor: Arc<P>,
        config: WorkerConfig,
        backoffs: Backoffs,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let locks = LockManager::new(queue.scripts().clone(), config.lock_duration_ms);
        Ok(Self {
            inner: Arc::new(WorkerInner {
                queue,
                processor,
                config,
                backoffs,
                locks,
                closing: ShutdownToken::new(),
                locks_stop: ShutdownToken::new(),
                paused: AtomicBool::new(false),
                resumed: Notify::new(),
                running: AtomicBool::new(false),
                drained: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                tasks: Mutex::new(WorkerTasks::default()),
            }),
        })
    }

    pub fn queue(&self) -> &Queue<S> {
        &self.inner.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Locks currently held by this worker.
    pub fn locks(&self) -> &LockManager<S> {
        &self.inner.locks
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    /// Jobs being processed right now.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Spawn the slots, lock renewal and the sweeper.
    pub async fn start(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        if inner.closing.is_cancelled() {
            anyhow::bail!("worker is closed");
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("worker is already running");
        }

        let mut tasks = inner.tasks.lock().await;
        for slot in 0..inner.config.concurrency {
            tasks.slots.push(tokio::spawn(Arc::clone(inner).run_slot(slot)));
        }
        if !inner.config.skip_lock_renewal {
            tasks.renewer = Some(
                inner
                    .locks
                    .clone()
                    .spawn(inner.config.renew_interval_ms(), inner.locks_stop.clone()),
            );
        }
        let sweeper = Sweeper::new(inner.queue.clone(), &inner.config);
        if sweeper.is_enabled() {
            tasks.sweeper = Some(sweeper.spawn(inner.closing.clone()));
        }

        tracing::info!(
            queue = %inner.queue.name(),
            worker = %inner.config.name,
            concurrency = inner.config.concurrency,
            "worker started"
        );
        Ok(())
    }

    /// Stop claiming new jobs. Unless `do_not_wait_active` is set, wait for
    /// the jobs in flight to finish.
    pub async fn pause(&self, do_not_wait_active: bool) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            tracing::info!(queue = %self.inner.queue.name(), "worker paused");
        }
        if !do_not_wait_active {
            self.inner.wait_until_idle().await;
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            tracing::info!(queue = %self.inner.queue.name(), "worker resumed");
            self.inner.resumed.notify_waiters();
        }
    }

    /// Rate limit the whole queue for `ttl_ms`. Pair with returning
    /// [`RateLimitError`](crate::error::RateLimitError) from the processor
    /// to put the current job back.
    pub async fn rate_limit(&self, ttl_ms: i64) -> QueueResult<()> {
        self.inner.queue.rate_limit(ttl_ms).await
    }

    /// Stop the worker. A graceful close lets the jobs in flight finish;
    /// `force` abandons them to the stalled check.
    pub async fn close(&self, force: bool) -> anyhow::Result<()> {
        let inner = &self.inner;
        tracing::info!(queue = %inner.queue.name(), force, "closing worker");

        inner.closing.cancel();
        inner.resumed.notify_waiters();

        let (slots, sweeper, renewer) = {
            let mut tasks = inner.tasks.lock().await;
            (
                std::mem::take(&mut tasks.slots),
                tasks.sweeper.take(),
                tasks.renewer.take(),
            )
        };

        for handle in slots {
            if force {
                handle.abort();
            }
            join_quietly(handle, "worker slot").await;
        }
        inner.locks_stop.cancel();
        if let Some(handle) = sweeper {
            join_quietly(handle, "sweeper").await;
        }
        if let Some(handle) = renewer {
            join_quietly(handle, "lock renewer").await;
        }

        inner.running.store(false, Ordering::SeqCst);
        tracing::info!(queue = %inner.queue.name(), "worker closed");
        Ok(())
    }
}

async fn join_quietly(handle: JoinHandle<()>, task: &str) {
    match handle.await {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => {}
        Err(err) => tracing::warn!(task, error = %err, "worker task failed"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<S: Store, P: Processor<S> + 'static> WorkerInner<S, P> {
    async fn run_slot(self: Arc<Self>, slot: usize) {
        tracing::debug!(queue = %self.queue.name(), slot, "worker slot started");
        let mut next_delayed = None;
        let mut pending: Option<Job> = None;
        loop {
            if self.closing.is_cancelled() {
                break;
            }
            let job = match pending.take() {
                Some(job) => job,
                None => {
                    self.wait_while_paused().await;
                    if self.closing.is_cancelled() {
                        break;
                    }
                    match self.fetch(&mut next_delayed).await {
                        Some(job) => job,
                        None => continue,
                    }
                }
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            pending = self.process_job(job, &mut next_delayed).await;
            if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.idle.notify_waiters();
            }
        }
        tracing::debug!(queue = %self.queue.name(), slot, "worker slot stopped");
    }

    async fn wait_while_paused(&self) {
        loop {
            let resumed = self.resumed.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();
            if !self.paused.load(Ordering::SeqCst) || self.closing.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = &mut resumed => {}
                _ = self.closing.cancelled() => return,
            }
        }
    }

    async fn wait_until_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    fn fetch_args(&self) -> FetchArgs {
        FetchArgs {
            token: LockToken::new(),
            lock_duration_ms: self.config.lock_duration_ms,
            worker_name: Some(self.config.name.clone()),
            limiter: self.config.limiter.as_ref().map(|limiter| limiter.to_args()),
        }
    }

    /// Claim arguments for the finishing script, unless the slot should
    /// stop after this job.
    fn fetch_next_args(&self) -> Option<FetchArgs> {
        if self.closing.is_cancelled() || self.paused.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.fetch_args())
    }

    /// Longest blocking wait: the drain delay, cut short by the earliest
    /// delayed job.
    fn block_timeout(&self, next_delayed: Option<i64>) -> Duration {
        let mut wait_ms = self.config.drain_delay_ms;
        if let Some(due) = next_delayed {
            let until_due = (due - self.queue.store().now_ms()).max(0) as u64;
            wait_ms = wait_ms.min(until_due);
        }
        Duration::from_millis(wait_ms)
    }

    async fn fetch(&self, next_delayed: &mut Option<i64>) -> Option<Job> {
        if self.drained.load(Ordering::SeqCst) {
            let marker_key = self.queue.keys().marker();
            let timeout = self.block_timeout(*next_delayed);
            tokio::select! {
                _ = self.closing.cancelled() => return None,
                marker = self.queue.store().wait_for_marker(&marker_key, timeout) => {
                    if let Err(err) = marker {
                        self.report_error("wait for work", &err);
                        self.sleep_unless_closing(self.config.run_retry_delay_ms).await;
                        return None;
                    }
                }
            }
            if self.paused.load(Ordering::SeqCst) {
                return None;
            }
        }

        let span = telemetry::job_fetch_span(self.queue.name(), &self.config.name);
        match self
            .queue
            .scripts()
            .move_to_active(&self.fetch_args())
            .instrument(span)
            .await
        {
            Ok(fetched) => self.on_fetched(fetched, next_delayed).await,
            Err(err) => {
                self.report_error("fetch", &err);
                self.sleep_unless_closing(self.config.run_retry_delay_ms).await;
                None
            }
        }
    }

    async fn on_fetched(&self, fetched: Fetched, next_delayed: &mut Option<i64>) -> Option<Job> {
        match fetched {
            Fetched::Job(job) => {
                self.drained.store(false, Ordering::SeqCst);
                *next_delayed = None;
                Some(*job)
            }
            Fetched::RateLimited(ttl) => {
                tracing::debug!(queue = %self.queue.name(), ttl, "rate limited");
                self.sleep_unless_closing(ttl.max(0) as u64).await;
                None
            }
            Fetched::Idle { next_delayed: due } => {
                *next_delayed = due;
                if !self.drained.swap(true, Ordering::SeqCst) {
                    tracing::debug!(queue = %self.queue.name(), "queue drained");
                    self.queue.publish(QueueEventPayload::Drained);
                }
                None
            }
        }
    }

    async fn sleep_unless_closing(&self, ms: u64) {
        tokio::select! {
            _ = self.closing.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        }
    }

    fn report_error(&self, during: &str, err: &dyn fmt::Display) {
        tracing::warn!(queue = %self.queue.name(), during, error = %err, "worker error");
        self.queue.publish(QueueEventPayload::Error {
            message: format!("{during}: {err}"),
        });
    }

    /// Run one claimed job to its next state. Returns the job claimed by
    /// the finishing script, if any.
    async fn process_job(&self, job: Job, next_delayed: &mut Option<i64>) -> Option<Job> {
        let queue_name = self.queue.name().to_string();
        let claimed = job.clone();

        self.locks.track(&job);
        self.queue.publish(QueueEventPayload::Active {
            job_id: claimed.id.clone(),
        });
        let timing = telemetry::record_job_start(&claimed.id);

        let run = AssertUnwindSafe(self.processor.process(JobContext::new(job, self.queue.clone())))
            .catch_unwind();
        let result = telemetry::instrument_process(&queue_name, &claimed.id, &claimed.name, run)
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "processor panicked: {}",
                    panic_message(&*panic)
                ))
            });

        self.locks.untrack(&claimed.id);
        let (status, next) = match result {
            Ok(value) => self.complete(&claimed, value, next_delayed).await,
            Err(err) => (self.fail(&claimed, err).await, None),
        };
        telemetry::record_job_end(timing, &queue_name, &claimed.name, status);
        next
    }

    async fn complete(
        &self,
        job: &Job,
        value: Value,
        next_delayed: &mut Option<i64>,
    ) -> (&'static str, Option<Job>) {
        let mut args = FinishArgs::completed(job.token, value.clone())
            .with_keep(self.config.remove_on_complete.clone());
        if let Some(fetch) = self.fetch_next_args() {
            args = args.with_fetch_next(fetch);
        }

        let span = telemetry::job_finish_span(self.queue.name(), &job.id, "completed");
        match self
            .queue
            .scripts()
            .move_to_finished(&job.id, args)
            .instrument(span)
            .await
        {
            Ok(next) => {
                telemetry::record_job_completed(self.queue.name(), &job.name, &job.id);
                self.queue.publish(QueueEventPayload::Completed {
                    job_id: job.id.clone(),
                    return_value: value,
                });
                let next = match next {
                    Some(fetched) => self.on_fetched(fetched, next_delayed).await,
                    None => None,
                };
                ("completed", next)
            }
            Err(err) => {
                self.report_error("complete", &err);
                ("error", None)
            }
        }
    }

    async fn fail(&self, job: &Job, err: anyhow::Error) -> &'static str {
        let scripts = self.queue.scripts();
        let signal = ProcessorSignal::classify(&err);
        match signal {
            ProcessorSignal::Delayed | ProcessorSignal::WaitingChildren => return "moved",
            ProcessorSignal::RateLimited => {
                return match scripts.move_job_from_active_to_wait(&job.id, job.token).await {
                    Ok(_) => "rate_limited",
                    Err(err) => {
                        self.report_error("return rate limited job", &err);
                        "error"
                    }
                };
            }
            ProcessorSignal::Unrecoverable | ProcessorSignal::Failed => {}
        }

        let reason = err.to_string();
        let stacktrace = vec![format!("{err:?}")];
        let decision = backoff::decide(
            job,
            &err,
            &self.backoffs,
            signal == ProcessorSignal::Unrecoverable,
        );
        let failure = AttemptFailure {
            reason: reason.clone(),
            stacktrace: stacktrace.clone(),
        };

        let span = telemetry::job_finish_span(self.queue.name(), &job.id, "failed");
        let moved = match decision {
            RetryDecision::Fail => {
                let args = FinishArgs {
                    token: job.token,
                    target: FinishTarget::Failed {
                        reason: reason.clone(),
                        stacktrace,
                    },
                    keep: self.config.remove_on_fail.clone(),
                    fetch_next: None,
                };
                scripts
                    .move_to_finished(&job.id, args)
                    .instrument(span)
                    .await
                    .map(|_| ())
            }
            RetryDecision::RetryNow => {
                scripts
                    .retry_job(&job.id, job.token, Some(failure))
                    .instrument(span)
                    .await
            }
            RetryDecision::RetryAfter(delay) => {
                let until = self.queue.store().now_ms().saturating_add(delay);
                scripts
                    .move_to_delayed(&job.id, job.token, until, false, Some(failure))
                    .instrument(span)
                    .await
                    .map(|_| ())
            }
        };

        let will_retry = decision != RetryDecision::Fail;
        match moved {
            Ok(()) => {
                telemetry::record_job_failed(
                    self.queue.name(),
                    &job.name,
                    &job.id,
                    &reason,
                    will_retry,
                );
                self.queue.publish(QueueEventPayload::Failed {
                    job_id: job.id.clone(),
                    reason,
                });
                if will_retry { "retried" } else { "failed" }
            }
            Err(err) => {
                self.report_error("fail", &err);
                "error"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::time::timeout;

    use crate::config::QueueConfig;
    use crate::error::UnrecoverableError;
    use crate::events::{EventSubscriber, QueueEvent};
    use crate::job::JobState;
    use crate::opts::JobOptions;
    use crate::store::MemoryStore;

    fn queue(name: &str) -> Queue<MemoryStore> {
        Queue::new(name, Arc::new(MemoryStore::new()), QueueConfig::default())
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::new("unit").with_drain_delay(50)
    }

    async fn next_matching(
        rx: &mut tokio::sync::broadcast::Receiver<QueueEvent>,
        name: &str,
    ) -> QueueEventPayload {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.payload.name() == name {
                    return event.payload;
                }
            }
        })
        .await
        .expect("event not published within 5 seconds")
    }

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        timeout(Duration::from_secs(1), clone.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("waiters did not observe cancellation within 5 seconds");
        for result in results {
            result.expect("waiter panicked");
        }
    }

    #[tokio::test]
    async fn test_worker_completes_jobs() {
        let queue = queue("unit-complete");
        let mut rx = queue.events().subscribe();
        let worker = Worker::new(
            queue.clone(),
            |ctx: JobContext<MemoryStore>| async move {
                let n: i64 = ctx.data_as()?;
                Ok::<_, anyhow::Error>(json!(n + 1))
            },
            fast_config(),
        )
        .unwrap();
        worker.start().await.unwrap();

        let handle = queue.add("inc", json!(1), JobOptions::new()).await.unwrap();
        let completed = next_matching(&mut rx, "completed").await;
        assert_eq!(
            completed,
            QueueEventPayload::Completed {
                job_id: handle.id.clone(),
                return_value: json!(2),
            }
        );
        worker.close(false).await.unwrap();
        assert!(!worker.is_running());

        let job = queue.get_job(&handle.id).await.unwrap().unwrap();
        assert_eq!(job.return_value, Some(json!(2)));
        assert_eq!(job.processed_by.as_deref(), Some("unit"));
        assert_eq!(
            queue.get_job_state(&handle.id).await.unwrap(),
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn test_retries_until_attempts_exhausted() {
        let queue = queue("unit-retry");
        let mut rx = queue.events().subscribe();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let worker = Worker::new(
            queue.clone(),
            move |_ctx: JobContext<MemoryStore>| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Err::<Value, anyhow::Error>(anyhow::anyhow!("boom")) }
            },
            fast_config(),
        )
        .unwrap();

        let handle = queue
            .add("flaky", json!({}), JobOptions::new().with_attempts(2))
            .await
            .unwrap();
        worker.start().await.unwrap();

        next_matching(&mut rx, "failed").await;
        next_matching(&mut rx, "failed").await;
        worker.close(false).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let job = queue.get_job(&handle.id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));
        assert_eq!(queue.get_job_state(&handle.id).await.unwrap(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_unrecoverable_skips_remaining_attempts() {
        let queue = queue("unit-unrecoverable");
        let mut rx = queue.events().subscribe();
        let worker = Worker::new(
            queue.clone(),
            |_ctx: JobContext<MemoryStore>| async move {
                Err::<Value, anyhow::Error>(UnrecoverableError::new("bad input").into())
            },
            fast_config(),
        )
        .unwrap();

        let handle = queue
            .add("strict", json!({}), JobOptions::new().with_attempts(5))
            .await
            .unwrap();
        worker.start().await.unwrap();
        next_matching(&mut rx, "failed").await;
        worker.close(false).await.unwrap();

        let job = queue.get_job(&handle.id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        assert_eq!(queue.get_job_state(&handle.id).await.unwrap(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_panicking_processor_fails_the_attempt() {
        let queue = queue("unit-panic");
        let mut rx = queue.events().subscribe();
        let worker = Worker::new(
            queue.clone(),
            |_ctx: JobContext<MemoryStore>| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, anyhow::Error>(Value::Null)
            },
            fast_config(),
        )
        .unwrap();

        queue.add("panics", json!({}), JobOptions::new()).await.unwrap();
        worker.start().await.unwrap();
        let failed = next_matching(&mut rx, "failed").await;
        worker.close(false).await.unwrap();

        let QueueEventPayload::Failed { reason, .. } = failed else {
            panic!("expected failed");
        };
        assert!(reason.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_pause_holds_jobs_until_resume() {
        let queue = queue("unit-pause");
        let mut rx = queue.events().subscribe();
        let worker = Worker::new(
            queue.clone(),
            |_ctx: JobContext<MemoryStore>| async move { Ok::<_, anyhow::Error>(json!("ok")) },
            fast_config(),
        )
        .unwrap();
        worker.start().await.unwrap();
        worker.pause(false).await;
        assert!(worker.is_paused());

        let handle = queue.add("held", json!({}), JobOptions::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            queue.get_job_state(&handle.id).await.unwrap(),
            JobState::Waiting
        );

        worker.resume();
        next_matching(&mut rx, "completed").await;
        worker.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_interrupts_blocking_wait() {
        let queue = queue("unit-close");
        let worker = Worker::new(
            queue,
            |_ctx: JobContext<MemoryStore>| async move { Ok::<_, anyhow::Error>(Value::Null) },
            WorkerConfig::default().with_drain_delay(60_000),
        )
        .unwrap();
        worker.start().await.unwrap();
        assert!(worker.start().await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        timeout(Duration::from_secs(2), worker.close(false))
            .await
            .expect("close did not return within 2 seconds")
            .unwrap();
        assert!(worker.is_closing());
        assert!(worker.start().await.is_err());
    }
}
