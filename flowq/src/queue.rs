use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::{InProcEventBus, QueueEvent, QueueEventPayload};
use crate::job::{Job, JobHandle, JobState};
use crate::job_scheduler::JobTemplate;
use crate::keys::QueueKeys;
use crate::opts::JobOptions;
use crate::scripts::{AddOutcome, NewJob, Scripts, add_encoded};
use crate::store::Store;
use crate::telemetry;

/// Number of jobs per state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    /// Jobs in `wait`, or in `paused` while the queue is paused.
    pub waiting: usize,
    pub prioritized: usize,
    pub delayed: usize,
    pub active: usize,
    pub waiting_children: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: bool,
}

impl JobCounts {
    /// Jobs that have not run yet.
    pub fn pending(&self) -> usize {
        self.waiting + self.prioritized + self.delayed + self.waiting_children
    }

    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Prioritized => self.prioritized,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::WaitingChildren => self.waiting_children,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Unknown => 0,
        }
    }
}

const COUNTED_STATES: [JobState; 7] = [
    JobState::Waiting,
    JobState::Prioritized,
    JobState::Delayed,
    JobState::Active,
    JobState::WaitingChildren,
    JobState::Completed,
    JobState::Failed,
];

impl From<AddOutcome> for JobHandle {
    fn from(outcome: AddOutcome) -> Self {
        let accepted = outcome.is_created();
        JobHandle {
            id: outcome.id().to_string(),
            accepted,
        }
    }
}

/// Producer and admin handle of one queue.
///
/// Cheap to clone; clones share the store and the event bus.
pub struct Queue<S> {
    name: String,
    config: QueueConfig,
    scripts: Scripts<S>,
    events: InProcEventBus,
}

impl<S> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            scripts: self.scripts.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S> fmt::Debug for Queue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("prefix", &self.config.prefix)
            .field("store_type", &type_name::<S>())
            .field("events", &self.events)
            .finish()
    }
}

impl<S> Queue<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn keys(&self) -> &QueueKeys {
        self.scripts.keys()
    }

    pub fn scripts(&self) -> &Scripts<S> {
        &self.scripts
    }

    pub fn store(&self) -> &Arc<S> {
        self.scripts.store()
    }

    pub fn events(&self) -> &InProcEventBus {
        &self.events
    }
}

impl<S: Store> Queue<S> {
    pub fn new(name: impl Into<String>, store: Arc<S>, config: QueueConfig) -> Self {
        let name = name.into();
        let keys = QueueKeys::new(config.prefix.clone(), name.clone());
        let scripts = Scripts::new(store, keys, config.max_len_events);
        Self {
            name,
            config,
            scripts,
            events: InProcEventBus::default(),
        }
    }

    /// Publish typed events on `events` instead of a private bus.
    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn publish(&self, payload: QueueEventPayload) {
        self.events.publish_now(QueueEvent::new(self.name.clone(), payload));
    }

    /// Add a job. Options with `repeat` upsert a job scheduler instead and
    /// return its first iteration.
    pub async fn add(
        &self,
        name: impl Into<String>,
        data: Value,
        opts: JobOptions,
    ) -> QueueResult<JobHandle> {
        let name = name.into();
        let mut opts = opts.merged_over(&self.config.default_job_options)?;
        opts.validate()?;

        if let Some(mut repeat) = opts.repeat.take() {
            if let Some(job_id) = opts.job_id.take() {
                repeat.key.get_or_insert(job_id);
            }
            let scheduler_id = repeat.scheduler_id(&name);
            let template = JobTemplate::new(name, data).with_opts(opts);
            return match self
                .upsert_job_scheduler(&scheduler_id, repeat, template)
                .await?
            {
                Some(job) => Ok(JobHandle {
                    id: job.id,
                    accepted: true,
                }),
                None => Err(QueueError::InvalidOptions(format!(
                    "repeat options of {scheduler_id} produce no run"
                ))),
            };
        }

        let job = NewJob::new(name.clone(), data, opts);
        let outcome = self
            .scripts
            .add_job(&job)
            .instrument(telemetry::job_add_span(&self.name, &name))
            .await?;
        self.publish_added(&name, &outcome);
        Ok(outcome.into())
    }

    /// Add several jobs in one script. Jobs ahead of a rejected one stay
    /// added.
    pub async fn add_bulk(
        &self,
        jobs: Vec<(String, Value, JobOptions)>,
    ) -> QueueResult<Vec<JobHandle>> {
        let mut encoded = Vec::with_capacity(jobs.len());
        let mut names = Vec::with_capacity(jobs.len());
        for (name, data, opts) in jobs {
            let opts = opts.merged_over(&self.config.default_job_options)?;
            opts.validate()?;
            if opts.repeat.is_some() {
                return Err(QueueError::InvalidOptions(
                    "repeatable jobs cannot be added in bulk".into(),
                ));
            }
            encoded.push(NewJob::new(name.clone(), data, opts).encode(self.keys().clone())?);
            names.push(name);
        }

        let outcomes = self
            .scripts
            .exec("addBulk", "", move |cmd, ctx| {
                encoded
                    .iter()
                    .map(|job| add_encoded(cmd, ctx, job))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;
        Ok(names
            .iter()
            .zip(outcomes)
            .map(|(name, outcome)| {
                self.publish_added(name, &outcome);
                outcome.into()
            })
            .collect())
    }

    fn publish_added(&self, name: &str, outcome: &AddOutcome) {
        match outcome {
            AddOutcome::Created { id, state, due } => {
                telemetry::record_job_added(&self.name, name, id);
                self.publish(QueueEventPayload::Added {
                    job_id: id.clone(),
                    name: name.to_string(),
                });
                self.publish_placed(id, *state, *due);
            }
            AddOutcome::Duplicate { id } => {
                self.publish(QueueEventPayload::Duplicated { job_id: id.clone() });
            }
            AddOutcome::Deduplicated { id, dedup_id } => {
                self.publish(QueueEventPayload::Deduplicated {
                    job_id: id.clone(),
                    deduplication_id: dedup_id.clone(),
                });
            }
        }
    }

    /// Event for the structure a freshly added job landed in.
    pub(crate) fn publish_placed(&self, job_id: &str, state: JobState, due: Option<i64>) {
        let job_id = job_id.to_string();
        let payload = match (state, due) {
            (JobState::WaitingChildren, _) => QueueEventPayload::WaitingChildren { job_id },
            (JobState::Delayed, Some(until)) => QueueEventPayload::Delayed { job_id, until },
            (JobState::Waiting | JobState::Prioritized, _) => {
                QueueEventPayload::Waiting { job_id, prev: None }
            }
            _ => return,
        };
        self.publish(payload);
    }

    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        self.scripts.get_job(job_id).await
    }

    pub async fn get_job_state(&self, job_id: &str) -> QueueResult<JobState> {
        self.scripts.get_state(job_id).await
    }

    pub async fn get_job_counts(&self) -> QueueResult<JobCounts> {
        self.scripts.get_counts().await
    }

    /// Jobs that are waiting, prioritized, delayed or waiting for children.
    pub async fn count(&self) -> QueueResult<usize> {
        Ok(self.get_job_counts().await?.pending())
    }

    /// Jobs in `state` between positions `start` and `end` inclusive.
    pub async fn get_jobs(
        &self,
        state: JobState,
        start: usize,
        end: usize,
    ) -> QueueResult<Vec<Job>> {
        self.scripts.get_jobs(state, start, end).await
    }

    pub async fn get_job_logs(
        &self,
        job_id: &str,
        start: i64,
        end: i64,
    ) -> QueueResult<(Vec<String>, usize)> {
        self.scripts.get_logs(job_id, start, end).await
    }

    pub async fn update_job_progress(&self, job_id: &str, progress: Value) -> QueueResult<()> {
        self.scripts.update_progress(job_id, &progress).await?;
        self.publish(QueueEventPayload::Progress {
            job_id: job_id.to_string(),
            data: progress,
        });
        Ok(())
    }

    /// Stop workers from claiming jobs. Active jobs keep running.
    pub async fn pause(&self) -> QueueResult<()> {
        if self.scripts.pause().await? {
            tracing::info!(queue = %self.name, "queue paused");
            self.publish(QueueEventPayload::Paused);
        }
        Ok(())
    }

    pub async fn resume(&self) -> QueueResult<()> {
        if self.scripts.resume().await? {
            tracing::info!(queue = %self.name, "queue resumed");
            self.publish(QueueEventPayload::Resumed);
        }
        Ok(())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        self.scripts.is_paused().await
    }

    /// Remove every waiting job, and delayed ones when `include_delayed`.
    /// Returns the number removed.
    pub async fn drain(&self, include_delayed: bool) -> QueueResult<usize> {
        let removed = self.scripts.drain(include_delayed).await?;
        tracing::info!(queue = %self.name, removed, include_delayed, "queue drained");
        Ok(removed)
    }

    /// Remove jobs in `state` older than `grace_ms`, at most `limit` of
    /// them (`0` for no limit). Returns the removed ids.
    pub async fn clean(
        &self,
        grace_ms: i64,
        limit: usize,
        state: JobState,
    ) -> QueueResult<Vec<String>> {
        let removed = self
            .scripts
            .clean_jobs_in_set(state, grace_ms, limit)
            .await?;
        if !removed.is_empty() {
            tracing::info!(queue = %self.name, %state, count = removed.len(), "jobs cleaned");
            self.publish(QueueEventPayload::Cleaned {
                count: removed.len(),
            });
        }
        Ok(removed)
    }

    /// Delete the queue and all its jobs. Without `force` the queue must be
    /// paused and have no active jobs.
    pub async fn obliterate(&self, force: bool) -> QueueResult<usize> {
        let removed = self.scripts.obliterate(force).await?;
        tracing::warn!(queue = %self.name, removed, force, "queue obliterated");
        Ok(removed)
    }

    /// Remove a job, and its children when `remove_children`. Returns
    /// `false` when the job or a descendant is locked.
    pub async fn remove(&self, job_id: &str, remove_children: bool) -> QueueResult<bool> {
        let removed = self.scripts.remove_job(job_id, remove_children).await?;
        if removed {
            self.publish(QueueEventPayload::Removed {
                job_id: job_id.to_string(),
            });
        }
        Ok(removed)
    }

    /// Promote up to `limit` delayed jobs regardless of their due time.
    pub async fn promote_jobs(&self, limit: usize) -> QueueResult<usize> {
        self.scripts.promote_jobs(limit).await
    }

    /// Stop handing out jobs for `ttl_ms`.
    pub async fn rate_limit(&self, ttl_ms: i64) -> QueueResult<()> {
        self.scripts.rate_limit(ttl_ms).await
    }

    pub async fn get_rate_limit_ttl(&self, max_jobs: Option<u64>) -> QueueResult<i64> {
        self.scripts.get_rate_limit_ttl(max_jobs).await
    }

    /// Cap the number of active jobs across every worker.
    pub async fn set_global_concurrency(&self, concurrency: usize) -> QueueResult<()> {
        self.scripts.set_global_concurrency(concurrency).await
    }

    pub async fn get_global_concurrency(&self) -> QueueResult<Option<usize>> {
        self.scripts.get_global_concurrency().await
    }

    pub async fn remove_global_concurrency(&self) -> QueueResult<()> {
        self.scripts.remove_global_concurrency().await
    }

    /// Oldest entries of the durable event stream, decoded.
    pub async fn read_events(&self, count: Option<usize>) -> QueueResult<Vec<QueueEvent>> {
        let entries = self.scripts.read_events(count).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| QueueEvent::from_stream_entry(self.name.clone(), entry))
            .collect())
    }

    /// Sample job counts into the queue depth gauges.
    pub async fn record_depths(&self) -> QueueResult<JobCounts> {
        let counts = self.get_job_counts().await?;
        for state in COUNTED_STATES {
            telemetry::set_queue_depth(&self.name, state.as_str(), counts.get(state));
        }
        Ok(counts)
    }
}
