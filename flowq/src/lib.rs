//! flowq - persistent job queue with atomic state transitions.
//!
//! Producers add jobs to a named queue; workers claim them under a lock,
//! run a processor and finalize each attempt. Every state change is a
//! script executed atomically against a shared keyed [`Store`], so any
//! number of producers and workers can share one store without further
//! coordination.
//!
//! # Core Concepts
//!
//! - **Job**: a named JSON payload with options. Each job is in exactly one
//!   [`JobState`] at any time.
//!
//! - **Queue**: the [`Queue`] handle adds jobs (single, bulk, flows,
//!   repeatable) and administers the queue (pause, drain, clean, counts).
//!
//! - **Worker**: the [`Worker`] claims jobs with bounded concurrency, keeps
//!   their locks alive, retries failures with backoff, and recovers jobs
//!   whose worker died.
//!
//! - **Flows**: a parent waits in `waiting-children` until every child
//!   finished; children may live in other queues.
//!
//! - **Events**: scripts append to the queue's durable event stream, and
//!   components publish typed [`QueueEvent`]s on an [`InProcEventBus`].
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus collectors
//! - `redis` - [`RedisStore`], a store shared by processes on different hosts
//!
//! # Example
//!
//! ```ignore
//! use flowq::*;
//! use serde_json::json;
//!
//! let store = Arc::new(MemoryStore::new());
//! let queue = Queue::new("mail", store, QueueConfig::default());
//! queue.add("welcome", json!({"to": "a@b.c"}), JobOptions::new().with_attempts(3)).await?;
//!
//! let worker = Worker::new(queue, |ctx: JobContext<MemoryStore>| async move {
//!     send(ctx.job().data.clone()).await?;
//!     Ok(json!("sent"))
//! }, WorkerConfig::new("mailer").with_concurrency(4))?;
//! worker.start().await?;
//! ```

/// Retry delay strategies.
pub mod backoff;

/// Queue-level configuration.
pub mod config;

/// Script status codes, the queue error type and processor signals.
pub mod error;

/// Typed queue events and in-process fan-out.
///
/// - [`QueueEvent`] and [`QueueEventPayload`] for event data
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`InProcEventBus`] for in-process broadcasting
pub mod events;

/// Parent/child job trees.
pub mod flow;

/// The job entity, its states and per-job operations.
pub mod job;

/// Repeatable jobs: schedule options and next-run computation.
pub mod job_scheduler;

/// Store key schema of a queue.
pub mod keys;

/// Lock tokens and held-lock bookkeeping.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus collectors.
pub mod metrics;

/// Options accepted when adding a job.
pub mod opts;

/// Producer and admin API.
pub mod queue;

/// Worker engine.
///
/// - [`Worker`] - slot loops, lock renewal and sweeping for one queue
/// - [`WorkerConfig`] - worker configuration
/// - [`Processor`] and [`JobContext`] - the work executed per job
/// - [`WorkerBuilder`] - construction with explicit dependencies
/// - [`SandboxedProcessor`] - processors behind a message channel
pub mod runtime;

/// The atomic state transitions.
pub mod scripts;

/// Backing store abstraction and the in-memory backend.
pub mod store;

/// Tracing spans and recording hooks.
pub mod telemetry;

pub use backoff::{BackoffStrategy, Backoffs, RetryDecision};
pub use config::QueueConfig;
pub use error::{
    DelayedError, QueueError, QueueResult, RateLimitError, ScriptError, UnrecoverableError,
    WaitingChildrenError,
};
pub use events::{
    EventMeta, EventPublisher, EventSubscriber, InProcEventBus, QueueEvent, QueueEventPayload,
};
pub use flow::{DependencyCounts, FlowJob, FlowNode};
pub use job::{Job, JobHandle, JobState};
pub use job_scheduler::{JobScheduler, JobTemplate, RepeatOptions};
pub use keys::QueueKeys;
pub use lease::LockToken;
pub use opts::{
    BackoffOptions, DeduplicationOptions, JobOptions, KeepJobs, MAX_DELAY_MS, MAX_PRIORITY,
    ParentFailurePolicy, ParentRef,
};
pub use queue::{JobCounts, Queue};
pub use runtime::{
    JobContext, Processor, RateLimiterOptions, Sandbox, SandboxMessage, SandboxedProcessor,
    ShutdownToken, Worker, WorkerBuilder, WorkerConfig,
};
pub use scripts::{Dependencies, STALLED_REASON, StalledReport};
pub use store::{Clock, ManualClock, MemoryStore, Store, SystemClock};
#[cfg(feature = "redis")]
pub use store::{RedisStore, RedisStoreConfig};
