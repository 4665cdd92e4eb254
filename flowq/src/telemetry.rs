//! Tracing spans and recording hooks for flowq.
//!
//! Span constructors name the unit of work (`flowq.add`, `flowq.fetch`,
//! `flowq.process`, `flowq.finish`, `flowq.renew`, `flowq.sweep`). The
//! `record_*` helpers log the event and, with the `metrics` feature,
//! update the matching prometheus collector.
//!
//! ```ignore
//! use flowq::telemetry::{job_process_span, record_job_start, record_job_end};
//!
//! let timing = record_job_start(&job.id);
//! let result = processor.process(&mut job).instrument(job_process_span("mail", &job.id, &job.name)).await;
//! record_job_end(timing, "mail", &job.name, "completed");
//! ```

use std::future::Future;
use tracing::{Instrument, Span, info_span};

/// Create a tracing span around adding a job.
///
/// # Arguments
/// * `queue` - The queue name
/// * `job_name` - The job name given by the producer
///
/// # Example
/// ```ignore
/// let span = job_add_span("mail", "welcome");
/// let handle = queue.add("welcome", data, opts).instrument(span).await?;
/// ```
#[must_use]
pub fn job_add_span(queue: impl AsRef<str>, job_name: impl AsRef<str>) -> Span {
    info_span!(
        "flowq.add",
        queue = %queue.as_ref(),
        job_name = %job_name.as_ref(),
    )
}

/// Span around one claim attempt by a worker.
#[must_use]
pub fn job_fetch_span(queue: impl AsRef<str>, worker: impl AsRef<str>) -> Span {
    info_span!(
        "flowq.fetch",
        queue = %queue.as_ref(),
        worker = %worker.as_ref(),
    )
}

/// Span around a processor invocation.
///
/// # Arguments
/// * `queue` - The queue name
/// * `job_id` - The claimed job's id
/// * `job_name` - The job name, used to pick the processor
#[must_use]
pub fn job_process_span(
    queue: impl AsRef<str>,
    job_id: impl AsRef<str>,
    job_name: impl AsRef<str>,
) -> Span {
    info_span!(
        "flowq.process",
        queue = %queue.as_ref(),
        job_id = %job_id.as_ref(),
        job_name = %job_name.as_ref(),
    )
}

#[must_use]
pub fn job_finish_span(
    queue: impl AsRef<str>,
    job_id: impl AsRef<str>,
    status: impl AsRef<str>,
) -> Span {
    info_span!(
        "flowq.finish",
        queue = %queue.as_ref(),
        job_id = %job_id.as_ref(),
        status = %status.as_ref(),
    )
}

/// Span around one lock renewal round covering `jobs` locks.
#[must_use]
pub fn lock_renew_span(queue: impl AsRef<str>, jobs: usize) -> Span {
    info_span!("flowq.renew", queue = %queue.as_ref(), jobs)
}

#[must_use]
pub fn sweep_span(queue: impl AsRef<str>) -> Span {
    info_span!("flowq.sweep", queue = %queue.as_ref())
}

/// Attach a process span to a processor future.
pub fn instrument_process<F>(
    queue: impl AsRef<str>,
    job_id: impl AsRef<str>,
    job_name: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(job_process_span(queue, job_id, job_name))
}

pub fn record_job_added(queue: impl AsRef<str>, job_name: impl AsRef<str>, job_id: impl AsRef<str>) {
    tracing::debug!(
        queue = %queue.as_ref(),
        job_name = %job_name.as_ref(),
        job_id = %job_id.as_ref(),
        "job added"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_added(queue.as_ref(), job_name.as_ref());
}

pub fn record_job_completed(
    queue: impl AsRef<str>,
    job_name: impl AsRef<str>,
    job_id: impl AsRef<str>,
) {
    tracing::info!(
        queue = %queue.as_ref(),
        job_name = %job_name.as_ref(),
        job_id = %job_id.as_ref(),
        "job completed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_completed(queue.as_ref(), job_name.as_ref());
}

/// Record a failed attempt.
///
/// # Arguments
/// * `queue` - The queue name
/// * `job_name` - The job name
/// * `job_id` - The job id
/// * `reason` - The failure message stored on the job
/// * `will_retry` - Whether the job runs again (delayed or waiting) instead of moving to `failed`
///
/// # Example
/// ```ignore
/// let will_retry = !matches!(decision, RetryDecision::Fail);
/// record_job_failed("mail", &job.name, &job.id, err.to_string(), will_retry);
/// ```
pub fn record_job_failed(
    queue: impl AsRef<str>,
    job_name: impl AsRef<str>,
    job_id: impl AsRef<str>,
    reason: impl AsRef<str>,
    will_retry: bool,
) {
    if will_retry {
        tracing::info!(
            queue = %queue.as_ref(),
            job_name = %job_name.as_ref(),
            job_id = %job_id.as_ref(),
            reason = %reason.as_ref(),
            "job attempt failed, retrying"
        );
    } else {
        tracing::warn!(
            queue = %queue.as_ref(),
            job_name = %job_name.as_ref(),
            job_id = %job_id.as_ref(),
            reason = %reason.as_ref(),
            "job failed"
        );
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_failed(
        queue.as_ref(),
        job_name.as_ref(),
        if will_retry { "retry" } else { "failed" },
    );
}

/// Record a job found in `active` without a lock.
pub fn record_job_stalled(queue: impl AsRef<str>, job_id: impl AsRef<str>, recovered: bool) {
    tracing::warn!(
        queue = %queue.as_ref(),
        job_id = %job_id.as_ref(),
        recovered,
        "job stalled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_stalled(
        queue.as_ref(),
        if recovered { "recovered" } else { "failed" },
    );
}

pub fn record_lock_renewal_failed(queue: impl AsRef<str>, job_id: impl AsRef<str>) {
    tracing::warn!(
        queue = %queue.as_ref(),
        job_id = %job_id.as_ref(),
        "job lock lost"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lock_renewal_failed(queue.as_ref());
}

pub fn set_queue_depth(queue: impl AsRef<str>, state: impl AsRef<str>, depth: usize) {
    tracing::debug!(
        queue = %queue.as_ref(),
        state = %state.as_ref(),
        depth,
        "queue depth updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(queue.as_ref(), state.as_ref(), depth as f64);
}

pub fn observe_job_duration(
    queue: impl AsRef<str>,
    job_name: impl AsRef<str>,
    status: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::debug!(
        queue = %queue.as_ref(),
        job_name = %job_name.as_ref(),
        status = %status.as_ref(),
        duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(
        queue.as_ref(),
        job_name.as_ref(),
        status.as_ref(),
        duration_secs,
    );
}

/// Start timing a processor run. Pass the handle to [`record_job_end`].
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

pub fn record_job_end(
    handle: JobTimingHandle,
    queue: impl AsRef<str>,
    job_name: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    observe_job_duration(queue, job_name, status, handle.start.elapsed().as_secs_f64());
}

/// Opaque timing handle returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
