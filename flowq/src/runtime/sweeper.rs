use std::time::Duration;

use tracing::Instrument;

use crate::error::QueueResult;
use crate::events::QueueEventPayload;
use crate::opts::KeepJobs;
use crate::queue::Queue;
use crate::scripts::{STALLED_REASON, StalledReport};
use crate::store::Store;
use crate::telemetry;

use super::supervisor::ShutdownToken;
use super::worker::WorkerConfig;

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Delayed jobs moved to `wait`.
    pub promoted: usize,
    pub stalled: StalledReport,
}

/// Background pass promoting due delayed jobs and recovering stalled ones.
///
/// Any number of sweepers may run against one queue; the stalled check
/// itself runs at most once per interval queue-wide.
pub struct Sweeper<S> {
    queue: Queue<S>,
    interval_ms: u64,
    max_stalled_count: u32,
    remove_on_fail: Option<KeepJobs>,
    promote_delayed: bool,
    check_stalled: bool,
}

impl<S> std::fmt::Debug for Sweeper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("queue", &self.queue.name())
            .field("interval_ms", &self.interval_ms)
            .field("max_stalled_count", &self.max_stalled_count)
            .field("promote_delayed", &self.promote_delayed)
            .field("check_stalled", &self.check_stalled)
            .finish()
    }
}

impl<S: Store> Sweeper<S> {
    pub fn new(queue: Queue<S>, config: &WorkerConfig) -> Self {
        Self {
            queue,
            interval_ms: config.stalled_interval_ms,
            max_stalled_count: config.max_stalled_count,
            remove_on_fail: config.remove_on_fail.clone(),
            promote_delayed: !config.skip_delayed_promotion,
            check_stalled: !config.skip_stalled_check,
        }
    }

    /// Whether a sweep would do anything at all.
    pub fn is_enabled(&self) -> bool {
        self.promote_delayed || self.check_stalled
    }

    pub async fn tick(&self) -> QueueResult<SweepReport> {
        let span = telemetry::sweep_span(self.queue.name());
        async {
            let mut report = SweepReport::default();
            if self.promote_delayed {
                report.promoted = self.queue.scripts().promote_due().await?;
            }
            if self.check_stalled {
                report.stalled = self
                    .queue
                    .scripts()
                    .move_stalled_jobs_to_wait(
                        self.max_stalled_count,
                        self.interval_ms,
                        self.remove_on_fail.clone(),
                    )
                    .await?;
                self.publish_stalled(&report.stalled);
            }
            if report.promoted > 0 {
                tracing::debug!(promoted = report.promoted, "delayed jobs promoted");
            }
            self.queue.record_depths().await?;
            Ok(report)
        }
        .instrument(span)
        .await
    }

    fn publish_stalled(&self, stalled: &StalledReport) {
        for job_id in &stalled.recovered {
            telemetry::record_job_stalled(self.queue.name(), job_id, true);
            self.queue.publish(QueueEventPayload::Stalled {
                job_id: job_id.clone(),
            });
        }
        for job_id in &stalled.failed {
            telemetry::record_job_stalled(self.queue.name(), job_id, false);
            self.queue.publish(QueueEventPayload::Failed {
                job_id: job_id.clone(),
                reason: STALLED_REASON.to_string(),
            });
        }
    }

    /// Sweep every interval until `shutdown` fires. The first sweep runs
    /// right away.
    pub fn spawn(self, shutdown: ShutdownToken) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.tick().await {
                    tracing::warn!(queue = %self.queue.name(), error = %err, "sweep failed");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!(queue = %self.queue.name(), "sweeper stopping");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}
