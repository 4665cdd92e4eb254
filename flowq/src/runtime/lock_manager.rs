use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::Instrument;

use crate::error::QueueResult;
use crate::job::Job;
use crate::lease::HeldLock;
use crate::scripts::Scripts;
use crate::store::Store;
use crate::telemetry;

use super::supervisor::ShutdownToken;

/// Keeps the locks of every job held by one worker alive.
///
/// Slots register a job when they start processing it and drop it right
/// before finalizing. Renewal runs for all registered jobs in one script.
pub struct LockManager<S> {
    scripts: Scripts<S>,
    lock_duration_ms: u64,
    held: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl<S> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            scripts: self.scripts.clone(),
            lock_duration_ms: self.lock_duration_ms,
            held: Arc::clone(&self.held),
        }
    }
}

impl<S> std::fmt::Debug for LockManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("queue", &self.scripts.keys().name())
            .field("lock_duration_ms", &self.lock_duration_ms)
            .field("held", &self.held.lock().len())
            .finish()
    }
}

impl<S: Store> LockManager<S> {
    pub fn new(scripts: Scripts<S>, lock_duration_ms: u64) -> Self {
        Self {
            scripts,
            lock_duration_ms,
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start renewing the lock of a claimed job. Jobs without a token are
    /// ignored.
    ///
    /// # Arguments
    /// * `job` - A job returned by a claim, carrying its lock token
    ///
    /// # Example
    /// ```ignore
    /// locks.track(&job);
    /// let result = processor.process(&mut job).await;
    /// locks.untrack(&job.id);
    /// ```
    pub fn track(&self, job: &Job) {
        if let Some(token) = job.token {
            let now = self.scripts.store().now_ms();
            self.held
                .lock()
                .insert(job.id.clone(), HeldLock::new(job.id.clone(), token, now));
        }
    }

    pub fn untrack(&self, job_id: &str) -> Option<HeldLock> {
        self.held.lock().remove(job_id)
    }

    pub fn held(&self) -> Vec<HeldLock> {
        let mut held: Vec<_> = self.held.lock().values().cloned().collect();
        held.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        held
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }

    /// Renew every tracked lock once. Returns the ids whose lock was lost;
    /// those are no longer tracked.
    pub async fn renew(&self) -> QueueResult<Vec<String>> {
        let locks: Vec<_> = self
            .held
            .lock()
            .values()
            .map(|held| (held.job_id.clone(), held.token))
            .collect();
        if locks.is_empty() {
            return Ok(Vec::new());
        }

        let queue = self.scripts.keys().name().to_string();
        let attempted = locks.len();
        let lost = self
            .scripts
            .extend_locks(locks, self.lock_duration_ms)
            .instrument(telemetry::lock_renew_span(&queue, attempted))
            .await?;

        let mut held = self.held.lock();
        let mut reported = Vec::with_capacity(lost.len());
        for job_id in lost {
            // Finished between the snapshot and the renewal.
            if held.remove(&job_id).is_none() {
                continue;
            }
            telemetry::record_lock_renewal_failed(&queue, &job_id);
            reported.push(job_id);
        }
        for lock in held.values_mut() {
            lock.renewed();
        }
        tracing::trace!(queue = %queue, renewed = held.len(), "locks renewed");
        Ok(reported)
    }

    /// Renew every `interval_ms` until `shutdown` fires.
    ///
    /// # Arguments
    /// * `interval_ms` - Pause between renewal rounds, usually half the lock duration
    /// * `shutdown` - Token that stops the loop once cancelled
    ///
    /// # Example
    /// ```ignore
    /// let shutdown = ShutdownToken::new();
    /// let renewer = locks.clone().spawn(config.renew_interval_ms(), shutdown.clone());
    /// // ...
    /// shutdown.cancel();
    /// renewer.await?;
    /// ```
    pub fn spawn(self, interval_ms: u64, shutdown: ShutdownToken) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("lock renewal stopping");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = self.renew().await {
                            tracing::warn!(error = %err, "lock renewal failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::keys::QueueKeys;
    use crate::lease::LockToken;
    use crate::opts::JobOptions;
    use crate::scripts::{FetchArgs, Fetched, NewJob};
    use crate::store::{ManualClock, MemoryStore};

    async fn claim(scripts: &Scripts<MemoryStore>) -> Job {
        let fetched = scripts
            .move_to_active(&FetchArgs {
                token: LockToken::new(),
                lock_duration_ms: 1_000,
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
    async fn test_renew_keeps_lock_alive() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let scripts = Scripts::new(store, QueueKeys::new("flowq", "locks"), 100);
        scripts
            .add_job(&NewJob::new("x", json!({}), JobOptions::new()))
            .await
            .unwrap();
        let job = claim(&scripts).await;

        let locks = LockManager::new(scripts.clone(), 1_000);
        locks.track(&job);
        clock.advance(800);
        assert!(locks.renew().await.unwrap().is_empty());
        clock.advance(800);
        // Still held: the renewal pushed expiry to 1800.
        assert!(locks.renew().await.unwrap().is_empty());
        assert_eq!(locks.held()[0].renewals, 2);
    }

    #[tokio::test]
    async fn test_lost_lock_is_reported_and_dropped() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let scripts = Scripts::new(store, QueueKeys::new("flowq", "locks"), 100);
        scripts
            .add_job(&NewJob::new("x", json!({}), JobOptions::new()))
            .await
            .unwrap();
        let job = claim(&scripts).await;

        let locks = LockManager::new(scripts, 1_000);
        locks.track(&job);
        clock.advance(1_500);
        assert_eq!(locks.renew().await.unwrap(), vec![job.id.clone()]);
        assert!(locks.is_empty());
        assert!(locks.untrack(&job.id).is_none());
    }
}
