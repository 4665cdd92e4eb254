use std::sync::Arc;

use flowq::scripts::{FetchArgs, Fetched};
use flowq::*;

/// Store time every harness starts at.
pub const START_MS: i64 = 1_000_000;

/// A queue over a fresh [`MemoryStore`] whose clock only moves when told.
///
/// Timing-dependent behaviour (delays, lock expiry, rate limit windows) is
/// driven with [`TestHarness::advance`] instead of sleeping.
#[derive(Clone, Debug)]
pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub queue: Queue<MemoryStore>,
}

impl TestHarness {
    pub fn new(name: &str) -> Self {
        Self::with_config(name, QueueConfig::default())
    }

    pub fn with_config(name: &str, config: QueueConfig) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let queue = Queue::new(name, Arc::clone(&store), config);
        Self {
            clock,
            store,
            queue,
        }
    }

    /// Another queue sharing this harness's store and clock.
    pub fn queue_named(&self, name: &str) -> Queue<MemoryStore> {
        Queue::new(name, Arc::clone(&self.store), self.queue.config().clone())
    }

    pub fn now(&self) -> i64 {
        self.store.now_ms()
    }

    /// Move the store clock forward. Returns the new time.
    pub fn advance(&self, ms: i64) -> i64 {
        self.clock.advance(ms)
    }

    /// Claim arguments with a fresh token and a 30s lock.
    pub fn fetch_args(&self) -> FetchArgs {
        FetchArgs {
            token: LockToken::new(),
            lock_duration_ms: 30_000,
            worker_name: Some("testkit".to_string()),
            limiter: None,
        }
    }

    /// Claim the next job of the harness queue, if any.
    pub async fn claim(&self) -> Option<Job> {
        self.claim_from(&self.queue).await
    }

    pub async fn claim_from(&self, queue: &Queue<MemoryStore>) -> Option<Job> {
        match queue.scripts().move_to_active(&self.fetch_args()).await {
            Ok(Fetched::Job(job)) => Some(*job),
            Ok(_) => None,
            Err(err) => panic!("claim failed: {err}"),
        }
    }

    /// Current state of `job_id` in the harness queue.
    pub async fn state(&self, job_id: &str) -> JobState {
        self.queue
            .get_job_state(job_id)
            .await
            .unwrap_or_else(|err| panic!("state of {job_id}: {err}"))
    }

    /// Stored job, panicking when it does not exist.
    pub async fn job(&self, job_id: &str) -> Job {
        match self.queue.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => panic!("job {job_id} does not exist"),
            Err(err) => panic!("load job {job_id}: {err}"),
        }
    }

    pub async fn assert_state_eq(&self, job_id: &str, expected: JobState) {
        assert_eq!(
            self.state(job_id).await,
            expected,
            "Expected job {} to be {}",
            job_id,
            expected
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_harness_claims_with_manual_clock() {
        let harness = TestHarness::new("harness");
        let handle = harness
            .queue
            .add("later", json!({}), JobOptions::new().with_delay(1_000))
            .await
            .unwrap();
        assert!(harness.claim().await.is_none());

        harness.advance(1_000);
        let job = harness.claim().await.unwrap();
        assert_eq!(job.id, handle.id);
        assert_eq!(job.processed_on, Some(START_MS + 1_000));
        harness.assert_state_eq(&handle.id, JobState::Active).await;
    }

    #[tokio::test]
    async fn test_sibling_queues_share_the_store() {
        let harness = TestHarness::new("left");
        let right = harness.queue_named("right");
        right.add("x", json!({}), JobOptions::new()).await.unwrap();
        assert!(harness.claim().await.is_none());
        assert!(harness.claim_from(&right).await.is_some());
    }
}
