use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowq::*;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

/// One processor invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessRecord {
    pub job_id: String,
    pub name: String,
    pub data: Value,
    /// Attempts charged before this invocation.
    pub attempts_made: u32,
}

impl ProcessRecord {
    fn of(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            data: job.data.clone(),
            attempts_made: job.attempts_made,
        }
    }
}

#[derive(Default)]
struct CallLog {
    records: Mutex<Vec<ProcessRecord>>,
    changed: Notify,
}

impl CallLog {
    fn push(&self, record: ProcessRecord) {
        self.records.lock().push(record);
        self.changed.notify_waiters();
    }

    async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();
                if self.records.lock().len() >= count {
                    return;
                }
                changed.await;
            }
        })
        .await
        .is_ok()
    }
}

/// Processor returning one configured result for every job.
#[derive(Clone)]
pub struct RecordingProcessor {
    calls: Arc<CallLog>,
    result: Arc<Mutex<Result<Value, String>>>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::with_result(Value::Null)
    }

    pub fn with_result(value: Value) -> Self {
        Self {
            calls: Arc::new(CallLog::default()),
            result: Arc::new(Mutex::new(Ok(value))),
        }
    }

    /// Fail every attempt with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        let processor = Self::new();
        processor.set_failure(reason);
        processor
    }

    pub fn set_result(&self, value: Value) {
        *self.result.lock() = Ok(value);
    }

    pub fn set_failure(&self, reason: impl Into<String>) {
        *self.result.lock() = Err(reason.into());
    }

    pub fn calls(&self) -> Vec<ProcessRecord> {
        self.calls.records.lock().clone()
    }

    pub fn processed_ids(&self) -> Vec<String> {
        self.calls
            .records
            .lock()
            .iter()
            .map(|record| record.job_id.clone())
            .collect()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.calls.records.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} processor calls, got {}",
            expected, actual
        );
    }

    /// Wait until at least `count` calls were recorded.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        self.calls.wait_for(count, timeout).await
    }

    pub fn clear(&self) {
        self.calls.records.lock().clear();
    }
}

impl Default for RecordingProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Store> Processor<S> for RecordingProcessor {
    async fn process(&self, ctx: JobContext<S>) -> anyhow::Result<Value> {
        self.calls.push(ProcessRecord::of(ctx.job()));
        let result = self.result.lock().clone();
        result.map_err(|reason| anyhow::anyhow!(reason))
    }
}

/// What a [`ScriptedProcessor`] does on one call.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Complete(Value),
    Fail(String),
    /// Fail with [`UnrecoverableError`].
    Unrecoverable(String),
    /// Return the job to `wait` with [`RateLimitError`].
    RateLimited,
    /// Sleep, then complete.
    Slow { ms: u64, value: Value },
}

/// Processor walking through a fixed list of outcomes, one per call.
///
/// Once the list is exhausted every call completes with `null`.
#[derive(Clone)]
pub struct ScriptedProcessor {
    calls: Arc<CallLog>,
    outcomes: Arc<Mutex<VecDeque<Outcome>>>,
}

impl ScriptedProcessor {
    pub fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            calls: Arc::new(CallLog::default()),
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
        }
    }

    pub fn calls(&self) -> Vec<ProcessRecord> {
        self.calls.records.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.outcomes.lock().len()
    }

    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        self.calls.wait_for(count, timeout).await
    }
}

#[async_trait]
impl<S: Store> Processor<S> for ScriptedProcessor {
    async fn process(&self, ctx: JobContext<S>) -> anyhow::Result<Value> {
        self.calls.push(ProcessRecord::of(ctx.job()));
        let outcome = self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(Outcome::Complete(Value::Null));
        match outcome {
            Outcome::Complete(value) => Ok(value),
            Outcome::Fail(reason) => Err(anyhow::anyhow!(reason)),
            Outcome::Unrecoverable(reason) => Err(UnrecoverableError::new(reason).into()),
            Outcome::RateLimited => Err(RateLimitError.into()),
            Outcome::Slow { ms, value } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::TestHarness;

    #[tokio::test]
    async fn test_recording_processor_records_and_fails() {
        let harness = TestHarness::new("mock");
        harness
            .queue
            .add("a", json!({"n": 1}), JobOptions::new())
            .await
            .unwrap();
        let job = harness.claim().await.unwrap();

        let processor = RecordingProcessor::failing("nope");
        let err = processor
            .process(JobContext::new(job, harness.queue.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
        processor.assert_call_count_eq(1);
        assert_eq!(processor.calls()[0].data, json!({"n": 1}));
        assert!(processor.wait_for_calls(1, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_scripted_processor_walks_outcomes() {
        let harness = TestHarness::new("mock");
        for name in ["a", "b", "c"] {
            harness
                .queue
                .add(name, json!({}), JobOptions::new())
                .await
                .unwrap();
        }
        let processor = ScriptedProcessor::new([
            Outcome::Unrecoverable("bad".into()),
            Outcome::Complete(json!(7)),
        ]);

        let first = harness.claim().await.unwrap();
        let err = processor
            .process(JobContext::new(first, harness.queue.clone()))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<UnrecoverableError>().is_some());

        let second = harness.claim().await.unwrap();
        let value = processor
            .process(JobContext::new(second, harness.queue.clone()))
            .await
            .unwrap();
        assert_eq!(value, json!(7));

        let third = harness.claim().await.unwrap();
        let value = processor
            .process(JobContext::new(third, harness.queue.clone()))
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(processor.remaining(), 0);
    }
}
