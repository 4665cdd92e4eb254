//! Job lifecycle tests driven through the scripts with a manual clock.
//!
//! Covers retry accounting with backoff, delayed promotion, flows and
//! their failure policies, claim exclusivity and stalled recovery.

use std::collections::HashMap;

use flowq::backoff::{self, Backoffs, RetryDecision};
use flowq::scripts::{AttemptFailure, FinishArgs};
use flowq::*;
use flowq_testkit::{START_MS, TestHarness, assert_exclusive_state};
use serde_json::json;

async fn fail_attempt(harness: &TestHarness, job: &Job) -> RetryDecision {
    let err = anyhow::anyhow!("boom");
    let decision = backoff::decide(job, &err, &Backoffs::new(), false);
    let scripts = harness.queue.scripts();
    match decision {
        RetryDecision::Fail => {
            scripts
                .move_to_finished(&job.id, FinishArgs::failed(job.token, "boom"))
                .await
                .unwrap();
        }
        RetryDecision::RetryNow => {
            scripts
                .retry_job(&job.id, job.token, Some(AttemptFailure::new("boom")))
                .await
                .unwrap();
        }
        RetryDecision::RetryAfter(delay) => {
            scripts
                .move_to_delayed(
                    &job.id,
                    job.token,
                    harness.now() + delay,
                    false,
                    Some(AttemptFailure::new("boom")),
                )
                .await
                .unwrap();
        }
    }
    decision
}

#[tokio::test]
async fn test_exponential_backoff_then_failed() {
    let harness = TestHarness::new("backoff");
    let handle = harness
        .queue
        .add(
            "flaky",
            json!({}),
            JobOptions::new()
                .with_attempts(3)
                .with_backoff(BackoffOptions::exponential(100)),
        )
        .await
        .unwrap();

    let job = harness.claim().await.unwrap();
    assert_eq!(fail_attempt(&harness, &job).await, RetryDecision::RetryAfter(100));
    assert_eq!(
        assert_exclusive_state(&harness.queue, &handle.id).await,
        JobState::Delayed
    );

    harness.advance(99);
    assert!(harness.claim().await.is_none());
    harness.advance(1);
    let job = harness.claim().await.unwrap();
    assert_eq!(job.attempts_made, 1);
    assert_eq!(fail_attempt(&harness, &job).await, RetryDecision::RetryAfter(300));

    harness.advance(300);
    let job = harness.claim().await.unwrap();
    assert_eq!(fail_attempt(&harness, &job).await, RetryDecision::Fail);

    let job = harness.job(&handle.id).await;
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.attempts_started, 3);
    assert_eq!(job.failed_reason.as_deref(), Some("boom"));
    assert_eq!(
        assert_exclusive_state(&harness.queue, &handle.id).await,
        JobState::Failed
    );
}

#[tokio::test]
async fn test_delayed_job_promoted_exactly_when_due() {
    let harness = TestHarness::new("delay");
    let handle = harness
        .queue
        .add("later", json!({}), JobOptions::new().with_delay(5_000))
        .await
        .unwrap();
    let job = harness.job(&handle.id).await;
    assert_eq!(job.timestamp, START_MS);
    assert_eq!(job.delay, 5_000);

    harness.advance(4_999);
    assert!(harness.claim().await.is_none());
    harness.assert_state_eq(&handle.id, JobState::Delayed).await;

    harness.advance(1);
    let claimed = harness.claim().await.unwrap();
    assert_eq!(claimed.id, handle.id);
    assert_eq!(claimed.processed_on, Some(START_MS + 5_000));
}

#[tokio::test]
async fn test_claims_are_exclusive() {
    let harness = TestHarness::new("race");
    let handle = harness
        .queue
        .add("only", json!({}), JobOptions::new())
        .await
        .unwrap();

    let (left, right) = tokio::join!(harness.claim(), harness.claim());
    let winners: Vec<_> = [left, right].into_iter().flatten().collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, handle.id);
    assert_eq!(winners[0].attempts_started, 1);
    assert_eq!(
        assert_exclusive_state(&harness.queue, &handle.id).await,
        JobState::Active
    );
}

#[tokio::test]
async fn test_stale_token_cannot_finish() {
    let harness = TestHarness::new("tokens");
    harness
        .queue
        .add("x", json!({}), JobOptions::new())
        .await
        .unwrap();
    let job = harness.claim().await.unwrap();

    let err = harness
        .queue
        .scripts()
        .move_to_finished(&job.id, FinishArgs::completed(Some(LockToken::new()), json!(1)))
        .await
        .unwrap_err();
    assert_eq!(err.script_error(), Some(ScriptError::JobLockMismatch));
    harness.assert_state_eq(&job.id, JobState::Active).await;
}

#[tokio::test]
async fn test_stalled_jobs_recovered_then_failed() {
    let harness = TestHarness::new("stalled");
    let handle = harness
        .queue
        .add("fragile", json!({}), JobOptions::new())
        .await
        .unwrap();
    let scripts = harness.queue.scripts();

    harness.claim().await.unwrap();
    harness.advance(30_001);
    let report = scripts
        .move_stalled_jobs_to_wait(1, 30_000, None)
        .await
        .unwrap();
    assert_eq!(report.recovered, vec![handle.id.clone()]);
    assert_eq!(harness.job(&handle.id).await.stalled_counter, 1);
    assert_eq!(
        assert_exclusive_state(&harness.queue, &handle.id).await,
        JobState::Waiting
    );

    harness.claim().await.unwrap();
    harness.advance(30_001);
    let report = scripts
        .move_stalled_jobs_to_wait(1, 30_000, None)
        .await
        .unwrap();
    assert_eq!(report.failed, vec![handle.id.clone()]);

    let job = harness.job(&handle.id).await;
    assert_eq!(job.failed_reason.as_deref(), Some(STALLED_REASON));
    // Stalls never charge the retry budget.
    assert_eq!(job.attempts_made, 0);
    assert_eq!(
        assert_exclusive_state(&harness.queue, &handle.id).await,
        JobState::Failed
    );
}

#[tokio::test]
async fn test_stalled_check_throttled_per_interval() {
    let harness = TestHarness::new("throttle");
    harness
        .queue
        .add("x", json!({}), JobOptions::new())
        .await
        .unwrap();
    let scripts = harness.queue.scripts();

    let first = scripts
        .move_stalled_jobs_to_wait(1, 30_000, None)
        .await
        .unwrap();
    assert!(first.recovered.is_empty());

    harness.claim().await.unwrap();
    harness.advance(30_001);
    // The previous check's window has passed, so this one runs.
    let second = scripts
        .move_stalled_jobs_to_wait(1, 30_000, None)
        .await
        .unwrap();
    assert_eq!(second.recovered.len(), 1);

    harness.claim().await.unwrap();
    harness.advance(100);
    let third = scripts
        .move_stalled_jobs_to_wait(1, 30_000, None)
        .await
        .unwrap();
    assert_eq!(third, StalledReport::default());
}

#[tokio::test]
async fn test_parent_waits_for_every_child() {
    let harness = TestHarness::new("flow");
    let flow = harness
        .queue
        .add_flow(
            FlowNode::new("assemble", "flow", json!({}))
                .with_child(FlowNode::new("part", "flow", json!({"n": 1})))
                .with_child(FlowNode::new("part", "flow", json!({"n": 2}))),
        )
        .await
        .unwrap();
    let parent_id = flow.handle.id.clone();
    assert_eq!(
        assert_exclusive_state(&harness.queue, &parent_id).await,
        JobState::WaitingChildren
    );

    let first = harness.claim().await.unwrap();
    harness
        .queue
        .scripts()
        .move_to_finished(&first.id, FinishArgs::completed(first.token, json!("a")))
        .await
        .unwrap();
    harness
        .assert_state_eq(&parent_id, JobState::WaitingChildren)
        .await;
    let counts = harness.queue.get_dependencies_count(&parent_id).await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.processed, 1);

    let second = harness.claim().await.unwrap();
    harness
        .queue
        .scripts()
        .move_to_finished(&second.id, FinishArgs::completed(second.token, json!("b")))
        .await
        .unwrap();
    assert_eq!(
        assert_exclusive_state(&harness.queue, &parent_id).await,
        JobState::Waiting
    );

    let values = harness.queue.get_children_values(&parent_id).await.unwrap();
    let expected: HashMap<String, serde_json::Value> = [
        (harness.queue.keys().job(&first.id), json!("a")),
        (harness.queue.keys().job(&second.id), json!("b")),
    ]
    .into_iter()
    .collect();
    assert_eq!(values, expected);

    let parent = harness.claim().await.unwrap();
    assert_eq!(parent.id, parent_id);
}

#[tokio::test]
async fn test_fail_parent_on_failure() {
    let harness = TestHarness::new("flow-fail");
    let flow = harness
        .queue
        .add_flow(
            FlowNode::new("report", "flow-fail", json!({})).with_child(
                FlowNode::new("fetch", "flow-fail", json!({}))
                    .with_opts(JobOptions::new().with_fail_parent_on_failure()),
            ),
        )
        .await
        .unwrap();
    let parent_id = flow.handle.id.clone();
    let child_id = flow.children[0].handle.id.clone();

    let child = harness.claim().await.unwrap();
    assert_eq!(child.id, child_id);
    harness
        .queue
        .scripts()
        .move_to_finished(&child.id, FinishArgs::failed(child.token, "upstream down"))
        .await
        .unwrap();

    assert_eq!(
        assert_exclusive_state(&harness.queue, &parent_id).await,
        JobState::Failed
    );
    let parent = harness.job(&parent_id).await;
    assert!(
        parent
            .failed_reason
            .as_deref()
            .is_some_and(|reason| reason.contains(&child_id))
    );
    let failed = harness
        .queue
        .get_failed_children_values(&parent_id)
        .await
        .unwrap();
    assert_eq!(
        failed.get(&harness.queue.keys().job(&child_id)).map(String::as_str),
        Some("upstream down")
    );
}

#[tokio::test]
async fn test_paused_queue_holds_new_jobs() {
    let harness = TestHarness::new("paused");
    harness.queue.pause().await.unwrap();
    let handle = harness
        .queue
        .add("held", json!({}), JobOptions::new())
        .await
        .unwrap();
    assert!(harness.claim().await.is_none());
    assert_eq!(
        assert_exclusive_state(&harness.queue, &handle.id).await,
        JobState::Waiting
    );

    harness.queue.resume().await.unwrap();
    assert_eq!(harness.claim().await.map(|job| job.id), Some(handle.id));
}

/// Adds `report` waiting on two `part` children, the first of which uses
/// `policy_opts`. Returns `(parent, failing child, healthy child)`.
async fn flow_with_failing_child(
    harness: &TestHarness,
    policy_opts: JobOptions,
) -> (String, String, String) {
    let flow = harness
        .queue
        .add_flow(
            FlowNode::new("report", harness.queue.name(), json!({}))
                .with_child(
                    FlowNode::new("part", harness.queue.name(), json!({"n": 1}))
                        .with_opts(policy_opts),
                )
                .with_child(FlowNode::new("part", harness.queue.name(), json!({"n": 2}))),
        )
        .await
        .unwrap();
    (
        flow.handle.id.clone(),
        flow.children[0].handle.id.clone(),
        flow.children[1].handle.id.clone(),
    )
}

async fn finish_claimed(harness: &TestHarness, expected: &str, outcome: Result<&str, &str>) {
    let job = harness.claim().await.unwrap();
    assert_eq!(job.id, expected);
    let args = match outcome {
        Ok(value) => FinishArgs::completed(job.token, json!(value)),
        Err(reason) => FinishArgs::failed(job.token, reason),
    };
    harness
        .queue
        .scripts()
        .move_to_finished(&job.id, args)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_continue_parent_on_failure_releases_parent_early() {
    let harness = TestHarness::new("flow-continue");
    let (parent, failing, healthy) = flow_with_failing_child(
        &harness,
        JobOptions::new().with_continue_parent_on_failure(),
    )
    .await;

    finish_claimed(&harness, &failing, Err("flaky upstream")).await;
    assert_eq!(
        assert_exclusive_state(&harness.queue, &parent).await,
        JobState::Waiting
    );
    let failed = harness
        .queue
        .get_failed_children_values(&parent)
        .await
        .unwrap();
    assert_eq!(
        failed.get(&harness.queue.keys().job(&failing)).map(String::as_str),
        Some("flaky upstream")
    );
    // The healthy child was queued first, so it still runs ahead of the
    // parent.
    harness.assert_state_eq(&healthy, JobState::Waiting).await;
}

#[tokio::test]
async fn test_ignore_dependency_on_failure_waits_for_the_rest() {
    let harness = TestHarness::new("flow-ignore");
    let (parent, failing, healthy) = flow_with_failing_child(
        &harness,
        JobOptions::new().with_ignore_dependency_on_failure(),
    )
    .await;

    finish_claimed(&harness, &failing, Err("skipped")).await;
    harness
        .assert_state_eq(&parent, JobState::WaitingChildren)
        .await;
    let counts = harness.queue.get_dependencies_count(&parent).await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.failed, 1);

    finish_claimed(&harness, &healthy, Ok("done")).await;
    assert_eq!(
        assert_exclusive_state(&harness.queue, &parent).await,
        JobState::Waiting
    );
    let failed = harness
        .queue
        .get_failed_children_values(&parent)
        .await
        .unwrap();
    assert_eq!(
        failed.get(&harness.queue.keys().job(&failing)).map(String::as_str),
        Some("skipped")
    );
}

#[tokio::test]
async fn test_remove_dependency_on_failure_forgets_the_child() {
    let harness = TestHarness::new("flow-remove");
    let (parent, failing, healthy) = flow_with_failing_child(
        &harness,
        JobOptions::new().with_remove_dependency_on_failure(),
    )
    .await;

    finish_claimed(&harness, &failing, Err("gone")).await;
    harness
        .assert_state_eq(&parent, JobState::WaitingChildren)
        .await;

    finish_claimed(&harness, &healthy, Ok("done")).await;
    assert_eq!(
        assert_exclusive_state(&harness.queue, &parent).await,
        JobState::Waiting
    );
    let counts = harness.queue.get_dependencies_count(&parent).await.unwrap();
    assert_eq!(
        counts,
        DependencyCounts {
            pending: 0,
            processed: 1,
            failed: 0,
            unsuccessful: 0,
        }
    );
}

#[tokio::test]
async fn test_lifo_retry_without_delay_runs_next() {
    let harness = TestHarness::new("lifo-retry");
    let urgent = harness
        .queue
        .add(
            "urgent",
            json!({}),
            JobOptions::new().with_attempts(2).with_lifo(true),
        )
        .await
        .unwrap();
    let job = harness.claim().await.unwrap();
    assert_eq!(job.id, urgent.id);
    for name in ["b", "c"] {
        harness
            .queue
            .add(name, json!({}), JobOptions::new())
            .await
            .unwrap();
    }

    assert_eq!(fail_attempt(&harness, &job).await, RetryDecision::RetryNow);
    let retried = harness.claim().await.unwrap();
    assert_eq!(retried.id, urgent.id);
    assert_eq!(retried.attempts_made, 1);
    assert_eq!(harness.claim().await.map(|job| job.name), Some("b".to_string()));
}

#[tokio::test]
async fn test_fifo_retry_without_delay_goes_to_the_back() {
    let harness = TestHarness::new("fifo-retry");
    let first = harness
        .queue
        .add("first", json!({}), JobOptions::new().with_attempts(2))
        .await
        .unwrap();
    let job = harness.claim().await.unwrap();
    harness
        .queue
        .add("second", json!({}), JobOptions::new())
        .await
        .unwrap();

    assert_eq!(fail_attempt(&harness, &job).await, RetryDecision::RetryNow);
    assert_eq!(
        harness.claim().await.map(|job| job.name),
        Some("second".to_string())
    );
    assert_eq!(harness.claim().await.map(|job| job.id), Some(first.id));
}

#[tokio::test]
async fn test_same_millisecond_delays_stay_fifo_after_promotion() {
    let harness = TestHarness::new("delay-fifo");
    for _ in 0..7 {
        harness
            .queue
            .add("filler", json!({}), JobOptions::new())
            .await
            .unwrap();
    }
    let delayed = JobOptions::new().with_delay(500);
    let a = harness.queue.add("a", json!({}), delayed.clone()).await.unwrap();
    let b = harness.queue.add("b", json!({}), delayed.clone()).await.unwrap();
    assert_eq!((a.id.as_str(), b.id.as_str()), ("8", "9"));

    harness.queue.scripts().promote(&a.id).await.unwrap();
    let c = harness.queue.add("c", json!({}), delayed).await.unwrap();
    assert_eq!(c.id, "10");

    let ids: Vec<_> = harness
        .queue
        .get_jobs(JobState::Delayed, 0, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ids, vec![b.id, c.id]);
}

#[tokio::test]
async fn test_flow_with_colliding_child_writes_nothing() {
    let harness = TestHarness::new("flow-atomic");
    harness
        .queue
        .add("standalone", json!({}), JobOptions::new().with_job_id("c2"))
        .await
        .unwrap();

    let result = harness
        .queue
        .add_flow(
            FlowNode::new("root", "flow-atomic", json!({}))
                .with_opts(JobOptions::new().with_job_id("root"))
                .with_child(FlowNode::new("leaf", "flow-atomic", json!({})))
                .with_child(
                    FlowNode::new("dup", "flow-atomic", json!({}))
                        .with_opts(JobOptions::new().with_job_id("c2")),
                ),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(harness.queue.count().await.unwrap(), 1);
    harness.assert_state_eq("root", JobState::Unknown).await;
}

#[tokio::test]
async fn test_delays_beyond_the_bound_are_rejected() {
    let harness = TestHarness::new("bounds");
    let err = harness
        .queue
        .add("far", json!({}), JobOptions::new().with_delay(1 << 52))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidOptions(_)));

    let handle = harness
        .queue
        .add("edge", json!({}), JobOptions::new().with_delay(MAX_DELAY_MS))
        .await
        .unwrap();
    let job = harness.job(&handle.id).await;
    assert_eq!(job.delay, MAX_DELAY_MS);
    harness.assert_state_eq(&handle.id, JobState::Delayed).await;

    let err = harness
        .queue
        .scripts()
        .change_delay(&handle.id, i64::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidOptions(_)));
}
