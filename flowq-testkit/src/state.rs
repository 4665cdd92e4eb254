use flowq::*;

/// Every state structure of `queue` that holds `job_id`, by key suffix.
pub async fn state_memberships<S: Store>(queue: &Queue<S>, job_id: &str) -> Vec<&'static str> {
    let keys = queue.keys().clone();
    let id = job_id.to_string();
    let memberships = queue
        .store()
        .run(move |cmd| {
            let mut found = Vec::new();
            for (suffix, key) in [
                ("wait", keys.wait()),
                ("paused", keys.paused()),
                ("active", keys.active()),
            ] {
                if cmd.lpos(&key, &id).is_some() {
                    found.push(suffix);
                }
            }
            for (suffix, key) in [
                ("prioritized", keys.prioritized()),
                ("delayed", keys.delayed()),
                ("waiting-children", keys.waiting_children()),
                ("completed", keys.completed()),
                ("failed", keys.failed()),
            ] {
                if cmd.zscore(&key, &id).is_some() {
                    found.push(suffix);
                }
            }
            found
        })
        .await;
    match memberships {
        Ok(found) => found,
        Err(err) => panic!("read memberships of {job_id}: {err}"),
    }
}

/// Assert that `job_id` sits in exactly one state structure and return
/// the matching state.
pub async fn assert_exclusive_state<S: Store>(queue: &Queue<S>, job_id: &str) -> JobState {
    let found = state_memberships(queue, job_id).await;
    assert_eq!(
        found.len(),
        1,
        "Expected job {} in exactly one state, found {:?}",
        job_id,
        found
    );
    match found[0] {
        "wait" | "paused" => JobState::Waiting,
        "active" => JobState::Active,
        "prioritized" => JobState::Prioritized,
        "delayed" => JobState::Delayed,
        "waiting-children" => JobState::WaitingChildren,
        "completed" => JobState::Completed,
        _ => JobState::Failed,
    }
}
