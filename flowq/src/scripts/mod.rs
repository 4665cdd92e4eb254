//! The script protocol.
//!
//! Every state transition is a synchronous function over
//! [`Commands`](crate::store::Commands) executed through [`Store::run`], so
//! each one is all-or-nothing with respect to every other script. Shared
//! steps such as choosing the wait target, packing delayed scores or
//! pruning a parent edge live in this module as plain functions and are
//! composed by the transition files below.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{QueueError, QueueResult, ScriptError};
use crate::job::{JobState, field};
use crate::keys::QueueKeys;
use crate::lease::LockToken;
use crate::opts::{JobOptions, KeepJobs, ParentFailurePolicy, ParentRef};
use crate::store::{Commands, Store};

mod active;
mod add;
mod admin;
mod delay;
mod finish;
mod lock;
mod remove;
mod scheduler;

pub use active::{FetchArgs, Fetched, LimiterArgs};
pub use add::{AddOutcome, NewJob};
pub use admin::Dependencies;
pub use delay::AttemptFailure;
pub use finish::{FinishArgs, FinishTarget};
pub use lock::StalledReport;

pub(crate) use add::{EncodedJob, add_encoded, check_flow};

/// Delayed scores pack `timestamp * 4096 + slot`.
pub(crate) const DELAY_SLOTS: i64 = 4096;
/// Latest due timestamp whose packed score still fits an `i64`.
pub(crate) const MAX_DELAYED_TIMESTAMP: i64 = i64::MAX / DELAY_SLOTS - 1;
/// How long a slot counter outlives its millisecond.
const DELAY_SLOT_TTL_MS: i64 = 60_000;
/// Delayed jobs promoted per pass.
pub(crate) const PROMOTE_BATCH: usize = 1000;

const META_PAUSED: &str = "paused";
const META_CONCURRENCY: &str = "concurrency";
const BASE_MARKER: &str = "0";
const DELAY_MARKER: &str = "1";

/// Failed reason recorded when the stalled limit is exceeded.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Async entry point to the scripts of one queue.
pub struct Scripts<S> {
    store: Arc<S>,
    keys: QueueKeys,
    max_events: usize,
}

impl<S> Clone for Scripts<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            max_events: self.max_events,
        }
    }
}

impl<S> std::fmt::Debug for Scripts<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripts")
            .field("store", &std::any::type_name::<S>())
            .field("queue", &self.keys.base())
            .field("max_events", &self.max_events)
            .finish()
    }
}

impl<S> Scripts<S> {
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: Store> Scripts<S> {
    pub fn new(store: Arc<S>, keys: QueueKeys, max_events: usize) -> Self {
        Self {
            store,
            keys,
            max_events: max_events.max(1),
        }
    }

    /// Run one script and attach command context to its status code.
    pub(crate) async fn exec<R, F>(
        &self,
        command: &'static str,
        job_id: &str,
        script: F,
    ) -> QueueResult<R>
    where
        F: FnOnce(&mut dyn Commands, &Ctx) -> Result<R, ScriptError> + Send,
        R: Send,
    {
        let ctx = Ctx {
            keys: self.keys.clone(),
            max_events: self.max_events,
        };
        let result = self.store.run(move |cmd| script(cmd, &ctx)).await?;
        result.map_err(|err| QueueError::script(command, job_id, err))
    }

    /// Run a script that cannot fail with a status code.
    pub(crate) async fn exec_infallible<R, F>(&self, script: F) -> QueueResult<R>
    where
        F: FnOnce(&mut dyn Commands, &Ctx) -> R + Send,
        R: Send,
    {
        let ctx = Ctx {
            keys: self.keys.clone(),
            max_events: self.max_events,
        };
        Ok(self.store.run(move |cmd| script(cmd, &ctx)).await?)
    }
}

/// Per-script context: which queue the script works on.
#[derive(Clone, Debug)]
pub(crate) struct Ctx {
    pub keys: QueueKeys,
    pub max_events: usize,
}

impl Ctx {
    /// Same settings, different queue. Used when a transition crosses
    /// into a parent living in another queue.
    pub fn for_queue(&self, keys: QueueKeys) -> Ctx {
        Ctx {
            keys,
            max_events: self.max_events,
        }
    }

    pub fn emit(
        &self,
        cmd: &mut dyn Commands,
        event: &str,
        job_id: &str,
        extra: &[(&str, String)],
    ) {
        let mut fields = Vec::with_capacity(extra.len() + 2);
        fields.push(("event".to_string(), event.to_string()));
        fields.push(("jobId".to_string(), job_id.to_string()));
        fields.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));
        cmd.xadd(&self.keys.events(), fields, self.max_events);
    }

    pub fn emit_queue(
        &self,
        cmd: &mut dyn Commands,
        event: &str,
        extra: &[(&str, String)],
    ) {
        let mut fields = vec![("event".to_string(), event.to_string())];
        fields.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));
        cmd.xadd(&self.keys.events(), fields, self.max_events);
    }
}

pub(crate) fn is_paused(cmd: &mut dyn Commands, keys: &QueueKeys) -> bool {
    cmd.hexists(&keys.meta(), META_PAUSED)
}

pub(crate) fn global_concurrency(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
) -> Option<usize> {
    cmd.hget(&keys.meta(), META_CONCURRENCY)
        .and_then(|raw| raw.parse().ok())
        .filter(|limit| *limit > 0)
}

/// Whether the queue-wide concurrency limit is reached.
pub(crate) fn is_maxed(cmd: &mut dyn Commands, keys: &QueueKeys) -> bool {
    match global_concurrency(cmd, keys) {
        Some(limit) => cmd.llen(&keys.active()) >= limit,
        None => false,
    }
}

/// List new work is pushed to: `paused` while the queue is paused.
fn target_list(cmd: &mut dyn Commands, keys: &QueueKeys) -> (String, bool) {
    if is_paused(cmd, keys) {
        (keys.paused(), true)
    } else {
        (keys.wait(), false)
    }
}

fn add_base_marker(cmd: &mut dyn Commands, keys: &QueueKeys) {
    cmd.zadd(&keys.marker(), 0, BASE_MARKER);
}

/// Wake a blocked worker if claimable work remains.
pub(crate) fn signal_if_ready(cmd: &mut dyn Commands, keys: &QueueKeys) {
    if is_paused(cmd, keys) || is_maxed(cmd, keys) {
        return;
    }
    if cmd.llen(&keys.wait()) > 0 || cmd.zcard(&keys.prioritized()) > 0 {
        add_base_marker(cmd, keys);
    }
}

/// Point the delay marker at the earliest delayed job.
pub(crate) fn refresh_delay_marker(cmd: &mut dyn Commands, keys: &QueueKeys) {
    match next_delayed_timestamp(cmd, keys) {
        Some(at) if !is_paused(cmd, keys) => {
            cmd.zadd(&keys.marker(), at, DELAY_MARKER);
        }
        _ => {
            cmd.zrem(&keys.marker(), DELAY_MARKER);
        }
    }
}

pub(crate) fn next_delayed_timestamp(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
) -> Option<i64> {
    cmd.zrange(&keys.delayed(), 0, 0)
        .first()
        .map(|(_, score)| score / DELAY_SLOTS)
}

/// Push a job id to the wait list. LIFO jobs go to the tail and are popped
/// next.
pub(crate) fn push_to_wait(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    lifo: bool,
) {
    let (target, paused) = target_list(cmd, keys);
    if lifo {
        cmd.rpush(&target, job_id);
    } else {
        cmd.lpush(&target, job_id);
    }
    if !paused && !is_maxed(cmd, keys) {
        add_base_marker(cmd, keys);
    }
}

/// Insert into the prioritized set. Lower priority values run first, FIFO
/// within the same priority.
pub(crate) fn add_prioritized(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    priority: u32,
) {
    let counter = cmd.incr_by(&keys.priority_counter(), 1) & 0xffff_ffff;
    let score = (i64::from(priority) << 32) | counter;
    cmd.zadd(&keys.prioritized(), score, job_id);
    if !is_paused(cmd, keys) && !is_maxed(cmd, keys) {
        add_base_marker(cmd, keys);
    }
}

/// Score for a job delayed until `timestamp`.
///
/// Siblings due in the same millisecond take increasing slots from a
/// per-millisecond counter, so a sibling leaving early never frees a slot
/// ahead of the ones still waiting. Once all 4096 are used they share the
/// last one and order by id.
pub(crate) fn delayed_score(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    timestamp: i64,
) -> i64 {
    let timestamp = timestamp.clamp(0, MAX_DELAYED_TIMESTAMP);
    let base = timestamp * DELAY_SLOTS;
    let counter = keys.delayed_slot(timestamp);
    let mut slot = cmd.incr_by(&counter, 1) - 1;
    if slot == 0 {
        // Fresh counter: start after any sibling still in the set.
        let siblings = cmd.zrangebyscore(&keys.delayed(), base, base + DELAY_SLOTS - 1, None);
        if let Some((_, top)) = siblings.last() {
            slot = top - base + 1;
            cmd.incr_by(&counter, slot);
        }
    }
    let now = cmd.now_ms();
    cmd.pexpire(
        &counter,
        timestamp.saturating_sub(now).max(0).saturating_add(DELAY_SLOT_TTL_MS),
    );
    base + slot.min(DELAY_SLOTS - 1)
}

pub(crate) fn add_delayed(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    timestamp: i64,
) {
    let score = delayed_score(cmd, keys, timestamp);
    cmd.zadd(&keys.delayed(), score, job_id);
    refresh_delay_marker(cmd, keys);
}

pub(crate) fn load_opts(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
) -> JobOptions {
    cmd.hget(&keys.job(job_id), field::OPTS)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub(crate) fn load_parent(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
) -> Option<ParentRef> {
    cmd.hget(&keys.job(job_id), field::PARENT)
        .and_then(|raw| serde_json::from_str(&raw).ok())
}

pub(crate) fn parent_json(parent: &ParentRef) -> String {
    serde_json::json!({ "id": parent.id, "queueKey": parent.queue }).to_string()
}

/// Put a job back into the claimable structures honoring its priority.
pub(crate) fn enqueue_ready(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    lifo: bool,
) {
    let priority: u32 = cmd
        .hget(&keys.job(job_id), field::PRIORITY)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    if priority > 0 {
        add_prioritized(cmd, keys, job_id, priority);
    } else {
        push_to_wait(cmd, keys, job_id, lifo);
    }
}

/// Move delayed jobs whose due time has passed. Returns how many moved.
pub(crate) fn promote_due_delayed(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    now: i64,
    limit: usize,
) -> usize {
    let keys = &ctx.keys;
    let max = now.clamp(0, MAX_DELAYED_TIMESTAMP) * DELAY_SLOTS + DELAY_SLOTS - 1;
    let due = cmd.zrangebyscore(&keys.delayed(), i64::MIN, max, Some(limit));
    for (job_id, _) in &due {
        cmd.zrem(&keys.delayed(), job_id);
        cmd.hset(&keys.job(job_id), field::DELAY, "0");
        let lifo = load_opts(cmd, keys, job_id).lifo;
        enqueue_ready(cmd, keys, job_id, lifo);
        ctx.emit(cmd, "waiting", job_id, &[("prev", "delayed".into())]);
    }
    if !due.is_empty() {
        refresh_delay_marker(cmd, keys);
    }
    due.len()
}

/// Find the structure currently holding a job.
pub(crate) fn locate(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
) -> JobState {
    if cmd.zscore(&keys.completed(), job_id).is_some() {
        JobState::Completed
    } else if cmd.zscore(&keys.failed(), job_id).is_some() {
        JobState::Failed
    } else if cmd.zscore(&keys.delayed(), job_id).is_some() {
        JobState::Delayed
    } else if cmd.zscore(&keys.prioritized(), job_id).is_some() {
        JobState::Prioritized
    } else if cmd.zscore(&keys.waiting_children(), job_id).is_some() {
        JobState::WaitingChildren
    } else if cmd.lpos(&keys.active(), job_id).is_some() {
        JobState::Active
    } else if cmd.lpos(&keys.wait(), job_id).is_some()
        || cmd.lpos(&keys.paused(), job_id).is_some()
    {
        JobState::Waiting
    } else {
        JobState::Unknown
    }
}

fn remove_from_all(cmd: &mut dyn Commands, keys: &QueueKeys, job_id: &str) {
    for list in [keys.wait(), keys.paused(), keys.active()] {
        cmd.lrem(&list, 0, job_id);
    }
    for set in [
        keys.delayed(),
        keys.prioritized(),
        keys.completed(),
        keys.failed(),
        keys.waiting_children(),
    ] {
        cmd.zrem(&set, job_id);
    }
}

fn delete_job_keys(cmd: &mut dyn Commands, keys: &QueueKeys, job_id: &str) {
    for key in [
        keys.job(job_id),
        keys.lock(job_id),
        keys.logs(job_id),
        keys.dependencies(job_id),
        keys.processed(job_id),
        keys.failed_children(job_id),
        keys.unsuccessful(job_id),
    ] {
        cmd.del(&key);
    }
}

/// Drop the deduplication key if it still points at this job.
pub(crate) fn release_dedup(cmd: &mut dyn Commands, keys: &QueueKeys, job_id: &str) {
    let Some(dedup_id) = cmd.hget(&keys.job(job_id), field::DEDUPLICATION_ID) else {
        return;
    };
    let dedup_key = keys.deduplication(&dedup_id);
    if cmd.get(&dedup_key).as_deref() == Some(job_id) {
        cmd.del(&dedup_key);
    }
}

/// Resolve a full job key into its queue and id.
pub(crate) fn split_job_key(
    cmd: &mut dyn Commands,
    job_key: &str,
) -> Option<(QueueKeys, String)> {
    let job_id = cmd.hget(job_key, field::ID)?;
    let base = job_key.strip_suffix(&format!(":{job_id}"))?;
    Some((QueueKeys::from_base(base)?, job_id))
}

/// Move a parent out of `waiting-children`. Only the script that actually
/// removes it from the set performs the move, so repeated calls are
/// harmless.
pub(crate) fn move_parent_to_wait(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    parent_id: &str,
) {
    let keys = &ctx.keys;
    if !cmd.zrem(&keys.waiting_children(), parent_id) {
        return;
    }
    let now = cmd.now_ms();
    let delay: i64 = cmd
        .hget(&keys.job(parent_id), field::DELAY)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    if delay > 0 {
        let due = now.saturating_add(delay);
        add_delayed(cmd, keys, parent_id, due);
        ctx.emit(cmd, "delayed", parent_id, &[("delay", due.to_string())]);
    } else {
        let lifo = load_opts(cmd, keys, parent_id).lifo;
        enqueue_ready(cmd, keys, parent_id, lifo);
        ctx.emit(
            cmd,
            "waiting",
            parent_id,
            &[("prev", JobState::WaitingChildren.as_str().into())],
        );
    }
}

fn parent_ctx(ctx: &Ctx, parent: &ParentRef) -> Option<Ctx> {
    QueueKeys::from_base(&parent.queue).map(|keys| ctx.for_queue(keys))
}

/// Record a completed child on its parent and unblock the parent when
/// nothing else is pending.
pub(crate) fn on_child_completed(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    child_key: &str,
    parent: &ParentRef,
    return_value: &str,
) {
    let Some(pctx) = parent_ctx(ctx, parent) else {
        return;
    };
    let pkeys = &pctx.keys;
    if !cmd.exists(&pkeys.job(&parent.id)) {
        return;
    }
    let dependencies = pkeys.dependencies(&parent.id);
    if cmd.srem(&dependencies, child_key) {
        cmd.hset(&pkeys.processed(&parent.id), child_key, return_value);
        if cmd.scard(&dependencies) == 0 {
            move_parent_to_wait(cmd, &pctx, &parent.id);
        }
    }
}

/// Apply a failed child's parent policy.
pub(crate) fn on_child_failed(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    child_key: &str,
    parent: &ParentRef,
    policy: ParentFailurePolicy,
    reason: &str,
    fallback_keep: Option<&KeepJobs>,
) {
    let Some(pctx) = parent_ctx(ctx, parent) else {
        return;
    };
    let pkeys = pctx.keys.clone();
    if !cmd.exists(&pkeys.job(&parent.id)) {
        return;
    }
    let dependencies = pkeys.dependencies(&parent.id);
    let now = cmd.now_ms();
    match policy {
        ParentFailurePolicy::Fail => {
            cmd.hset(&pkeys.failed_children(&parent.id), child_key, reason);
            if cmd.zrem(&pkeys.waiting_children(), &parent.id) {
                let parent_reason = format!("child {child_key} failed");
                fail_job(
                    cmd,
                    &pctx,
                    &parent.id,
                    &parent_reason,
                    "waiting-children",
                    now,
                    fallback_keep,
                );
            } else {
                cmd.zadd(&pkeys.unsuccessful(&parent.id), now, child_key);
            }
        }
        ParentFailurePolicy::Continue => {
            cmd.hset(&pkeys.failed_children(&parent.id), child_key, reason);
            cmd.srem(&dependencies, child_key);
            move_parent_to_wait(cmd, &pctx, &parent.id);
        }
        ParentFailurePolicy::Ignore => {
            cmd.hset(&pkeys.failed_children(&parent.id), child_key, reason);
            if cmd.srem(&dependencies, child_key) && cmd.scard(&dependencies) == 0 {
                move_parent_to_wait(cmd, &pctx, &parent.id);
            }
        }
        ParentFailurePolicy::Remove => {
            if cmd.srem(&dependencies, child_key) && cmd.scard(&dependencies) == 0 {
                move_parent_to_wait(cmd, &pctx, &parent.id);
            }
        }
        ParentFailurePolicy::Block => {
            cmd.zadd(&pkeys.unsuccessful(&parent.id), now, child_key);
        }
    }
}

/// Detach a job that is going away from its parent.
fn prune_parent_edge(cmd: &mut dyn Commands, ctx: &Ctx, job_id: &str) {
    let Some(parent) = load_parent(cmd, &ctx.keys, job_id) else {
        return;
    };
    let Some(pctx) = parent_ctx(ctx, &parent) else {
        return;
    };
    let child_key = ctx.keys.job(job_id);
    let pkeys = &pctx.keys;
    cmd.zrem(&pkeys.unsuccessful(&parent.id), &child_key);
    let dependencies = pkeys.dependencies(&parent.id);
    if cmd.srem(&dependencies, &child_key) && cmd.scard(&dependencies) == 0 {
        move_parent_to_wait(cmd, &pctx, &parent.id);
    }
}

/// Delete a job and every trace of it. Returns the state it was in.
pub(crate) fn purge_job(cmd: &mut dyn Commands, ctx: &Ctx, job_id: &str) -> JobState {
    let keys = &ctx.keys;
    let state = locate(cmd, keys, job_id);
    remove_from_all(cmd, keys, job_id);
    prune_parent_edge(cmd, ctx, job_id);
    release_dedup(cmd, keys, job_id);
    delete_job_keys(cmd, keys, job_id);
    state
}

/// Enforce a retention policy on a finished set after `job_id` entered it.
pub(crate) fn apply_keep(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    set_key: &str,
    keep: Option<&KeepJobs>,
    job_id: &str,
    now: i64,
) {
    match keep {
        None | Some(KeepJobs::Remove(false)) => {}
        Some(KeepJobs::Remove(true)) | Some(KeepJobs::Count(0)) => {
            purge_job(cmd, ctx, job_id);
        }
        Some(KeepJobs::Count(count)) => trim_by_count(cmd, ctx, set_key, *count, None),
        Some(KeepJobs::Policy { age, count, limit }) => {
            if let Some(age) = age {
                let cutoff = now - age.saturating_mul(1000);
                let expired = cmd.zrangebyscore(set_key, i64::MIN, cutoff - 1, *limit);
                for (old_id, _) in expired {
                    purge_job(cmd, ctx, &old_id);
                }
            }
            if let Some(count) = count {
                trim_by_count(cmd, ctx, set_key, *count, *limit);
            }
        }
    }
}

fn trim_by_count(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    set_key: &str,
    count: usize,
    limit: Option<usize>,
) {
    let surplus = cmd.zrevrange(set_key, count as i64, -1);
    let take = limit.unwrap_or(surplus.len());
    for (old_id, _) in surplus.into_iter().take(take) {
        purge_job(cmd, ctx, &old_id);
    }
}

/// Record a job as failed and run everything that follows from it. The
/// caller has already taken it out of its previous structure.
/// Record a failure and move the job to `failed`. `prev` names the state
/// the job is leaving.
pub(crate) fn fail_job(
    cmd: &mut dyn Commands,
    ctx: &Ctx,
    job_id: &str,
    reason: &str,
    prev: &str,
    now: i64,
    fallback_keep: Option<&KeepJobs>,
) {
    let keys = &ctx.keys;
    let job_key = keys.job(job_id);
    cmd.hset(&job_key, field::FAILED_REASON, reason);
    cmd.hset(&job_key, field::FINISHED_ON, &now.to_string());
    cmd.zadd(&keys.failed(), now, job_id);
    ctx.emit(
        cmd,
        "failed",
        job_id,
        &[("failedReason", reason.to_string()), ("prev", prev.to_string())],
    );
    release_dedup(cmd, keys, job_id);

    let opts = load_opts(cmd, keys, job_id);
    if let Some(parent) = load_parent(cmd, keys, job_id) {
        on_child_failed(
            cmd,
            ctx,
            &job_key,
            &parent,
            opts.parent_failure_policy(),
            reason,
            fallback_keep,
        );
    }
    let keep = opts.remove_on_fail.as_ref().or(fallback_keep);
    apply_keep(cmd, ctx, &keys.failed(), keep, job_id, now);
}

/// Verify the caller owns the job lock. Does not release it.
pub(crate) fn check_lock(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    token: Option<LockToken>,
) -> Result<(), ScriptError> {
    let Some(token) = token else {
        return Ok(());
    };
    match cmd.get(&keys.lock(job_id)) {
        None => Err(ScriptError::JobLockNotExist),
        Some(holder) if holder != token.to_string() => Err(ScriptError::JobLockMismatch),
        Some(_) => Ok(()),
    }
}

pub(crate) fn require_job(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
) -> Result<(), ScriptError> {
    if cmd.exists(&keys.job(job_id)) {
        Ok(())
    } else {
        Err(ScriptError::JobNotExist)
    }
}

/// Append an entry to the stored stacktrace, keeping at most `limit`.
pub(crate) fn push_stacktrace(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
    entries: &[String],
    limit: Option<usize>,
) {
    if entries.is_empty() {
        return;
    }
    let job_key = keys.job(job_id);
    let mut stack: Vec<String> = cmd
        .hget(&job_key, field::STACKTRACE)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    stack.extend(entries.iter().cloned());
    if let Some(limit) = limit {
        let excess = stack.len().saturating_sub(limit);
        stack.drain(..excess);
    }
    let encoded = Value::from(stack).to_string();
    cmd.hset(&job_key, field::STACKTRACE, &encoded);
}

pub(crate) fn job_hash(
    cmd: &mut dyn Commands,
    keys: &QueueKeys,
    job_id: &str,
) -> Option<HashMap<String, String>> {
    let hash = cmd.hgetall(&keys.job(job_id));
    (!hash.is_empty()).then_some(hash)
}
