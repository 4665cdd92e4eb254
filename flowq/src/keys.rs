use std::fmt;

/// Deterministic mapping from `(prefix, queue name, sub-key)` to store keys.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct QueueKeys {
    prefix: String,
    name: String,
    base: String,
}

macro_rules! queue_key {
    ($($(#[$doc:meta])* $fn_name:ident => $suffix:literal),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $fn_name(&self) -> String {
                self.sub($suffix)
            }
        )*
    };
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let name = name.into();
        let base = format!("{prefix}:{name}");
        Self { prefix, name, base }
    }

    /// Rebuild the key schema from a `prefix:name` base.
    ///
    /// The prefix itself may not contain `:`; the queue name may.
    pub fn from_base(base: &str) -> Option<Self> {
        let (prefix, name) = base.split_once(':')?;
        if prefix.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(prefix, name))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `prefix:name`, the namespace every key of this queue lives under.
    pub fn base(&self) -> &str {
        &self.base
    }

    fn sub(&self, suffix: &str) -> String {
        format!("{}:{}", self.base, suffix)
    }

    queue_key! {
        wait => "wait",
        paused => "paused",
        active => "active",
        /// Sorted set scored by the packed due timestamp.
        delayed => "delayed",
        prioritized => "prioritized",
        completed => "completed",
        failed => "failed",
        waiting_children => "waiting-children",
        meta => "meta",
        events => "events",
        /// Auto-increment counter for job ids.
        id => "id",
        /// Sorted set used as the blocking wake-up signal for workers.
        marker => "marker",
        stalled_check => "stalled-check",
        limiter => "limiter",
        /// Priority counter keeping FIFO order within a priority.
        priority_counter => "pc",
        /// Job scheduler index scored by next run.
        repeat => "repeat",
    }

    pub fn job(&self, job_id: &str) -> String {
        self.sub(job_id)
    }

    pub fn lock(&self, job_id: &str) -> String {
        format!("{}:lock", self.job(job_id))
    }

    pub fn logs(&self, job_id: &str) -> String {
        format!("{}:logs", self.job(job_id))
    }

    pub fn dependencies(&self, job_id: &str) -> String {
        format!("{}:dependencies", self.job(job_id))
    }

    pub fn processed(&self, job_id: &str) -> String {
        format!("{}:processed", self.job(job_id))
    }

    pub fn failed_children(&self, job_id: &str) -> String {
        format!("{}:failed", self.job(job_id))
    }

    pub fn unsuccessful(&self, job_id: &str) -> String {
        format!("{}:unsuccessful", self.job(job_id))
    }

    pub fn limiter_group(&self, group: &str) -> String {
        format!("{}:{}", self.limiter(), group)
    }

    pub fn deduplication(&self, dedup_id: &str) -> String {
        self.sub(&format!("de:{dedup_id}"))
    }

    /// Counter of delayed jobs sharing the due millisecond `timestamp`.
    pub fn delayed_slot(&self, timestamp: i64) -> String {
        self.sub(&format!("delayed:{timestamp}"))
    }

    pub fn job_scheduler(&self, scheduler_id: &str) -> String {
        self.sub(&format!("repeat:{scheduler_id}"))
    }
}

impl fmt::Display for QueueKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}
