use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque value identifying the current owner of a job lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl LockToken {
    /// Create a new token using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A lock currently held by this process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeldLock {
    pub job_id: String,
    pub token: LockToken,
    /// Store time at which the lock was taken.
    pub acquired_at: i64,
    /// Number of successful renewals so far.
    pub renewals: u32,
}

impl HeldLock {
    pub fn new(job_id: impl Into<String>, token: LockToken, now: i64) -> Self {
        Self {
            job_id: job_id.into(),
            token,
            acquired_at: now,
            renewals: 0,
        }
    }

    pub fn renewed(&mut self) {
        self.renewals = self.renewals.saturating_add(1);
    }
}

/// Interval between lock renewals.
///
/// An explicit renew time wins; otherwise the lock is renewed at half its
/// duration. The result is always strictly below the lock duration.
pub fn renew_interval_ms(lock_duration_ms: u64, renew_time_ms: Option<u64>) -> u64 {
    let half = (lock_duration_ms / 2).max(1);
    match renew_time_ms {
        Some(ms) if ms > 0 && ms < lock_duration_ms => ms,
        _ => half,
    }
}
