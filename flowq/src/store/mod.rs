//! Backing store abstraction.
//!
//! Every state transition in flowq is expressed as a script: a closure that
//! runs against [`Commands`] while the [`Store`] guarantees that no other
//! script observes its intermediate state. The store is the only
//! synchronization point between producers, workers and the sweeper.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Clock sources for the store.
pub mod clock;
/// In-process keyed store.
pub mod memory;
/// Redis-backed store shared across hosts.
#[cfg(feature = "redis")]
pub mod redis_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::{RedisStore, RedisStoreConfig};

/// One entry of an append-only event stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Synchronous view of the keyed store available inside one atomic script.
///
/// Sorted-set scores are integers. List indices follow the usual
/// convention where negative values count from the tail.
pub trait Commands {
    /// Store clock, frozen for the duration of the script.
    fn now_ms(&self) -> i64;

    // strings
    fn get(&mut self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
    fn set_px(&mut self, key: &str, value: &str, ttl_ms: i64);
    /// Set only when absent. Returns whether the key was written.
    fn set_nx(&mut self, key: &str, value: &str, ttl_ms: Option<i64>) -> bool;
    fn incr_by(&mut self, key: &str, by: i64) -> i64;
    fn del(&mut self, key: &str) -> bool;
    fn exists(&mut self, key: &str) -> bool;
    fn pexpire(&mut self, key: &str, ttl_ms: i64) -> bool;
    /// Remaining ttl: `-2` when the key is missing, `-1` without expiry.
    fn pttl(&mut self, key: &str) -> i64;
    fn rename(&mut self, from: &str, to: &str) -> bool;

    // hashes
    fn hget(&mut self, key: &str, field: &str) -> Option<String>;
    fn hset(&mut self, key: &str, field: &str, value: &str);
    fn hdel(&mut self, key: &str, field: &str) -> bool;
    fn hexists(&mut self, key: &str, field: &str) -> bool;
    fn hgetall(&mut self, key: &str) -> HashMap<String, String>;
    fn hincrby(&mut self, key: &str, field: &str, by: i64) -> i64;
    fn hlen(&mut self, key: &str) -> usize;

    // lists
    fn lpush(&mut self, key: &str, value: &str) -> usize;
    fn rpush(&mut self, key: &str, value: &str) -> usize;
    fn rpoplpush(&mut self, from: &str, to: &str) -> Option<String>;
    fn lrem(&mut self, key: &str, count: i64, value: &str) -> usize;
    fn llen(&mut self, key: &str) -> usize;
    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Vec<String>;
    fn ltrim(&mut self, key: &str, start: i64, stop: i64);
    fn lpos(&mut self, key: &str, value: &str) -> Option<usize>;

    // sorted sets
    fn zadd(&mut self, key: &str, score: i64, member: &str) -> bool;
    fn zrem(&mut self, key: &str, member: &str) -> bool;
    fn zscore(&mut self, key: &str, member: &str) -> Option<i64>;
    fn zcard(&mut self, key: &str) -> usize;
    fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Vec<(String, i64)>;
    fn zrevrange(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Vec<(String, i64)>;
    fn zrangebyscore(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Vec<(String, i64)>;
    fn zpopmin(&mut self, key: &str) -> Option<(String, i64)>;
    fn zcount(&mut self, key: &str, min: i64, max: i64) -> usize;

    // sets
    fn sadd(&mut self, key: &str, member: &str) -> bool;
    fn srem(&mut self, key: &str, member: &str) -> bool;
    fn smembers(&mut self, key: &str) -> Vec<String>;
    fn scard(&mut self, key: &str) -> usize;
    fn sismember(&mut self, key: &str, member: &str) -> bool;

    // streams
    /// Append an entry, trimming the stream to `max_len` entries.
    fn xadd(
        &mut self,
        key: &str,
        fields: Vec<(String, String)>,
        max_len: usize,
    ) -> String;
    fn xlen(&mut self, key: &str) -> usize;
    fn xrange(&mut self, key: &str, count: Option<usize>) -> Vec<StreamEntry>;

    /// All live keys starting with `prefix`.
    fn keys_with_prefix(&mut self, prefix: &str) -> Vec<String>;
}

/// A shared keyed store executing scripts atomically.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Run `script` as one indivisible unit.
    async fn run<R, F>(&self, script: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut dyn Commands) -> R + Send,
        R: Send;

    /// Pop the lowest entry of the marker sorted set at `key`, waiting up
    /// to `timeout` for one to appear.
    async fn wait_for_marker(
        &self,
        key: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, i64)>>;

    /// Current store time in epoch milliseconds.
    fn now_ms(&self) -> i64;
}
