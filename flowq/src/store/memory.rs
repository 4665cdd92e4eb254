use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::clock::{Clock, SystemClock};
use super::{Commands, StreamEntry, Store};

/// In-process store shared by producers and workers through an `Arc`.
///
/// All scripts serialize on one mutex, which gives the same isolation a
/// server-side script has. Expired keys are dropped lazily on access.
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    wakeup: Notify,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .keyspace
            .try_lock()
            .map(|guard| guard.entries.len())
            .unwrap_or_default();
        f.debug_struct("MemoryStore")
            .field("keys", &keys)
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            wakeup: Notify::new(),
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Run a script without waking marker waiters.
    fn run_quiet<R>(&self, script: impl FnOnce(&mut Keyspace) -> R) -> R {
        let mut keyspace = self.keyspace.lock();
        keyspace.now = self.clock.now_ms();
        script(&mut keyspace)
    }

    /// Wake every task blocked in [`Store::wait_for_marker`].
    pub fn wake_waiters(&self) {
        self.wakeup.notify_waiters();
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn run<R, F>(&self, script: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut dyn Commands) -> R + Send,
        R: Send,
    {
        let result = self.run_quiet(|keyspace| script(keyspace));
        self.wakeup.notify_waiters();
        Ok(result)
    }

    async fn wait_for_marker(
        &self,
        key: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, i64)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(marker) = self.run_quiet(|keyspace| keyspace.zpopmin(key))
            {
                return Ok(Some(marker));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

/// Keys and values behind one store. Also serves as the per-script
/// working copy of a networked store.
#[derive(Default)]
pub(crate) struct Keyspace {
    entries: HashMap<String, Entry>,
    now: i64,
    stream_seq: u64,
}

struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    ZSet(SortedSet),
    Set(BTreeSet<String>),
    Stream(VecDeque<StreamEntry>),
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &str) -> bool {
        let fresh = match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.ordered.remove(&(previous, member.to_string()));
                false
            }
            None => true,
        };
        self.ordered.insert((score, member.to_string()));
        fresh
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

/// Resolve `start..=stop` with negative indices into a concrete range.
fn index_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

macro_rules! typed_access {
    ($read:ident, $write:ident, $variant:ident, $ty:ty) => {
        fn $read(&mut self, key: &str) -> Option<&$ty> {
            match self.live(key).map(|entry| &entry.value) {
                Some(Value::$variant(inner)) => Some(inner),
                _ => None,
            }
        }

        fn $write(&mut self, key: &str) -> &mut $ty {
            let replace = !matches!(
                self.live(key).map(|entry| &entry.value),
                Some(Value::$variant(_))
            );
            if replace {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::$variant(Default::default()),
                        expires_at: None,
                    },
                );
            }
            match self.entries.get_mut(key).map(|entry| &mut entry.value) {
                Some(Value::$variant(inner)) => inner,
                _ => unreachable!("entry was just written"),
            }
        }
    };
}

/// Decoded value of one remote key, loaded into a [`Keyspace`].
#[cfg(feature = "redis")]
#[derive(Debug)]
pub(crate) enum Snapshot {
    Str(String),
    Hash(HashMap<String, String>),
    List(Vec<String>),
    ZSet(Vec<(String, i64)>),
    Set(Vec<String>),
}

#[cfg(feature = "redis")]
impl Keyspace {
    /// Empty keyspace frozen at `now`.
    pub(crate) fn at(now: i64) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    pub(crate) fn restore(&mut self, key: &str, snapshot: Snapshot, expires_at: Option<i64>) {
        let value = match snapshot {
            Snapshot::Str(value) => Value::Str(value),
            Snapshot::Hash(hash) => Value::Hash(hash),
            Snapshot::List(items) => Value::List(items.into()),
            Snapshot::ZSet(members) => {
                let mut zset = SortedSet::default();
                for (member, score) in members {
                    zset.insert(score, &member);
                }
                Value::ZSet(zset)
            }
            Snapshot::Set(members) => Value::Set(members.into_iter().collect()),
        };
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= self.now);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    typed_access!(hash, hash_mut, Hash, HashMap<String, String>);
    typed_access!(list, list_mut, List, VecDeque<String>);
    typed_access!(zset, zset_mut, ZSet, SortedSet);
    typed_access!(set, set_mut, Set, BTreeSet<String>);
    typed_access!(stream, stream_mut, Stream, VecDeque<StreamEntry>);

    /// Drop containers that became empty, matching keyed-store semantics.
    fn prune(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|entry| &entry.value) {
            Some(Value::Hash(inner)) => inner.is_empty(),
            Some(Value::List(inner)) => inner.is_empty(),
            Some(Value::ZSet(inner)) => inner.len() == 0,
            Some(Value::Set(inner)) => inner.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn write_str(&mut self, key: &str, value: &str, expires_at: Option<i64>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
    }
}

impl Commands for Keyspace {
    fn now_ms(&self) -> i64 {
        self.now
    }

    fn get(&mut self, key: &str) -> Option<String> {
        match self.live(key).map(|entry| &entry.value) {
            Some(Value::Str(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        self.write_str(key, value, None);
    }

    fn set_px(&mut self, key: &str, value: &str, ttl_ms: i64) {
        let expires_at = self.now.saturating_add(ttl_ms.max(1));
        self.write_str(key, value, Some(expires_at));
    }

    fn set_nx(&mut self, key: &str, value: &str, ttl_ms: Option<i64>) -> bool {
        if self.live(key).is_some() {
            return false;
        }
        let expires_at = ttl_ms.map(|ttl| self.now.saturating_add(ttl.max(1)));
        self.write_str(key, value, expires_at);
        true
    }

    fn incr_by(&mut self, key: &str, by: i64) -> i64 {
        let (current, expires_at) = match self.live(key) {
            Some(Entry {
                value: Value::Str(value),
                expires_at,
            }) => (value.parse::<i64>().unwrap_or(0), *expires_at),
            _ => (0, None),
        };
        let next = current.saturating_add(by);
        self.write_str(key, &next.to_string(), expires_at);
        next
    }

    fn del(&mut self, key: &str) -> bool {
        let existed = self.live(key).is_some();
        self.entries.remove(key);
        existed
    }

    fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn pexpire(&mut self, key: &str, ttl_ms: i64) -> bool {
        let now = self.now;
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(now.saturating_add(ttl_ms.max(1)));
                true
            }
            None => false,
        }
    }

    fn pttl(&mut self, key: &str) -> i64 {
        let now = self.now;
        match self.live(key) {
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => (*at - now).max(0),
            Some(_) => -1,
            None => -2,
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> bool {
        if self.live(from).is_none() {
            return false;
        }
        match self.entries.remove(from) {
            Some(entry) => {
                self.entries.insert(to.to_string(), entry);
                true
            }
            None => false,
        }
    }

    fn hget(&mut self, key: &str, field: &str) -> Option<String> {
        self.hash(key).and_then(|hash| hash.get(field).cloned())
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.hash_mut(key)
            .insert(field.to_string(), value.to_string());
    }

    fn hdel(&mut self, key: &str, field: &str) -> bool {
        let removed = self.hash_mut(key).remove(field).is_some();
        self.prune(key);
        removed
    }

    fn hexists(&mut self, key: &str, field: &str) -> bool {
        self.hash(key).is_some_and(|hash| hash.contains_key(field))
    }

    fn hgetall(&mut self, key: &str) -> HashMap<String, String> {
        self.hash(key).cloned().unwrap_or_default()
    }

    fn hincrby(&mut self, key: &str, field: &str, by: i64) -> i64 {
        let hash = self.hash_mut(key);
        let current = hash
            .get(field)
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current.saturating_add(by);
        hash.insert(field.to_string(), next.to_string());
        next
    }

    fn hlen(&mut self, key: &str) -> usize {
        self.hash(key).map_or(0, HashMap::len)
    }

    fn lpush(&mut self, key: &str, value: &str) -> usize {
        let list = self.list_mut(key);
        list.push_front(value.to_string());
        list.len()
    }

    fn rpush(&mut self, key: &str, value: &str) -> usize {
        let list = self.list_mut(key);
        list.push_back(value.to_string());
        list.len()
    }

    fn rpoplpush(&mut self, from: &str, to: &str) -> Option<String> {
        self.list(from)?;
        let value = self.list_mut(from).pop_back()?;
        self.prune(from);
        self.list_mut(to).push_front(value.clone());
        Some(value)
    }

    fn lrem(&mut self, key: &str, count: i64, value: &str) -> usize {
        if self.list(key).is_none() {
            return 0;
        }
        let list = self.list_mut(key);
        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0;
        if count >= 0 {
            let mut idx = 0;
            while idx < list.len() && removed < limit {
                if list[idx] == value {
                    list.remove(idx);
                    removed += 1;
                } else {
                    idx += 1;
                }
            }
        } else {
            let mut idx = list.len();
            while idx > 0 && removed < limit {
                idx -= 1;
                if list[idx] == value {
                    list.remove(idx);
                    removed += 1;
                }
            }
        }
        self.prune(key);
        removed
    }

    fn llen(&mut self, key: &str) -> usize {
        self.list(key).map_or(0, VecDeque::len)
    }

    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Vec<String> {
        let Some(list) = self.list(key) else {
            return Vec::new();
        };
        match index_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        }
    }

    fn ltrim(&mut self, key: &str, start: i64, stop: i64) {
        let Some(list) = self.list(key) else {
            return;
        };
        let kept: VecDeque<String> = match index_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => VecDeque::new(),
        };
        *self.list_mut(key) = kept;
        self.prune(key);
    }

    fn lpos(&mut self, key: &str, value: &str) -> Option<usize> {
        self.list(key)?.iter().position(|item| item == value)
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) -> bool {
        self.zset_mut(key).insert(score, member)
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        if self.zset(key).is_none() {
            return false;
        }
        let removed = self.zset_mut(key).remove(member);
        self.prune(key);
        removed
    }

    fn zscore(&mut self, key: &str, member: &str) -> Option<i64> {
        self.zset(key)?.scores.get(member).copied()
    }

    fn zcard(&mut self, key: &str) -> usize {
        self.zset(key).map_or(0, SortedSet::len)
    }

    fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Vec<(String, i64)> {
        let Some(zset) = self.zset(key) else {
            return Vec::new();
        };
        match index_range(zset.len(), start, stop) {
            Some((from, to)) => zset
                .ordered
                .iter()
                .skip(from)
                .take(to - from + 1)
                .map(|(score, member)| (member.clone(), *score))
                .collect(),
            None => Vec::new(),
        }
    }

    fn zrevrange(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Vec<(String, i64)> {
        let Some(zset) = self.zset(key) else {
            return Vec::new();
        };
        match index_range(zset.len(), start, stop) {
            Some((from, to)) => zset
                .ordered
                .iter()
                .rev()
                .skip(from)
                .take(to - from + 1)
                .map(|(score, member)| (member.clone(), *score))
                .collect(),
            None => Vec::new(),
        }
    }

    fn zrangebyscore(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Vec<(String, i64)> {
        let Some(zset) = self.zset(key) else {
            return Vec::new();
        };
        zset.ordered
            .iter()
            .skip_while(|(score, _)| *score < min)
            .take_while(|(score, _)| *score <= max)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }

    fn zpopmin(&mut self, key: &str) -> Option<(String, i64)> {
        let (score, member) = self.zset(key)?.ordered.first()?.clone();
        self.zset_mut(key).remove(&member);
        self.prune(key);
        Some((member, score))
    }

    fn zcount(&mut self, key: &str, min: i64, max: i64) -> usize {
        self.zset(key).map_or(0, |zset| {
            zset.ordered
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .count()
        })
    }

    fn sadd(&mut self, key: &str, member: &str) -> bool {
        self.set_mut(key).insert(member.to_string())
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        if self.set(key).is_none() {
            return false;
        }
        let removed = self.set_mut(key).remove(member);
        self.prune(key);
        removed
    }

    fn smembers(&mut self, key: &str) -> Vec<String> {
        self.set(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn scard(&mut self, key: &str) -> usize {
        self.set(key).map_or(0, BTreeSet::len)
    }

    fn sismember(&mut self, key: &str, member: &str) -> bool {
        self.set(key).is_some_and(|set| set.contains(member))
    }

    fn xadd(
        &mut self,
        key: &str,
        fields: Vec<(String, String)>,
        max_len: usize,
    ) -> String {
        self.stream_seq += 1;
        let id = format!("{}-{}", self.now, self.stream_seq);
        let stream = self.stream_mut(key);
        stream.push_back(StreamEntry {
            id: id.clone(),
            fields,
        });
        while max_len > 0 && stream.len() > max_len {
            stream.pop_front();
        }
        id
    }

    fn xlen(&mut self, key: &str) -> usize {
        self.stream(key).map_or(0, VecDeque::len)
    }

    fn xrange(&mut self, key: &str, count: Option<usize>) -> Vec<StreamEntry> {
        self.stream(key)
            .map(|stream| {
                stream
                    .iter()
                    .take(count.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn keys_with_prefix(&mut self, prefix: &str) -> Vec<String> {
        let now = self.now;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, entry)| {
                key.starts_with(prefix)
                    && entry.expires_at.is_none_or(|at| at > now)
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}
