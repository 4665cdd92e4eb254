//! Redis-backed store shared by processes on different hosts.
//!
//! Scripts are closures, so they cannot be shipped to the server as Lua.
//! Instead every script runs under a store-wide Redis lock:
//!
//! 1. `SET lock token NX PX ttl` takes the lock, then `WATCH lock` guards it.
//! 2. The script runs against a [`Keyspace`] overlay that loads each key
//!    from Redis the first time it is touched and records every write as
//!    the equivalent Redis command.
//! 3. The recorded writes and the lock release are sent as one
//!    `MULTI`/`EXEC`. If the lock expired and was taken by someone else the
//!    transaction aborts and nothing is written.
//!
//! Scores round-trip through Redis doubles, which are exact up to `2^53`.
//! Delayed scores pack `timestamp * 4096`, which stays exact for due times
//! until 2039.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{Cmd, Connection, FromRedisValue, RedisError, RedisResult, Script, Value};
use tokio::runtime::{Handle, RuntimeFlavor};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::memory::{Keyspace, Snapshot};
use super::{Commands, Store, StreamEntry};

const RELEASE_LOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Shortest timeout `BZPOPMIN` accepts without blocking forever.
const MIN_BLOCK_SECS: f64 = 0.01;
const SCAN_COUNT: usize = 500;

/// Connection and locking settings of a [`RedisStore`].
#[derive(Clone, Debug)]
pub struct RedisStoreConfig {
    /// Key of the lock every script runs under. Stores sharing data must
    /// share the lock key.
    pub lock_key: String,
    /// Lock lifetime. A script still running when it lapses is aborted.
    pub lock_ttl: Duration,
    /// How long to wait for the lock before failing the script.
    pub acquire_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            lock_key: "flowq:store-lock".to_string(),
            lock_ttl: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl RedisStoreConfig {
    pub fn with_lock_key(mut self, lock_key: impl Into<String>) -> Self {
        self.lock_key = lock_key.into();
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }
}

/// [`Store`] persisting queues in Redis.
pub struct RedisStore {
    client: redis::Client,
    config: RedisStoreConfig,
    conn: tokio::sync::Mutex<Option<Connection>>,
    /// Idle connections for blocking marker waits.
    idle: Arc<Mutex<Vec<Connection>>>,
    /// Server time minus local time, refreshed by every script.
    clock_offset_ms: AtomicI64,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &self.client)
            .field("config", &self.config)
            .field("clock_offset_ms", &self.clock_offset_ms.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisStore {
    /// Connect lazily to `url`, e.g. `redis://127.0.0.1/`.
    pub fn open(url: &str) -> anyhow::Result<Self> {
        Self::with_config(url, RedisStoreConfig::default())
    }

    pub fn with_config(url: &str, config: RedisStoreConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            config,
            conn: tokio::sync::Mutex::new(None),
            idle: Arc::new(Mutex::new(Vec::new())),
            clock_offset_ms: AtomicI64::new(0),
        })
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn run_blocking<R>(
        &self,
        slot: &mut Option<Connection>,
        script: impl FnOnce(&mut dyn Commands) -> R,
    ) -> anyhow::Result<R> {
        if slot.is_none() {
            *slot = Some(self.client.get_connection()?);
        }
        let conn = slot
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("redis connection unavailable"))?;
        let outcome = self.transact(conn, script);
        if outcome.is_err() {
            // The connection may be mid-transaction; start over next time.
            *slot = None;
        }
        outcome
    }

    fn transact<R>(
        &self,
        conn: &mut Connection,
        script: impl FnOnce(&mut dyn Commands) -> R,
    ) -> anyhow::Result<R> {
        let token = Uuid::now_v7().to_string();
        self.acquire(conn, &token)?;
        let outcome = self.run_locked(conn, &token, script);
        if let Err(err) = &outcome {
            tracing::warn!(lock = %self.config.lock_key, error = %err, "store script aborted");
            let _ = redis::cmd("UNWATCH").query::<()>(conn);
            let released = Script::new(RELEASE_LOCK)
                .key(&self.config.lock_key)
                .arg(&token)
                .invoke::<i64>(conn);
            if let Err(err) = released {
                tracing::debug!(error = %err, "lock left to expire");
            }
        }
        outcome
    }

    fn acquire(&self, conn: &mut Connection, token: &str) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let ttl_ms = self.config.lock_ttl.as_millis().max(1) as u64;
        let mut pause = Duration::from_millis(1);
        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&self.config.lock_key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query(conn)?;
            if acquired.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for store lock {}", self.config.lock_key);
            }
            std::thread::sleep(pause);
            pause = (pause * 2).min(Duration::from_millis(20));
        }
    }

    fn run_locked<R>(
        &self,
        conn: &mut Connection,
        token: &str,
        script: impl FnOnce(&mut dyn Commands) -> R,
    ) -> anyhow::Result<R> {
        let lock_key = &self.config.lock_key;
        redis::cmd("WATCH").arg(lock_key).query::<()>(conn)?;
        let holder: Option<String> = redis::cmd("GET").arg(lock_key).query(conn)?;
        if holder.as_deref() != Some(token) {
            anyhow::bail!("lost store lock {lock_key} before the script ran");
        }
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query(conn)?;
        let now = secs * 1_000 + micros / 1_000;
        self.clock_offset_ms
            .store(now - SystemClock.now_ms(), Ordering::Relaxed);

        let mut overlay = Overlay::new(conn, now);
        let result = script(&mut overlay);
        let writes = overlay.finish()?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for cmd in writes {
            pipe.add_command(cmd).ignore();
        }
        pipe.cmd("DEL").arg(lock_key);
        let committed: Option<(i64,)> = pipe.query(conn)?;
        match committed {
            Some(_) => Ok(result),
            None => anyhow::bail!("lost store lock {lock_key} before commit"),
        }
    }
}

/// Run blocking Redis I/O without stalling other tasks on a multi-threaded
/// runtime. Single-threaded runtimes run it inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn run<R, F>(&self, script: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut dyn Commands) -> R + Send,
        R: Send,
    {
        let mut slot = self.conn.lock().await;
        blocking(|| self.run_blocking(&mut slot, script))
    }

    /// A wait dropped early still runs to its timeout on a blocking thread
    /// and may consume one marker. Markers are re-added by the next write.
    async fn wait_for_marker(
        &self,
        key: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<(String, i64)>> {
        let client = self.client.clone();
        let idle = Arc::clone(&self.idle);
        let key = key.to_string();
        let seconds = timeout.as_secs_f64().max(MIN_BLOCK_SECS);
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<(String, i64)>> {
            let pooled = idle.lock().pop();
            let mut conn = match pooled {
                Some(conn) => conn,
                None => client.get_connection()?,
            };
            let popped: Option<(String, String, f64)> = redis::cmd("BZPOPMIN")
                .arg(&key)
                .arg(seconds)
                .query(&mut conn)?;
            idle.lock().push(conn);
            Ok(popped.map(|(_, member, score)| (member, score as i64)))
        })
        .await?
    }

    fn now_ms(&self) -> i64 {
        SystemClock.now_ms() + self.clock_offset_ms.load(Ordering::Relaxed)
    }
}

/// Streams are never loaded whole; only their length and the entries
/// appended by this script are tracked.
#[derive(Default)]
struct StreamState {
    remote_len: usize,
    max_len: usize,
}

/// Working copy of the keys one script touches.
struct Overlay<'a> {
    conn: &'a mut Connection,
    local: Keyspace,
    loaded: HashSet<String>,
    streams: HashMap<String, StreamState>,
    writes: Vec<Cmd>,
    failure: Option<RedisError>,
}

impl<'a> Overlay<'a> {
    fn new(conn: &'a mut Connection, now: i64) -> Self {
        Self {
            conn,
            local: Keyspace::at(now),
            loaded: HashSet::new(),
            streams: HashMap::new(),
            writes: Vec::new(),
            failure: None,
        }
    }

    /// Writes to commit, or the first Redis error seen while loading.
    fn finish(self) -> RedisResult<Vec<Cmd>> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.writes),
        }
    }

    fn record(&mut self, cmd: &mut Cmd) {
        self.writes.push(cmd.clone());
    }

    fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> Option<T> {
        if self.failure.is_some() {
            return None;
        }
        match cmd.query(&mut *self.conn) {
            Ok(value) => Some(value),
            Err(err) => {
                self.failure = Some(err);
                None
            }
        }
    }

    /// Load `key` from Redis unless this script already has it.
    fn touch(&mut self, key: &str) {
        if self.failure.is_some() || !self.loaded.insert(key.to_string()) {
            return;
        }
        if let Err(err) = self.load(key) {
            self.failure = Some(err);
        }
    }

    /// Mark `key` as loaded without reading it; used before overwrites.
    fn claim(&mut self, key: &str) {
        self.loaded.insert(key.to_string());
        self.streams.remove(key);
    }

    fn load(&mut self, key: &str) -> RedisResult<()> {
        let conn = &mut *self.conn;
        let kind: String = redis::cmd("TYPE").arg(key).query(conn)?;
        let snapshot = match kind.as_str() {
            "none" => return Ok(()),
            "string" => Snapshot::Str(redis::cmd("GET").arg(key).query(conn)?),
            "hash" => Snapshot::Hash(redis::cmd("HGETALL").arg(key).query(conn)?),
            "list" => Snapshot::List(redis::cmd("LRANGE").arg(key).arg(0).arg(-1).query(conn)?),
            "set" => Snapshot::Set(redis::cmd("SMEMBERS").arg(key).query(conn)?),
            "zset" => {
                let flat: Vec<String> = redis::cmd("ZRANGE")
                    .arg(key)
                    .arg(0)
                    .arg(-1)
                    .arg("WITHSCORES")
                    .query(conn)?;
                Snapshot::ZSet(parse_scored(&flat)?)
            }
            "stream" => {
                let remote_len: usize = redis::cmd("XLEN").arg(key).query(conn)?;
                self.streams.insert(
                    key.to_string(),
                    StreamState {
                        remote_len,
                        max_len: 0,
                    },
                );
                return Ok(());
            }
            other => {
                return Err(RedisError::from((
                    redis::ErrorKind::TypeError,
                    "unsupported key type",
                    format!("{key} is a {other}"),
                )));
            }
        };
        let pttl: i64 = redis::cmd("PTTL").arg(key).query(conn)?;
        let expires_at = (pttl > 0).then(|| self.local.now_ms() + pttl);
        self.local.restore(key, snapshot, expires_at);
        Ok(())
    }

    fn remote_stream_entries(&mut self, key: &str, count: Option<usize>) -> Vec<StreamEntry> {
        if !self.streams.contains_key(key) {
            return Vec::new();
        }
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg("-").arg("+");
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        let raw: Option<Value> = self.query(&cmd);
        match raw.map(parse_stream_entries) {
            Some(Ok(entries)) => entries,
            Some(Err(err)) => {
                self.failure.get_or_insert(err);
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

/// Pair up a flat `member score member score ...` reply.
fn parse_scored(flat: &[String]) -> RedisResult<Vec<(String, i64)>> {
    flat.chunks_exact(2)
        .map(|pair| {
            let score: f64 = pair[1].parse().map_err(|_| {
                RedisError::from((
                    redis::ErrorKind::TypeError,
                    "score is not a number",
                    pair[1].clone(),
                ))
            })?;
            Ok((pair[0].clone(), score as i64))
        })
        .collect()
}

fn parse_stream_entries(raw: Value) -> RedisResult<Vec<StreamEntry>> {
    let Value::Bulk(items) = raw else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .map(|item| {
            let (id, flat): (String, Vec<String>) = FromRedisValue::from_redis_value(item)?;
            let fields = flat
                .chunks_exact(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            Ok(StreamEntry { id, fields })
        })
        .collect()
}

/// Escape glob metacharacters so `prefix` matches literally in `SCAN`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

impl Commands for Overlay<'_> {
    fn now_ms(&self) -> i64 {
        self.local.now_ms()
    }

    fn get(&mut self, key: &str) -> Option<String> {
        self.touch(key);
        self.local.get(key)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.claim(key);
        self.local.set(key, value);
        self.record(redis::cmd("SET").arg(key).arg(value));
    }

    fn set_px(&mut self, key: &str, value: &str, ttl_ms: i64) {
        self.claim(key);
        self.local.set_px(key, value, ttl_ms);
        self.record(redis::cmd("SET").arg(key).arg(value).arg("PX").arg(ttl_ms.max(1)));
    }

    fn set_nx(&mut self, key: &str, value: &str, ttl_ms: Option<i64>) -> bool {
        self.touch(key);
        let written = self.local.set_nx(key, value, ttl_ms);
        if written {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl_ms {
                cmd.arg("PX").arg(ttl.max(1));
            }
            self.record(&mut cmd);
        }
        written
    }

    fn incr_by(&mut self, key: &str, by: i64) -> i64 {
        self.touch(key);
        self.record(redis::cmd("INCRBY").arg(key).arg(by));
        self.local.incr_by(key, by)
    }

    fn del(&mut self, key: &str) -> bool {
        self.touch(key);
        let stream = self.streams.remove(key).is_some();
        let existed = self.local.del(key) || stream;
        if existed {
            self.record(redis::cmd("DEL").arg(key));
        }
        existed
    }

    fn exists(&mut self, key: &str) -> bool {
        self.touch(key);
        self.local.exists(key) || self.streams.contains_key(key)
    }

    fn pexpire(&mut self, key: &str, ttl_ms: i64) -> bool {
        self.touch(key);
        let applied = self.local.pexpire(key, ttl_ms);
        if applied {
            self.record(redis::cmd("PEXPIRE").arg(key).arg(ttl_ms.max(1)));
        }
        applied
    }

    fn pttl(&mut self, key: &str) -> i64 {
        self.touch(key);
        self.local.pttl(key)
    }

    fn rename(&mut self, from: &str, to: &str) -> bool {
        self.touch(from);
        self.claim(to);
        let renamed = self.local.rename(from, to);
        if renamed {
            self.record(redis::cmd("RENAME").arg(from).arg(to));
        }
        renamed
    }

    fn hget(&mut self, key: &str, field: &str) -> Option<String> {
        self.touch(key);
        self.local.hget(key, field)
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.touch(key);
        self.local.hset(key, field, value);
        self.record(redis::cmd("HSET").arg(key).arg(field).arg(value));
    }

    fn hdel(&mut self, key: &str, field: &str) -> bool {
        self.touch(key);
        let removed = self.local.hdel(key, field);
        if removed {
            self.record(redis::cmd("HDEL").arg(key).arg(field));
        }
        removed
    }

    fn hexists(&mut self, key: &str, field: &str) -> bool {
        self.touch(key);
        self.local.hexists(key, field)
    }

    fn hgetall(&mut self, key: &str) -> HashMap<String, String> {
        self.touch(key);
        self.local.hgetall(key)
    }

    fn hincrby(&mut self, key: &str, field: &str, by: i64) -> i64 {
        self.touch(key);
        self.record(redis::cmd("HINCRBY").arg(key).arg(field).arg(by));
        self.local.hincrby(key, field, by)
    }

    fn hlen(&mut self, key: &str) -> usize {
        self.touch(key);
        self.local.hlen(key)
    }

    fn lpush(&mut self, key: &str, value: &str) -> usize {
        self.touch(key);
        self.record(redis::cmd("LPUSH").arg(key).arg(value));
        self.local.lpush(key, value)
    }

    fn rpush(&mut self, key: &str, value: &str) -> usize {
        self.touch(key);
        self.record(redis::cmd("RPUSH").arg(key).arg(value));
        self.local.rpush(key, value)
    }

    fn rpoplpush(&mut self, from: &str, to: &str) -> Option<String> {
        self.touch(from);
        self.touch(to);
        let moved = self.local.rpoplpush(from, to);
        if moved.is_some() {
            self.record(redis::cmd("RPOPLPUSH").arg(from).arg(to));
        }
        moved
    }

    fn lrem(&mut self, key: &str, count: i64, value: &str) -> usize {
        self.touch(key);
        let removed = self.local.lrem(key, count, value);
        if removed > 0 {
            self.record(redis::cmd("LREM").arg(key).arg(count).arg(value));
        }
        removed
    }

    fn llen(&mut self, key: &str) -> usize {
        self.touch(key);
        self.local.llen(key)
    }

    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Vec<String> {
        self.touch(key);
        self.local.lrange(key, start, stop)
    }

    fn ltrim(&mut self, key: &str, start: i64, stop: i64) {
        self.touch(key);
        self.local.ltrim(key, start, stop);
        self.record(redis::cmd("LTRIM").arg(key).arg(start).arg(stop));
    }

    fn lpos(&mut self, key: &str, value: &str) -> Option<usize> {
        self.touch(key);
        self.local.lpos(key, value)
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) -> bool {
        self.touch(key);
        self.record(redis::cmd("ZADD").arg(key).arg(score).arg(member));
        self.local.zadd(key, score, member)
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        self.touch(key);
        let removed = self.local.zrem(key, member);
        if removed {
            self.record(redis::cmd("ZREM").arg(key).arg(member));
        }
        removed
    }

    fn zscore(&mut self, key: &str, member: &str) -> Option<i64> {
        self.touch(key);
        self.local.zscore(key, member)
    }

    fn zcard(&mut self, key: &str) -> usize {
        self.touch(key);
        self.local.zcard(key)
    }

    fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Vec<(String, i64)> {
        self.touch(key);
        self.local.zrange(key, start, stop)
    }

    fn zrevrange(&mut self, key: &str, start: i64, stop: i64) -> Vec<(String, i64)> {
        self.touch(key);
        self.local.zrevrange(key, start, stop)
    }

    fn zrangebyscore(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Vec<(String, i64)> {
        self.touch(key);
        self.local.zrangebyscore(key, min, max, limit)
    }

    fn zpopmin(&mut self, key: &str) -> Option<(String, i64)> {
        self.touch(key);
        let popped = self.local.zpopmin(key);
        if let Some((member, _)) = &popped {
            self.record(redis::cmd("ZREM").arg(key).arg(member));
        }
        popped
    }

    fn zcount(&mut self, key: &str, min: i64, max: i64) -> usize {
        self.touch(key);
        self.local.zcount(key, min, max)
    }

    fn sadd(&mut self, key: &str, member: &str) -> bool {
        self.touch(key);
        let added = self.local.sadd(key, member);
        if added {
            self.record(redis::cmd("SADD").arg(key).arg(member));
        }
        added
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        self.touch(key);
        let removed = self.local.srem(key, member);
        if removed {
            self.record(redis::cmd("SREM").arg(key).arg(member));
        }
        removed
    }

    fn smembers(&mut self, key: &str) -> Vec<String> {
        self.touch(key);
        self.local.smembers(key)
    }

    fn scard(&mut self, key: &str) -> usize {
        self.touch(key);
        self.local.scard(key)
    }

    fn sismember(&mut self, key: &str, member: &str) -> bool {
        self.touch(key);
        self.local.sismember(key, member)
    }

    fn xadd(&mut self, key: &str, fields: Vec<(String, String)>, max_len: usize) -> String {
        self.touch(key);
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key);
        if max_len > 0 {
            cmd.arg("MAXLEN").arg(max_len);
        }
        cmd.arg("*");
        for (field, value) in &fields {
            cmd.arg(field).arg(value);
        }
        self.record(&mut cmd);
        self.streams.entry(key.to_string()).or_default().max_len = max_len;
        self.local.xadd(key, fields, max_len)
    }

    fn xlen(&mut self, key: &str) -> usize {
        self.touch(key);
        let pending = self.local.xlen(key);
        match self.streams.get(key) {
            Some(state) if state.max_len > 0 => {
                (state.remote_len + pending).min(state.max_len)
            }
            Some(state) => state.remote_len + pending,
            None => pending,
        }
    }

    fn xrange(&mut self, key: &str, count: Option<usize>) -> Vec<StreamEntry> {
        self.touch(key);
        let mut entries = self.remote_stream_entries(key, count);
        entries.extend(self.local.xrange(key, None));
        if let Some(state) = self.streams.get(key).filter(|state| state.max_len > 0) {
            let excess = entries.len().saturating_sub(state.max_len);
            entries.drain(..excess);
        }
        entries.truncate(count.unwrap_or(usize::MAX));
        entries
    }

    fn keys_with_prefix(&mut self, prefix: &str) -> Vec<String> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT);
            let Some((next, batch)) = self.query::<(u64, Vec<String>)>(&cmd) else {
                break;
            };
            keys.extend(
                batch
                    .into_iter()
                    .filter(|key| !self.loaded.contains(key) || self.streams.contains_key(key)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.extend(self.local.keys_with_prefix(prefix));
        keys.extend(
            self.streams
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned(),
        );
        keys.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("flowq:mail"), "flowq:mail");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn test_parse_scored_pairs() {
        let flat: Vec<String> = ["a", "1", "b", "40960005"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            parse_scored(&flat).unwrap(),
            vec![("a".to_string(), 1), ("b".to_string(), 40_960_005)]
        );
        assert!(parse_scored(&["a".to_string(), "x".to_string()]).is_err());
    }

    #[test]
    fn test_parse_stream_entries_keeps_field_order() {
        let data = |s: &str| Value::Data(s.as_bytes().to_vec());
        let raw = Value::Bulk(vec![Value::Bulk(vec![
            data("1700000000000-0"),
            Value::Bulk(vec![data("event"), data("added"), data("jobId"), data("7")]),
        ])]);
        let entries = parse_stream_entries(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1700000000000-0");
        assert_eq!(
            entries[0].fields,
            vec![
                ("event".to_string(), "added".to_string()),
                ("jobId".to_string(), "7".to_string()),
            ]
        );
        assert!(parse_stream_entries(Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn test_config_builders() {
        let config = RedisStoreConfig::default()
            .with_lock_key("tenant-a:lock")
            .with_lock_ttl(Duration::from_secs(1))
            .with_acquire_timeout(Duration::from_millis(250));
        assert_eq!(config.lock_key, "tenant-a:lock");
        assert_eq!(config.lock_ttl, Duration::from_secs(1));
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
    }
}
