//! Redis-backed store shared by all replicas.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use tracing::info;

use super::{BucketOutcome, BucketSpec, CounterStore, StoreError};

/// INCRBY with the expiry set only when the key is created.
///
/// Running both commands in one script keeps a crash between them from
/// leaving a counter that never expires.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if count == tonumber(ARGV[1]) then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

/// Continuous-refill token bucket stored as a hash of {tokens, ts}.
///
/// ARGV: rate per second, capacity, cost, now (ms), ttl (ms).
/// Returns {allowed, remaining tokens, retry after ms}.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then
    tokens = capacity
    ts = now
end

local elapsed = math.max(0, now - ts) / 1000
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
local retry = 0
if tokens >= cost then
    tokens = tokens - cost
    allowed = 1
elseif rate > 0 then
    retry = math.ceil((cost - tokens) / rate * 1000)
else
    retry = 1000
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(math.max(now, ts)))
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {allowed, math.floor(tokens), retry}
"#;

/// A [`CounterStore`] on a Redis server or cluster endpoint.
pub struct RedisStore {
    conn: ConnectionManager,
    increment: Script,
    token_bucket: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %redact(url), "Connected to redis counter store");

        Ok(Self {
            conn,
            increment: Script::new(INCREMENT_SCRIPT),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }
}

/// Strip credentials from a connection string before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis().max(1)).min(i64::MAX as u128) as u64
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .increment
            .key(key)
            .arg(amount)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: i64,
    ) -> Result<BucketOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let (allowed, remaining, retry_after_ms): (i64, i64, i64) = self
            .token_bucket
            .key(key)
            .arg(spec.rate_per_sec)
            .arg(spec.capacity)
            .arg(cost)
            .arg(now_ms)
            .arg(ttl_ms(spec.fill_time()))
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            retry_after_ms: retry_after_ms.max(0) as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_ms(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys: Vec<String> = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // Keys can expire between SCAN and MGET
        let values: Vec<Option<String>> = ::redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
