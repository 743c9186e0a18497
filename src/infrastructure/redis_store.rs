//! Redis-backed `SharedStore`.
//!
//! Lets any number of process instances share admission counters, circuit
//! records and sessions.
//!
//! ## Mapping
//!
//! - `atomic` runs as a `MULTI`/`EXEC` pipeline; a capped sorted-set add is
//!   queued as an `EVAL`, which Redis runs inside the transaction
//! - `compare_and_swap` runs as a Lua script, so the compare and the write
//!   happen in one server-side step
//! - Every key is written under a configurable prefix, which `flush_prefix`
//!   uses to clear one deployment's state
//!
//! ## Example
//!
//! ```rust,ignore
//! use resilience_gate::{RedisStore, RedisStoreConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RedisStoreConfig {
//!         key_prefix: "gateway:".to_string(),
//!     };
//!     let store = RedisStore::connect_with_config("redis://127.0.0.1/", config)
//!         .await
//!         .expect("Failed to connect to Redis");
//! }
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::fmt;
use std::time::Duration;

use crate::application::ports::{Command, Reply, SharedStore, StoreError};

/// Compare the current value with ARGV[2] (or with absence when ARGV[1] is
/// "1") and write ARGV[3] with an optional PX of ARGV[4] on match.
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current then return 0 end
else
  if (not current) or current ~= ARGV[2] then return 0 end
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// Add ARGV[3] with score ARGV[2] while ZCARD stays below ARGV[1].
const ZADD_CAPPED: &str = r#"
if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
  return 1
end
return 0
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Key prefix for Redis keys (default: "resilience-gate:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "resilience-gate:".to_string(),
        }
    }
}

/// Redis-backed shared store.
///
/// `ConnectionManager` multiplexes one connection and reconnects on its own;
/// cloning it per call is cheap.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    cas_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn store_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Unavailable(e.to_string())
    } else if e.is_timeout() {
        StoreError::Unavailable(format!("redis timeout: {}", e))
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().try_into().unwrap_or(u64::MAX).max(1)
}

/// Redis score bound syntax, which spells infinities `-inf` and `+inf`.
fn score_bound(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            config,
            cas_script: Script::new(COMPARE_AND_SWAP),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Delete every key under this store's prefix. Returns how many were removed.
    pub async fn flush_prefix(&self) -> Result<u64, StoreError> {
        let pattern = format!("{}*", self.config.key_prefix);
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(store_error)?;
                removed += deleted;
            }

            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        Ok(removed)
    }

    fn push_command(&self, pipe: &mut redis::Pipeline, command: &Command) {
        match command {
            Command::Set { key, value, ttl } => {
                let cmd = pipe.cmd("SET").arg(self.key(key)).arg(value.as_slice());
                if let Some(ttl) = ttl {
                    cmd.arg("PX").arg(millis(*ttl));
                }
            }
            Command::Del { key } => {
                pipe.cmd("DEL").arg(self.key(key));
            }
            Command::Expire { key, ttl } => {
                pipe.cmd("PEXPIRE").arg(self.key(key)).arg(millis(*ttl));
            }
            Command::ZAdd { key, member, score } => {
                pipe.cmd("ZADD").arg(self.key(key)).arg(*score).arg(member);
            }
            Command::ZAddCapped {
                key,
                member,
                score,
                cap,
            } => {
                pipe.cmd("EVAL")
                    .arg(ZADD_CAPPED)
                    .arg(1)
                    .arg(self.key(key))
                    .arg(*cap)
                    .arg(*score)
                    .arg(member);
            }
            Command::ZRem { key, member } => {
                pipe.cmd("ZREM").arg(self.key(key)).arg(member);
            }
            Command::ZRemRangeByScore { key, min, max } => {
                pipe.cmd("ZREMRANGEBYSCORE")
                    .arg(self.key(key))
                    .arg(score_bound(*min))
                    .arg(score_bound(*max));
            }
            Command::ZCard { key } => {
                pipe.cmd("ZCARD").arg(self.key(key));
            }
            Command::ZFirst { key } => {
                pipe.cmd("ZRANGE")
                    .arg(self.key(key))
                    .arg(0)
                    .arg(0)
                    .arg("WITHSCORES");
            }
        }
    }

    fn parse_reply(command: &Command, value: &redis::Value) -> Result<Reply, StoreError> {
        let reply = match command {
            Command::Set { .. } => Reply::Ok,
            Command::Del { .. }
            | Command::Expire { .. }
            | Command::ZAdd { .. }
            | Command::ZAddCapped { .. }
            | Command::ZRem { .. }
            | Command::ZRemRangeByScore { .. }
            | Command::ZCard { .. } => {
                Reply::Int(redis::from_redis_value(value).map_err(store_error)?)
            }
            Command::ZFirst { .. } => {
                let members: Vec<(String, f64)> =
                    redis::from_redis_value(value).map_err(store_error)?;
                Reply::Member(members.into_iter().next())
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn().get(self.key(key)).await.map_err(store_error)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .pset_ex::<_, _, ()>(self.key(key), value, millis(ttl))
                .await
                .map_err(store_error),
            None => conn
                .set::<_, _, ()>(self.key(key), value)
                .await
                .map_err(store_error),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let removed: u64 = self.conn().del(self.key(key)).await.map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.conn().incr(self.key(key), 1).await.map_err(store_error)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let ttl_ms: i64 = millis(ttl).try_into().unwrap_or(i64::MAX);
        self.conn()
            .pexpire(self.key(key), ttl_ms)
            .await
            .map_err(store_error)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.conn()
            .zadd::<_, _, _, ()>(self.key(key), member, score)
            .await
            .map_err(store_error)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: u64 = self
            .conn()
            .zrem(self.key(key), member)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        self.conn()
            .zrembyscore(self.key(key), score_bound(min), score_bound(max))
            .await
            .map_err(store_error)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.conn().zcard(self.key(key)).await.map_err(store_error)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.conn()
            .zrangebyscore_withscores(self.key(key), score_bound(min), score_bound(max))
            .await
            .map_err(store_error)
    }

    async fn atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            self.push_command(&mut pipe, command);
        }

        let values: Vec<redis::Value> = pipe
            .query_async(&mut self.conn())
            .await
            .map_err(store_error)?;

        if values.len() != commands.len() {
            return Err(StoreError::Backend(format!(
                "expected {} replies from transaction, got {}",
                commands.len(),
                values.len()
            )));
        }

        commands
            .iter()
            .zip(values.iter())
            .map(|(command, value)| Self::parse_reply(command, value))
            .collect()
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let absent = if expected.is_none() { "1" } else { "0" };
        let ttl_ms = ttl.map_or(0, millis);
        let swapped: i64 = self
            .cas_script
            .key(self.key(key))
            .arg(absent)
            .arg(expected.unwrap_or_default())
            .arg(new)
            .arg(ttl_ms)
            .invoke_async(&mut self.conn())
            .await
            .map_err(store_error)?;
        Ok(swapped == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
