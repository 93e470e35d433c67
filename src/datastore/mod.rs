//! Datastore abstraction: a thin typed wrapper over the Redis commands the
//! engine consumes.
//!
//! The [`Datastore`] trait is the seam between the engine and the wire: the
//! production implementation talks to a real Redis server, while
//! [`MemoryDatastore`] backs tests and local development with the same
//! semantics in-process.

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

pub mod memory;
pub mod redis;

pub use memory::MemoryDatastore;
pub use redis::RedisDatastore;

/// Set of all queue names ever pushed to.
pub const QUEUES_SET: &str = "queues";
/// Registry of live process identities.
pub const PROCESSES_SET: &str = "processes";
/// Sorted set of failed jobs awaiting their next attempt, scored by fire-at.
pub const RETRY_SET: &str = "retry";
/// Sorted set of client-scheduled jobs, scored by fire-at.
pub const SCHEDULE_SET: &str = "schedule";
/// Capped sorted set of permanently failed jobs, scored by death-time.
pub const DEAD_SET: &str = "dead";

/// Key of the live list for a queue.
pub fn queue_key(name: &str) -> String {
    format!("queue:{}", name)
}

/// Key of the in-flight list for a queue on a given process.
pub fn inflight_key(name: &str, identity: &str) -> String {
    format!("queue:{}:{}", name, identity)
}

/// The Redis command surface the engine is built on.
///
/// Implementations apply any configured namespace internally; callers always
/// pass logical keys.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn lpush(&self, key: &str, value: &str) -> Result<()>;
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;
    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>>;
    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;
    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<usize>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn llen(&self, key: &str) -> Result<usize>;
    async fn del(&self, key: &str) -> Result<()>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    /// Members with score at most `max_score`, lowest first, capped at `limit`.
    async fn zrangebyscore(&self, key: &str, max_score: f64, limit: usize) -> Result<Vec<String>>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zcard(&self, key: &str) -> Result<usize>;
    async fn zremrangebyscore(&self, key: &str, max_score: f64) -> Result<usize>;
    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<usize>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn scard(&self, key: &str) -> Result<usize>;

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<()>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Atomically remove `member` from the sorted set and LPUSH it onto the
    /// live queue named in its envelope. Returns `false` when the member was
    /// already gone (another process won the race).
    async fn promote(&self, set: &str, member: &str) -> Result<bool>;
}
