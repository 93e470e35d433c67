//! Redis-backed [`Datastore`] using a shared connection manager.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::info;

use crate::Result;

use super::Datastore;

const PROMOTE_SCRIPT: &str = r#"
if redis.call('zrem', KEYS[1], ARGV[1]) == 1 then
  local job = cjson.decode(ARGV[1])
  local prefix = ARGV[2]
  redis.call('sadd', prefix .. 'queues', job['queue'])
  redis.call('lpush', prefix .. 'queue:' .. job['queue'], ARGV[1])
  return 1
end
return 0
"#;

/// Production datastore: every call clones the connection manager, which
/// multiplexes over a single reconnecting connection.
pub struct RedisDatastore {
    manager: ConnectionManager,
    namespace: Option<String>,
    promote_script: Script,
}

impl RedisDatastore {
    /// Connect to the given Redis URL, optionally namespacing every key.
    pub async fn connect(url: &str, namespace: Option<String>) -> Result<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!(url = %url, namespace = ?namespace, "connected to redis");
        Ok(Self {
            manager,
            namespace,
            promote_script: Script::new(PROMOTE_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    fn prefix(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:", ns),
            None => String::new(),
        }
    }
}

#[async_trait]
impl Datastore for RedisDatastore {
    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.lpush::<_, _, ()>(self.key(key), value).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.rpush::<_, _, ()>(self.key(key), value).await?;
        Ok(())
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.rpoplpush(self.key(source), self.key(destination)).await?)
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn
            .brpoplpush(self.key(source), self.key(destination), timeout.as_secs_f64())
            .await?)
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        Ok(conn.lrem(self.key(key), count, value).await?)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.lrange(self.key(key), start, stop).await?)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        Ok(conn.llen(self.key(key)).await?)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.zadd::<_, _, _, ()>(self.key(key), member, score).await?;
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, max_score: f64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        Ok(conn
            .zrangebyscore_limit(self.key(key), "-inf", max_score, 0, limit as isize)
            .await?)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.manager.clone();
        Ok(conn.zscore(self.key(key), member).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: usize = conn.zrem(self.key(key), member).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        Ok(conn.zcard(self.key(key)).await?)
    }

    async fn zremrangebyscore(&self, key: &str, max_score: f64) -> Result<usize> {
        let mut conn = self.manager.clone();
        Ok(conn.zrembyscore(self.key(key), "-inf", max_score).await?)
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<usize> {
        let mut conn = self.manager.clone();
        Ok(conn.zremrangebyrank(self.key(key), start, stop).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.sadd::<_, _, ()>(self.key(key), member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.srem::<_, _, ()>(self.key(key), member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.smembers(self.key(key)).await?)
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        Ok(conn.scard(self.key(key)).await?)
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.hset_multiple::<_, _, _, ()>(self.key(key), fields).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.expire::<_, ()>(self.key(key), seconds as i64).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let found: Vec<String> = conn.keys(self.key(pattern)).await?;
        let prefix = self.prefix();
        Ok(found
            .into_iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect())
    }

    async fn promote(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let promoted: i32 = self
            .promote_script
            .key(self.key(set))
            .arg(member)
            .arg(self.prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted == 1)
    }
}
