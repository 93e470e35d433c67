//! In-memory [`Datastore`] with the same command semantics as the Redis
//! implementation. Backs the test suite and local development without a
//! server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

use super::Datastore;

#[derive(Default)]
struct State {
    // Lists are stored head-first: LPUSH prepends, RPOP takes the tail.
    lists: HashMap<String, VecDeque<String>>,
    // Sorted sets kept ordered by (score, member).
    sorted: HashMap<String, Vec<(f64, String)>>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Shared in-process datastore. Cloning yields a handle to the same state.
#[derive(Clone, Default)]
pub struct MemoryDatastore {
    state: Arc<Mutex<State>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("datastore lock poisoned");
        f(&mut state)
    }
}

fn resolve_index(len: usize, index: isize) -> isize {
    if index < 0 { len as isize + index } else { index }
}

fn sort_set(entries: &mut [(f64, String)]) {
    entries.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
}

fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
        None => pattern == key,
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        self.with_state(|s| {
            s.lists.entry(key.to_string()).or_default().push_front(value.to_string());
        });
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        self.with_state(|s| {
            s.lists.entry(key.to_string()).or_default().push_back(value.to_string());
        });
        Ok(())
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        Ok(self.with_state(|s| {
            let value = s.lists.get_mut(source)?.pop_back()?;
            s.lists
                .entry(destination.to_string())
                .or_default()
                .push_front(value.clone());
            Some(value)
        }))
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = self.rpoplpush(source, destination).await? {
                return Ok(Some(value));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<usize> {
        Ok(self.with_state(|s| {
            let Some(list) = s.lists.get_mut(key) else { return 0 };
            let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() };
            let mut removed = 0;
            list.retain(|item| {
                if removed < limit && item == value {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            removed
        }))
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        Ok(self.with_state(|s| {
            let Some(list) = s.lists.get(key) else { return Vec::new() };
            let len = list.len();
            let start = resolve_index(len, start).max(0) as usize;
            let stop = resolve_index(len, stop);
            if stop < 0 {
                return Vec::new();
            }
            list.iter()
                .skip(start)
                .take((stop as usize).saturating_sub(start) + 1)
                .cloned()
                .collect()
        }))
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.with_state(|s| s.lists.get(key).map_or(0, VecDeque::len)))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.with_state(|s| {
            s.lists.remove(key);
            s.sorted.remove(key);
            s.sets.remove(key);
            s.hashes.remove(key);
        });
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.with_state(|s| {
            let entries = s.sorted.entry(key.to_string()).or_default();
            entries.retain(|(_, m)| m != member);
            entries.push((score, member.to_string()));
            sort_set(entries);
        });
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, max_score: f64, limit: usize) -> Result<Vec<String>> {
        Ok(self.with_state(|s| {
            let Some(entries) = s.sorted.get(key) else { return Vec::new() };
            entries
                .iter()
                .filter(|(score, _)| *score <= max_score)
                .take(limit)
                .map(|(_, m)| m.clone())
                .collect()
        }))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self.with_state(|s| {
            s.sorted
                .get(key)?
                .iter()
                .find(|(_, m)| m == member)
                .map(|(score, _)| *score)
        }))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.with_state(|s| {
            let Some(entries) = s.sorted.get_mut(key) else { return false };
            let before = entries.len();
            entries.retain(|(_, m)| m != member);
            entries.len() != before
        }))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self.with_state(|s| s.sorted.get(key).map_or(0, Vec::len)))
    }

    async fn zremrangebyscore(&self, key: &str, max_score: f64) -> Result<usize> {
        Ok(self.with_state(|s| {
            let Some(entries) = s.sorted.get_mut(key) else { return 0 };
            let before = entries.len();
            entries.retain(|(score, _)| *score > max_score);
            before - entries.len()
        }))
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<usize> {
        Ok(self.with_state(|s| {
            let Some(entries) = s.sorted.get_mut(key) else { return 0 };
            let len = entries.len();
            let start = resolve_index(len, start).max(0) as usize;
            let stop = resolve_index(len, stop);
            if stop < 0 || start >= len {
                return 0;
            }
            let stop = (stop as usize).min(len - 1);
            if start > stop {
                return 0;
            }
            entries.drain(start..=stop).count()
        }))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.with_state(|s| {
            s.sets.entry(key.to_string()).or_default().insert(member.to_string());
        });
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.with_state(|s| {
            if let Some(set) = s.sets.get_mut(key) {
                set.remove(member);
            }
        });
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.with_state(|s| {
            s.sets.get(key).map_or_else(Vec::new, |set| set.iter().cloned().collect())
        }))
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        Ok(self.with_state(|s| s.sets.get(key).map_or(0, HashSet::len)))
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.with_state(|s| {
            let hash = s.hashes.entry(key.to_string()).or_default();
            for (field, value) in fields {
                hash.insert((*field).to_string(), value.clone());
            }
        });
        Ok(())
    }

    async fn expire(&self, _key: &str, _seconds: u64) -> Result<()> {
        // Expiry is a liveness concern for real deployments only.
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self.with_state(|s| {
            let mut keys: Vec<String> = s
                .lists
                .keys()
                .chain(s.sorted.keys())
                .chain(s.sets.keys())
                .chain(s.hashes.keys())
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect();
            keys.sort();
            keys.dedup();
            keys
        }))
    }

    async fn promote(&self, set: &str, member: &str) -> Result<bool> {
        let queue = match serde_json::from_str::<serde_json::Value>(member) {
            Ok(value) => match value.get("queue").and_then(|q| q.as_str()) {
                Some(queue) => queue.to_string(),
                None => return Ok(false),
            },
            Err(e) => return Err(e.into()),
        };
        Ok(self.with_state(|s| {
            let Some(entries) = s.sorted.get_mut(set) else { return false };
            let before = entries.len();
            entries.retain(|(_, m)| m != member);
            if entries.len() == before {
                return false;
            }
            s.sets
                .entry(super::QUEUES_SET.to_string())
                .or_default()
                .insert(queue.clone());
            s.lists
                .entry(super::queue_key(&queue))
                .or_default()
                .push_front(member.to_string());
            true
        }))
    }
}
