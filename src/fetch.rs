//! Fetching work: blocking pull from the configured queues onto a
//! per-process in-flight list, plus the requeue paths that make crash
//! recovery possible.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::Result;
use crate::datastore::{Datastore, PROCESSES_SET, inflight_key, queue_key};
use crate::job::Job;

/// A fetched unit of work: the raw payload plus the live queue it came from.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub payload: String,
    pub queue: String,
}

impl WorkUnit {
    /// Parse the payload into a job envelope.
    pub fn parse(&self) -> Result<Job> {
        Job::from_json(&self.payload)
    }
}

/// The fetch seam, so a custom fetcher can be injected in place of
/// [`BasicFetch`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Block up to the fetch timeout waiting for a unit of work. Returns
    /// `None` on timeout or after shutdown has been signaled.
    async fn fetch(&self) -> Result<Option<WorkUnit>>;

    /// Remove exactly one matching payload from the in-flight list.
    async fn ack(&self, unit: &WorkUnit) -> Result<()>;

    /// Drain this process's in-flight lists back to their source queues.
    /// Called during shutdown, after all processors have stopped.
    async fn requeue(&self) -> Result<usize>;

    /// Re-enqueue in-flight lists owned by process identities no longer in
    /// the registry (crash recovery for other processes).
    async fn bulk_requeue(&self) -> Result<usize>;

    /// Signal shutdown: all subsequent fetches return no work immediately.
    fn terminate(&self);
}

/// Default fetcher over a configured queue list.
///
/// Under strict ordering, queues are probed in declared order every fetch so
/// earlier queues drain entirely before later ones are considered. Otherwise
/// the list is shuffled per fetch, with duplicates acting as weights.
pub struct BasicFetch {
    datastore: Arc<dyn Datastore>,
    queues: Vec<String>,
    strict: bool,
    identity: String,
    timeout: Duration,
    done: AtomicBool,
}

impl BasicFetch {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        queues: Vec<String>,
        strict: bool,
        identity: String,
        timeout: Duration,
    ) -> Self {
        let queues = if strict { unique(&queues) } else { queues };
        Self { datastore, queues, strict, identity, timeout, done: AtomicBool::new(false) }
    }

    fn queues_for_fetch(&self) -> Vec<String> {
        if self.strict {
            return self.queues.clone();
        }
        let mut queues = self.queues.clone();
        queues.shuffle(&mut rand::thread_rng());
        unique(&queues)
    }
}

fn unique(queues: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    queues.iter().filter(|q| seen.insert(q.as_str())).cloned().collect()
}

#[async_trait]
impl Fetcher for BasicFetch {
    async fn fetch(&self) -> Result<Option<WorkUnit>> {
        if self.done.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let queues = self.queues_for_fetch();
        if queues.is_empty() {
            tokio::time::sleep(self.timeout).await;
            return Ok(None);
        }

        // Non-blocking pass over every queue first, so a busy later queue is
        // not starved by an empty earlier one.
        for name in &queues {
            let payload = self
                .datastore
                .rpoplpush(&queue_key(name), &inflight_key(name, &self.identity))
                .await?;
            if let Some(payload) = payload {
                debug!(queue = %name, "fetched job");
                return Ok(Some(WorkUnit { payload, queue: name.clone() }));
            }
        }

        // Everything idle: block on the front queue for the remainder.
        let name = &queues[0];
        let payload = self
            .datastore
            .brpoplpush(&queue_key(name), &inflight_key(name, &self.identity), self.timeout)
            .await?;
        Ok(payload.map(|payload| {
            debug!(queue = %name, "fetched job");
            WorkUnit { payload, queue: name.clone() }
        }))
    }

    async fn ack(&self, unit: &WorkUnit) -> Result<()> {
        self.datastore
            .lrem(&inflight_key(&unit.queue, &self.identity), 1, &unit.payload)
            .await?;
        Ok(())
    }

    async fn requeue(&self) -> Result<usize> {
        let mut moved = 0;
        for name in unique(&self.queues) {
            let key = inflight_key(&name, &self.identity);
            let items = self.datastore.lrange(&key, 0, -1).await?;
            if items.is_empty() {
                continue;
            }
            for item in &items {
                self.datastore.rpush(&queue_key(&name), item).await?;
            }
            self.datastore.del(&key).await?;
            moved += items.len();
        }
        if moved > 0 {
            info!(count = moved, "requeued in-flight jobs");
        }
        Ok(moved)
    }

    async fn bulk_requeue(&self) -> Result<usize> {
        let active: HashSet<String> =
            self.datastore.smembers(PROCESSES_SET).await?.into_iter().collect();
        let mut moved = 0;
        for key in self.datastore.keys("queue:*").await? {
            let parts: Vec<&str> = key.split(':').collect();
            // In-flight lists are queue:<name>:<host>:<pid>:<nonce>; plain
            // queue:<name> keys are the live queues themselves.
            if parts.len() < 3 || parts[0] != "queue" {
                continue;
            }
            let name = parts[1];
            let identity = parts[2..].join(":");
            if active.contains(&identity) {
                continue;
            }
            let items = self.datastore.lrange(&key, 0, -1).await?;
            for item in &items {
                self.datastore.rpush(&queue_key(name), item).await?;
            }
            self.datastore.del(&key).await?;
            moved += items.len();
        }
        if moved > 0 {
            info!(count = moved, "recovered in-flight jobs from dead processes");
        }
        Ok(moved)
    }

    fn terminate(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}
