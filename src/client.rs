//! The enqueue-side client: pushes envelopes onto live queues or the
//! schedule set, running them through an independent client middleware
//! chain first.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use crate::Result;
use crate::datastore::{Datastore, QUEUES_SET, SCHEDULE_SET, queue_key};
use crate::job::{Job, now_epoch};
use crate::middleware::MiddlewareChain;

/// Enqueue-side API. Cheap to clone; clones share the datastore but carry
/// independent middleware chains.
///
/// # Examples
///
/// ```rust,no_run
/// use sparkwork::{Client, Job, RedisDatastore};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> sparkwork::Result<()> {
/// let datastore = Arc::new(RedisDatastore::connect("redis://127.0.0.1:6379", None).await?);
/// let client = Client::new(datastore);
///
/// let jid = client
///     .push(Job::new("EmailWorker", vec![json!("user@example.com")]))
///     .await?;
/// println!("enqueued {}", jid);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    datastore: Arc<dyn Datastore>,
    middleware: MiddlewareChain,
}

impl Client {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore, middleware: MiddlewareChain::new() }
    }

    /// The client middleware chain, independent of any server chain.
    pub fn middleware(&mut self) -> &mut MiddlewareChain {
        &mut self.middleware
    }

    /// Push a job onto its queue. Returns the jid. Duplicate jids are the
    /// caller's concern; the server does not deduplicate.
    pub async fn push(&self, mut job: Job) -> Result<String> {
        let queue = job.queue.clone();
        let datastore = self.datastore.clone();
        let terminal = move |job: &mut Job| -> BoxFuture<'static, Result<()>> {
            job.enqueued_at = Some(now_epoch());
            let queue = job.queue.clone();
            let payload = match job.to_json() {
                Ok(payload) => payload,
                Err(error) => return Box::pin(async move { Err(error) }),
            };
            let datastore = datastore.clone();
            Box::pin(async move {
                datastore.sadd(QUEUES_SET, &queue).await?;
                datastore.lpush(&queue_key(&queue), &payload).await?;
                Ok(())
            })
        };
        self.middleware.invoke(None, &mut job, &queue, &terminal).await?;
        debug!(jid = %job.jid, class = %job.class, queue = %job.queue, "pushed job");
        Ok(job.jid)
    }

    /// Push a batch of jobs, returning their jids in order.
    pub async fn push_bulk(&self, jobs: Vec<Job>) -> Result<Vec<String>> {
        let mut jids = Vec::with_capacity(jobs.len());
        for job in jobs {
            jids.push(self.push(job).await?);
        }
        Ok(jids)
    }

    /// Schedule a job to run at the given epoch-seconds time. Times in the
    /// past degrade to an immediate push.
    pub async fn push_at(&self, mut job: Job, at: f64) -> Result<String> {
        if at <= now_epoch() {
            return self.push(job).await;
        }
        let queue = job.queue.clone();
        let datastore = self.datastore.clone();
        let terminal = move |job: &mut Job| -> BoxFuture<'static, Result<()>> {
            job.enqueued_at = Some(now_epoch());
            let payload = match job.to_json() {
                Ok(payload) => payload,
                Err(error) => return Box::pin(async move { Err(error) }),
            };
            let datastore = datastore.clone();
            Box::pin(async move {
                datastore.zadd(SCHEDULE_SET, at, &payload).await?;
                Ok(())
            })
        };
        self.middleware.invoke(None, &mut job, &queue, &terminal).await?;
        debug!(jid = %job.jid, class = %job.class, at, "scheduled job");
        Ok(job.jid)
    }

    /// Schedule a job to run after a delay.
    pub async fn push_in(&self, job: Job, delay: Duration) -> Result<String> {
        self.push_at(job, now_epoch() + delay.as_secs_f64()).await
    }
}
