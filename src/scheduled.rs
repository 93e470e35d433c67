//! The scheduled poller: promotes due entries from the `retry` and
//! `schedule` sorted sets onto their live queues.
//!
//! Each promotion is a single server-side atomic step (remove from the set,
//! push onto the queue named in the envelope), so a crashed promotion leaves
//! the entry in place and competing pollers never double-promote. The tick
//! interval scales with fleet size and carries uniform jitter so a fleet of
//! processes spreads its polling instead of stampeding the datastore.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::Result;
use crate::config::Context;
use crate::datastore::{PROCESSES_SET, RETRY_SET, SCHEDULE_SET};
use crate::job::now_epoch;

const PROMOTION_BATCH: usize = 100;

pub struct Poller {
    ctx: Arc<Context>,
    done: Arc<AtomicBool>,
}

impl Poller {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, done: Arc::new(AtomicBool::new(false)) }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.done.clone()
    }

    /// Spawn the polling task. The first tick is delayed by a random
    /// fraction of the interval so a fleet booting together does not
    /// stampede.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("scheduled poller started");
            let splay = self
                .random_poll_interval()
                .await
                .mul_f64(rand::thread_rng().gen::<f64>());
            tokio::time::sleep(splay).await;

            loop {
                if self.done.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(poll_error) = self.enqueue_due().await {
                    error!(error = %poll_error, "scheduled poll failed");
                }
                tokio::time::sleep(self.random_poll_interval().await).await;
            }
            info!("scheduled poller stopped");
        })
    }

    /// Promote every entry whose fire-at score has passed. Returns the
    /// number of jobs moved onto live queues.
    pub async fn enqueue_due(&self) -> Result<usize> {
        let now = now_epoch();
        let mut promoted = 0;
        for set in [RETRY_SET, SCHEDULE_SET] {
            loop {
                let due = self.ctx.datastore.zrangebyscore(set, now, PROMOTION_BATCH).await?;
                if due.is_empty() {
                    break;
                }
                for payload in &due {
                    if self.ctx.datastore.promote(set, payload).await? {
                        promoted += 1;
                        debug!(set = %set, "promoted scheduled job");
                    }
                }
            }
        }
        Ok(promoted)
    }

    /// `avg / 2 + rand[0, avg)`, where avg is the configured base interval
    /// multiplied by the registered process count. A larger fleet polls less
    /// often per node; the aggregate rate stays roughly constant.
    async fn random_poll_interval(&self) -> Duration {
        let average = self.scaled_poll_interval().await;
        average.mul_f64(0.5) + average.mul_f64(rand::thread_rng().gen::<f64>())
    }

    async fn scaled_poll_interval(&self) -> Duration {
        let base = self.ctx.config.average_scheduled_poll_interval;
        let processes = match self.ctx.datastore.scard(PROCESSES_SET).await {
            Ok(count) => count.max(1),
            // Registry unreachable: fall back to the single-process interval.
            Err(_) => 1,
        };
        base * processes as u32
    }
}
