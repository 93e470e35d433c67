//! The manager: owns the processor pool and runs the coordinated shutdown
//! protocol.
//!
//! Startup registers this process in the datastore registry, recovers
//! in-flight lists abandoned by dead processes, and spawns the configured
//! number of processors plus the scheduled poller and a heartbeat task. A
//! supervisor task consumes processor lifecycle events, replacing any
//! processor that stops or dies while the pool is meant to be running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::Result;
use crate::config::Context;
use crate::datastore::PROCESSES_SET;
use crate::error::SparkworkError;
use crate::fetch::{BasicFetch, Fetcher};
use crate::processor::{Processor, ProcessorEvent, ProcessorHandle};
use crate::scheduled::Poller;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_TTL_SECONDS: u64 = 60;

type Pool = Arc<Mutex<HashMap<usize, ProcessorHandle>>>;

pub struct Manager {
    ctx: Arc<Context>,
    fetcher: Arc<dyn Fetcher>,
    pool: Pool,
    quiet: Arc<AtomicBool>,
    next_id: Arc<AtomicUsize>,
    events_tx: mpsc::UnboundedSender<ProcessorEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ProcessorEvent>>,
    supervisor: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    poller_done: Option<Arc<AtomicBool>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Manager {
    /// Build a manager. The context's injected fetcher is used when present;
    /// otherwise a [`BasicFetch`] is derived from the configuration.
    pub fn new(ctx: Arc<Context>) -> Self {
        let fetcher: Arc<dyn Fetcher> = match &ctx.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(BasicFetch::new(
                ctx.datastore.clone(),
                ctx.config.queues.clone(),
                ctx.config.strict,
                ctx.identity.clone(),
                ctx.config.fetch_timeout,
            )),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            fetcher,
            pool: Arc::new(Mutex::new(HashMap::new())),
            quiet: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicUsize::new(0)),
            events_tx,
            events_rx: Some(events_rx),
            supervisor: None,
            poller: None,
            poller_done: None,
            heartbeat: None,
        }
    }

    /// Register this process, recover orphaned in-flight work, and start the
    /// pool, poller, heartbeat, and supervisor.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            identity = %self.ctx.identity,
            concurrency = self.ctx.config.concurrency,
            queues = ?self.ctx.config.queues,
            "starting"
        );

        Self::register_process(&self.ctx).await?;
        if let Err(recover_error) = self.fetcher.bulk_requeue().await {
            warn!(error = %recover_error, "crash recovery sweep failed");
        }

        for _ in 0..self.ctx.config.concurrency {
            Self::spawn_processor(
                &self.ctx,
                &self.fetcher,
                &self.pool,
                &self.next_id,
                &self.events_tx,
            );
        }

        let poller = Poller::new(self.ctx.clone());
        self.poller_done = Some(poller.stop_flag());
        self.poller = Some(poller.start());

        self.heartbeat = Some(Self::start_heartbeat(self.ctx.clone()));
        self.supervisor = Some(self.start_supervisor());
        Ok(())
    }

    /// Stop issuing new work without shutting down: quiesce the fetcher and
    /// ask every processor to stop at its loop boundary.
    pub fn quiet(&self) {
        if self.quiet.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("quieting: no longer fetching new work");
        self.fetcher.terminate();
        let pool = self.pool.lock().expect("pool lock poisoned");
        for handle in pool.values() {
            handle.terminate();
        }
    }

    /// Graceful shutdown: quiesce, wait up to the configured hard timeout
    /// for processors to finish, hard-kill stragglers, drain in-flight
    /// lists, and deregister this process.
    pub async fn stop(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_timeout;
        self.quiet();

        if let Some(done) = self.poller_done.take() {
            done.store(true, Ordering::Relaxed);
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }

        // Wait for processors to reach their loop boundaries.
        loop {
            if self.pool.lock().expect("pool lock poisoned").is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Hard kill whatever is still running, then join everything.
        let stragglers: Vec<ProcessorHandle> = {
            let mut pool = self.pool.lock().expect("pool lock poisoned");
            pool.drain().map(|(_, handle)| handle).collect()
        };
        if !stragglers.is_empty() {
            warn!(count = stragglers.len(), "hard-killing workers still busy at deadline");
        }
        for handle in stragglers {
            handle.kill();
            handle.join().await;
        }

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }

        self.fetcher.requeue().await?;

        let datastore = &self.ctx.datastore;
        datastore.srem(PROCESSES_SET, &self.ctx.identity).await?;
        datastore.del(&self.ctx.identity).await?;
        info!(identity = %self.ctx.identity, "shutdown complete");
        Ok(())
    }

    /// Number of processors currently in the pool.
    pub fn processor_count(&self) -> usize {
        self.pool.lock().expect("pool lock poisoned").len()
    }

    fn spawn_processor(
        ctx: &Arc<Context>,
        fetcher: &Arc<dyn Fetcher>,
        pool: &Pool,
        next_id: &Arc<AtomicUsize>,
        events_tx: &mpsc::UnboundedSender<ProcessorEvent>,
    ) {
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let processor = Processor::new(id, ctx.clone(), fetcher.clone(), events_tx.clone());
        let handle = processor.start();
        pool.lock().expect("pool lock poisoned").insert(id, handle);
    }

    fn start_supervisor(&mut self) -> JoinHandle<()> {
        let mut events_rx = self.events_rx.take().expect("supervisor already started");
        let ctx = self.ctx.clone();
        let fetcher = self.fetcher.clone();
        let pool = self.pool.clone();
        let quiet = self.quiet.clone();
        let next_id = self.next_id.clone();
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ProcessorEvent::Stopped(id) => {
                        pool.lock().expect("pool lock poisoned").remove(&id);
                        if !quiet.load(Ordering::Relaxed) {
                            info!(processor = id, "processor stopped, spawning replacement");
                            Self::spawn_processor(&ctx, &fetcher, &pool, &next_id, &events_tx);
                        }
                    }
                    ProcessorEvent::Died(id, message) => {
                        pool.lock().expect("pool lock poisoned").remove(&id);
                        error!(processor = id, error = %message, "processor died");
                        ctx.report_error(&SparkworkError::Worker { message }, None);
                        if !quiet.load(Ordering::Relaxed) {
                            Self::spawn_processor(&ctx, &fetcher, &pool, &next_id, &events_tx);
                        }
                    }
                }
            }
        })
    }

    async fn register_process(ctx: &Arc<Context>) -> Result<()> {
        Self::beat(ctx).await
    }

    fn start_heartbeat(ctx: Arc<Context>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if let Err(beat_error) = Self::beat(&ctx).await {
                    warn!(error = %beat_error, "heartbeat failed");
                }
            }
        })
    }

    async fn beat(ctx: &Arc<Context>) -> Result<()> {
        let datastore = &ctx.datastore;
        datastore.sadd(PROCESSES_SET, &ctx.identity).await?;
        let info = serde_json::json!({
            "identity": ctx.identity,
            "queues": ctx.config.queues,
            "concurrency": ctx.config.concurrency,
        });
        datastore
            .hset(
                &ctx.identity,
                &[
                    ("info", info.to_string()),
                    ("beat", format!("{}", crate::job::now_epoch())),
                ],
            )
            .await?;
        datastore.expire(&ctx.identity, HEARTBEAT_TTL_SECONDS).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datastore::{Datastore, MemoryDatastore};
    use crate::job::Job;
    use crate::registry::JobHandler;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    struct Immediate;

    #[async_trait]
    impl JobHandler for Immediate {
        async fn perform(&self, _args: Vec<Value>) -> Result<()> {
            Ok(())
        }
    }

    fn context(ds: &MemoryDatastore, concurrency: usize) -> Arc<Context> {
        let config = Config::default()
            .with_concurrency(concurrency)
            .with_fetch_timeout(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_millis(500));
        let mut ctx = Context::new(config, Arc::new(ds.clone()));
        ctx.register_handler("Immediate", Arc::new(Immediate));
        Arc::new(ctx)
    }

    #[tokio::test]
    async fn test_start_registers_process_and_fills_pool() {
        let ds = MemoryDatastore::new();
        let ctx = context(&ds, 3);
        let mut manager = Manager::new(ctx.clone());
        manager.start().await.unwrap();

        assert_eq!(manager.processor_count(), 3);
        let processes = ds.smembers(PROCESSES_SET).await.unwrap();
        assert!(processes.contains(&ctx.identity));

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_deregisters_process() {
        let ds = MemoryDatastore::new();
        let ctx = context(&ds, 1);
        let mut manager = Manager::new(ctx.clone());
        manager.start().await.unwrap();
        manager.stop().await.unwrap();

        let processes = ds.smembers(PROCESSES_SET).await.unwrap();
        assert!(!processes.contains(&ctx.identity));
        assert_eq!(manager.processor_count(), 0);
    }

    #[tokio::test]
    async fn test_stopped_processor_is_replaced_while_running() {
        let ds = MemoryDatastore::new();
        let ctx = context(&ds, 2);
        let mut manager = Manager::new(ctx);
        manager.start().await.unwrap();

        // Stop one processor directly; the supervisor should backfill it.
        {
            let pool = manager.pool.lock().unwrap();
            pool.values().next().unwrap().terminate();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.processor_count(), 2);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_processes_pushed_jobs() {
        let ds = MemoryDatastore::new();
        let ctx = context(&ds, 2);
        let mut manager = Manager::new(ctx);

        let job = Job::new("Immediate", vec![]);
        ds.lpush("queue:default", &job.to_json().unwrap()).await.unwrap();
        manager.start().await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if ds.llen("queue:default").await.unwrap() == 0 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "queue never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.stop().await.unwrap();
        assert_eq!(ds.llen("queue:default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_startup_recovers_orphaned_inflight_lists() {
        let ds = MemoryDatastore::new();
        let job = Job::new("Immediate", vec![]);
        ds.lpush("queue:default:ghost:9:dead", &job.to_json().unwrap()).await.unwrap();

        let ctx = context(&ds, 1);
        let mut manager = Manager::new(ctx);
        manager.start().await.unwrap();

        // The orphan was moved back onto the live queue and then drained by
        // the pool.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let recovered = ds.llen("queue:default:ghost:9:dead").await.unwrap() == 0;
            if recovered && ds.llen("queue:default").await.unwrap() == 0 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "orphan never recovered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.stop().await.unwrap();
    }

    struct CountingFetch {
        inner: BasicFetch,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Fetcher for CountingFetch {
        async fn fetch(&self) -> Result<Option<crate::fetch::WorkUnit>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch().await
        }

        async fn ack(&self, unit: &crate::fetch::WorkUnit) -> Result<()> {
            self.inner.ack(unit).await
        }

        async fn requeue(&self) -> Result<usize> {
            self.inner.requeue().await
        }

        async fn bulk_requeue(&self) -> Result<usize> {
            self.inner.bulk_requeue().await
        }

        fn terminate(&self) {
            self.inner.terminate()
        }
    }

    #[tokio::test]
    async fn test_injected_fetcher_feeds_the_pool() {
        let ds = MemoryDatastore::new();
        let config = Config::default()
            .with_concurrency(1)
            .with_fetch_timeout(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_millis(500));
        let mut ctx = Context::new(config, Arc::new(ds.clone()));
        ctx.register_handler("Immediate", Arc::new(Immediate));

        let fetches = Arc::new(AtomicUsize::new(0));
        let inner = BasicFetch::new(
            ctx.datastore.clone(),
            ctx.config.queues.clone(),
            ctx.config.strict,
            ctx.identity.clone(),
            ctx.config.fetch_timeout,
        );
        let ctx = ctx.with_fetcher(Arc::new(CountingFetch { inner, fetches: fetches.clone() }));
        let mut manager = Manager::new(Arc::new(ctx));

        let job = Job::new("Immediate", vec![]);
        ds.lpush("queue:default", &job.to_json().unwrap()).await.unwrap();
        manager.start().await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if ds.llen("queue:default").await.unwrap() == 0 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "queue never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.stop().await.unwrap();
        assert!(fetches.load(Ordering::SeqCst) > 0, "injected fetcher was never used");
    }

    struct Slow {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for Slow {
        async fn perform(&self, _args: Vec<Value>) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hard_timeout_kills_busy_worker_and_requeues_its_job() {
        let ds = MemoryDatastore::new();
        let config = Config::default()
            .with_concurrency(1)
            .with_fetch_timeout(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_millis(200));
        let mut ctx = Context::new(config, Arc::new(ds.clone()));
        let started = Arc::new(AtomicUsize::new(0));
        ctx.register_handler("Slow", Arc::new(Slow { started: started.clone() }));
        let mut manager = Manager::new(Arc::new(ctx));

        let job = Job::new("Slow", vec![]);
        ds.lpush("queue:default", &job.to_json().unwrap()).await.unwrap();
        manager.start().await.unwrap();

        // Let the worker pick the job up, then shut down mid-execution.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while started.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "job never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let shutdown_started = std::time::Instant::now();
        manager.stop().await.unwrap();
        let elapsed = shutdown_started.elapsed();

        // The grace period expired and the worker was killed, well before
        // the 1s handler would have finished.
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(900));

        // The interrupted job went back to its source queue.
        assert_eq!(ds.llen("queue:default").await.unwrap(), 1);
    }
}
