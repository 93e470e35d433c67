//! The processor: one worker task running the fetch → execute → ack loop.
//!
//! Every loop iteration is its own crash domain. Failures inside the job are
//! absorbed by the retry engine; failures the engine has already recorded
//! surface as sentinels and are simply acked; the shutdown marker leaves the
//! unit in the in-flight list and exits the loop. Only datastore failures on
//! the ack path escape the loop, reported to the manager as a death so the
//! pool can replace the task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::Result;
use crate::config::Context;
use crate::error::SparkworkError;
use crate::fetch::{Fetcher, WorkUnit};
use crate::job::Job;
use crate::registry::JobHandler;
use crate::retry::RetryEngine;

/// Pause after a failed fetch before trying again.
const FETCH_BACKOFF: Duration = Duration::from_secs(1);

tokio::task_local! {
    static CURRENT_JOB: String;
}

/// The jid of the job currently executing on this task, if any.
pub fn current_jid() -> Option<String> {
    CURRENT_JOB.try_with(|jid| jid.clone()).ok()
}

/// Lifecycle notification sent to the manager exactly once per processor.
#[derive(Debug)]
pub enum ProcessorEvent {
    /// Normal exit at a loop boundary.
    Stopped(usize),
    /// Abnormal exit: an error or panic escaped the loop.
    Died(usize, String),
}

/// Handle to a started processor, owned by the manager.
pub struct ProcessorHandle {
    pub id: usize,
    done: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Ask the processor to stop at its next loop boundary.
    pub fn terminate(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    /// Hard-kill the worker task. The in-flight list covers the abandoned
    /// unit.
    pub fn kill(&self) {
        self.terminate();
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

pub struct Processor {
    id: usize,
    ctx: Arc<Context>,
    fetcher: Arc<dyn Fetcher>,
    retry: RetryEngine,
    done: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ProcessorEvent>,
}

impl Processor {
    pub fn new(
        id: usize,
        ctx: Arc<Context>,
        fetcher: Arc<dyn Fetcher>,
        events: mpsc::UnboundedSender<ProcessorEvent>,
    ) -> Self {
        let retry = RetryEngine::new(ctx.clone());
        Self { id, ctx, fetcher, retry, done: Arc::new(AtomicBool::new(false)), events }
    }

    /// Spawn the worker task and hand back its control handle.
    pub fn start(self) -> ProcessorHandle {
        let id = self.id;
        let done = self.done.clone();
        let events = self.events.clone();
        let join = tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(self.run()).catch_unwind().await;
            let event = match outcome {
                Ok(Ok(())) => ProcessorEvent::Stopped(id),
                Ok(Err(error)) => ProcessorEvent::Died(id, error.to_string()),
                Err(_panic) => ProcessorEvent::Died(id, "worker task panicked".to_string()),
            };
            let _ = events.send(event);
        });
        ProcessorHandle { id, done, join }
    }

    async fn run(&self) -> Result<()> {
        debug!(processor = self.id, "processor started");
        loop {
            if self.done.load(Ordering::Relaxed) {
                break;
            }
            let unit = match self.fetcher.fetch().await {
                Ok(Some(unit)) => unit,
                Ok(None) => continue,
                Err(fetch_error) => {
                    error!(processor = self.id, error = %fetch_error, "fetch failed");
                    tokio::time::sleep(FETCH_BACKOFF).await;
                    continue;
                }
            };
            match self.process(unit).await {
                Ok(()) => {}
                Err(SparkworkError::Shutdown) => break,
                Err(fatal) => return Err(fatal),
            }
        }
        info!(processor = self.id, "processor stopped");
        Ok(())
    }

    /// Handle one unit. Only the shutdown marker and ack-path datastore
    /// failures escape.
    pub async fn process(&self, unit: WorkUnit) -> Result<()> {
        let job = match unit.parse() {
            Ok(job) => job,
            Err(parse_error) => {
                self.ctx.report_error(&parse_error, None);
                self.fetcher.ack(&unit).await?;
                return Ok(());
            }
        };

        match self.execute(&job, &unit).await {
            Ok(()) => {
                debug!(jid = %job.jid, class = %job.class, "job done");
                self.fetcher.ack(&unit).await
            }
            Err(SparkworkError::Handled) | Err(SparkworkError::Skip) => {
                // The retry engine already recorded the failure.
                self.fetcher.ack(&unit).await
            }
            Err(SparkworkError::Shutdown) => {
                // No ack: the unit stays in flight for requeue.
                Err(SparkworkError::Shutdown)
            }
            Err(error) => {
                self.ctx.report_error(&error, Some(&job));
                self.fetcher.ack(&unit).await
            }
        }
    }

    async fn execute(&self, job: &Job, unit: &WorkUnit) -> Result<()> {
        let ctx = &self.ctx;
        let retry = &self.retry;
        retry
            .global(&unit.payload, &unit.queue, async {
                let inner: BoxFuture<'_, Result<()>> = Box::pin(async {
                    let handler = ctx.handlers.get(&job.class).ok_or_else(|| {
                        SparkworkError::UnknownHandler { class: job.class.clone() }
                    })?;
                    CURRENT_JOB
                        .scope(job.jid.clone(), async {
                            retry
                                .local(&handler, &unit.payload, &unit.queue, async {
                                    let mut job = job.clone();
                                    let terminal = perform_terminal(handler.clone());
                                    ctx.server_middleware
                                        .invoke(
                                            Some(handler.as_ref()),
                                            &mut job,
                                            &unit.queue,
                                            &terminal,
                                        )
                                        .await
                                })
                                .await
                        })
                        .await
                });
                ctx.reloader.around(inner).await
            })
            .await
    }
}

/// The terminal action at the bottom of the middleware chain: run the
/// handler with the (possibly middleware-rewritten) arguments.
fn perform_terminal(
    handler: Arc<dyn JobHandler>,
) -> impl Fn(&mut Job) -> BoxFuture<'static, Result<()>> + Send + Sync {
    move |job: &mut Job| {
        let handler = handler.clone();
        let args = job.args.clone();
        Box::pin(async move { handler.perform(args).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datastore::{Datastore, MemoryDatastore, RETRY_SET};
    use crate::error::Failure;
    use crate::fetch::BasicFetch;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct CountingWorker {
        calls: Arc<AtomicUsize>,
        seen_args: Arc<Mutex<Vec<Vec<Value>>>>,
        fail_first: bool,
    }

    #[async_trait]
    impl JobHandler for CountingWorker {
        async fn perform(&self, args: Vec<Value>) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_args.lock().unwrap().push(args);
            if self.fail_first && call == 0 {
                return Err(SparkworkError::Job(Failure::new("RuntimeError", "boom")));
            }
            Ok(())
        }
    }

    struct Fixture {
        ds: MemoryDatastore,
        ctx: Arc<Context>,
        fetcher: Arc<BasicFetch>,
        calls: Arc<AtomicUsize>,
        seen_args: Arc<Mutex<Vec<Vec<Value>>>>,
    }

    fn fixture(fail_first: bool) -> Fixture {
        let ds = MemoryDatastore::new();
        let config = Config::default().with_fetch_timeout(Duration::from_millis(50));
        let mut ctx = Context::new(config, Arc::new(ds.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen_args = Arc::new(Mutex::new(Vec::new()));
        ctx.register_handler(
            "CountingWorker",
            Arc::new(CountingWorker {
                calls: calls.clone(),
                seen_args: seen_args.clone(),
                fail_first,
            }),
        );
        let fetcher = Arc::new(BasicFetch::new(
            ctx.datastore.clone(),
            ctx.config.queues.clone(),
            ctx.config.strict,
            ctx.identity.clone(),
            ctx.config.fetch_timeout,
        ));
        Fixture { ds, ctx: Arc::new(ctx), fetcher, calls, seen_args }
    }

    fn processor(fixture: &Fixture) -> (Processor, mpsc::UnboundedReceiver<ProcessorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Processor::new(0, fixture.ctx.clone(), fixture.fetcher.clone(), tx), rx)
    }

    async fn push(ds: &MemoryDatastore, job: &Job) {
        ds.lpush("queue:default", &job.to_json().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_job_is_acked_and_leaves_no_state() {
        let fixture = fixture(false);
        push(&fixture.ds, &Job::new("CountingWorker", vec![json!(1)])).await;

        let (processor, _rx) = processor(&fixture);
        let unit = fixture.fetcher.fetch().await.unwrap().unwrap();
        processor.process(unit).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.seen_args.lock().unwrap()[0], vec![json!(1)]);
        assert_eq!(fixture.ds.llen("queue:default").await.unwrap(), 0);
        assert_eq!(fixture.ds.zcard(RETRY_SET).await.unwrap(), 0);
        let inflight = fixture.ds.keys("queue:default:*").await.unwrap();
        for key in inflight {
            assert_eq!(fixture.ds.llen(&key).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_failing_job_is_acked_and_recorded_for_retry() {
        let fixture = fixture(true);
        push(&fixture.ds, &Job::new("CountingWorker", vec![])).await;

        let (processor, _rx) = processor(&fixture);
        let unit = fixture.fetcher.fetch().await.unwrap().unwrap();
        processor.process(unit).await.unwrap();

        assert_eq!(fixture.ds.zcard(RETRY_SET).await.unwrap(), 1);
        // Acked despite the failure: the retry set now owns the job.
        let inflight = fixture.ds.keys("queue:default:*").await.unwrap();
        for key in inflight {
            assert_eq!(fixture.ds.llen(&key).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_unknown_class_flows_through_retry_engine() {
        let fixture = fixture(false);
        push(&fixture.ds, &Job::new("NoSuchWorker", vec![])).await;

        let (processor, _rx) = processor(&fixture);
        let unit = fixture.fetcher.fetch().await.unwrap().unwrap();
        processor.process(unit).await.unwrap();

        let members = fixture.ds.zrangebyscore(RETRY_SET, f64::MAX, 10).await.unwrap();
        assert_eq!(members.len(), 1);
        let entry = Job::from_json(&members[0]).unwrap();
        assert_eq!(entry.error_class.as_deref(), Some("UnknownHandler"));
    }

    #[tokio::test]
    async fn test_unparseable_payload_is_reported_and_dropped() {
        let fixture = fixture(false);
        fixture.ds.lpush("queue:default", "not json").await.unwrap();

        let (processor, _rx) = processor(&fixture);
        let unit = fixture.fetcher.fetch().await.unwrap().unwrap();
        processor.process(unit).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.ds.zcard(RETRY_SET).await.unwrap(), 0);
        let inflight = fixture.ds.keys("queue:default:*").await.unwrap();
        for key in inflight {
            assert_eq!(fixture.ds.llen(&key).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_processor_stops_at_loop_boundary_and_reports_once() {
        let fixture = fixture(false);
        let (processor, mut rx) = processor(&fixture);
        let handle = processor.start();

        handle.terminate();
        handle.join().await;

        match rx.recv().await.unwrap() {
            ProcessorEvent::Stopped(id) => assert_eq!(id, 0),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_middleware_runs_around_perform() {
        let fixture = fixture(false);
        // Rewrites args before the terminal sees them.
        struct Doubling;
        #[async_trait]
        impl crate::middleware::Middleware for Doubling {
            async fn call(
                &self,
                worker: Option<&dyn JobHandler>,
                job: &mut Job,
                queue: &str,
                next: crate::middleware::Next<'_>,
            ) -> Result<()> {
                job.args = vec![json!(42)];
                next.run(worker, job, queue).await
            }
        }

        let mut ctx = Context::new(
            Config::default().with_fetch_timeout(Duration::from_millis(50)),
            Arc::new(fixture.ds.clone()),
        );
        ctx.register_handler(
            "CountingWorker",
            Arc::new(CountingWorker {
                calls: fixture.calls.clone(),
                seen_args: fixture.seen_args.clone(),
                fail_first: false,
            }),
        );
        ctx.server_middleware.add("doubling", || Box::new(Doubling));
        let ctx = Arc::new(ctx);
        let fetcher = Arc::new(BasicFetch::new(
            ctx.datastore.clone(),
            ctx.config.queues.clone(),
            false,
            ctx.identity.clone(),
            ctx.config.fetch_timeout,
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let processor = Processor::new(0, ctx, fetcher.clone(), tx);

        push(&fixture.ds, &Job::new("CountingWorker", vec![json!(1)])).await;
        let unit = fetcher.fetch().await.unwrap().unwrap();
        processor.process(unit).await.unwrap();

        assert_eq!(fixture.seen_args.lock().unwrap()[0], vec![json!(42)]);
    }
}
