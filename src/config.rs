//! Configuration and the shared execution context.
//!
//! [`Config`] is plain data with builder-style setters. [`Context`] wires a
//! config together with the datastore, handler registry, middleware chain,
//! and the error/death handler lists; every component receives it by `Arc`
//! at construction. There is no process-wide registry.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tracing::error;

use crate::Result;
use crate::datastore::Datastore;
use crate::error::SparkworkError;
use crate::fetch::Fetcher;
use crate::job::Job;
use crate::middleware::MiddlewareChain;
use crate::registry::{HandlerRegistry, JobHandler};

/// Callable invoked for every error reported outside the retry engine.
/// Failures inside a handler are caught and logged; they never propagate.
pub type ErrorHandler = Arc<dyn Fn(&SparkworkError, Option<&Job>) + Send + Sync>;

/// Callable invoked after a job is moved to the dead set.
pub type DeathHandler = Arc<dyn Fn(&Job, &SparkworkError) + Send + Sync>;

/// Application-provided scope wrapping each job execution, for frameworks
/// that need to refresh state around units of work.
pub trait Reloader: Send + Sync {
    fn around<'a>(&'a self, f: BoxFuture<'a, Result<()>>) -> BoxFuture<'a, Result<()>>;
}

/// The default reloader: runs the execution unchanged.
#[derive(Default)]
pub struct NoopReloader;

impl Reloader for NoopReloader {
    fn around<'a>(&'a self, f: BoxFuture<'a, Result<()>>) -> BoxFuture<'a, Result<()>> {
        f
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of processors per server instance.
    pub concurrency: usize,
    /// Ordered queue list. Duplicate names weight a queue more heavily under
    /// weighted-random fetch.
    pub queues: Vec<String>,
    /// Strict-order fetch instead of weighted-random.
    pub strict: bool,
    /// Default attempt cap when neither envelope nor handler declares one.
    pub max_retries: u32,
    /// Grace period before shutdown hard-kills outstanding workers.
    pub shutdown_timeout: Duration,
    /// How long a fetch blocks waiting for work.
    pub fetch_timeout: Duration,
    /// Base scheduled-set poll interval, scaled by fleet size.
    pub average_scheduled_poll_interval: Duration,
    /// Dead set count cap.
    pub dead_max_jobs: usize,
    /// Dead set age cap.
    pub dead_timeout: Duration,
    /// Optional key namespace shared by all datastore operations.
    pub namespace: Option<String>,
    pub redis_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec!["default".to_string()],
            strict: false,
            max_retries: 25,
            shutdown_timeout: Duration::from_secs(25),
            fetch_timeout: Duration::from_secs(2),
            average_scheduled_poll_interval: Duration::from_secs(15),
            dead_max_jobs: 10_000,
            dead_timeout: Duration::from_secs(180 * 24 * 60 * 60),
            namespace: None,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_scheduled_poll_interval(mut self, interval: Duration) -> Self {
        self.average_scheduled_poll_interval = interval;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }
}

/// Everything a running component needs, passed by reference at
/// construction.
pub struct Context {
    pub config: Config,
    pub datastore: Arc<dyn Datastore>,
    pub handlers: HandlerRegistry,
    pub server_middleware: MiddlewareChain,
    pub error_handlers: Vec<ErrorHandler>,
    pub death_handlers: Vec<DeathHandler>,
    pub reloader: Arc<dyn Reloader>,
    /// Injected fetcher implementation. When unset, the manager builds a
    /// [`BasicFetch`](crate::fetch::BasicFetch) from the configuration.
    pub fetcher: Option<Arc<dyn Fetcher>>,
    /// This process's identity in the registry: `host:pid:nonce`.
    pub identity: String,
}

impl Context {
    pub fn new(config: Config, datastore: Arc<dyn Datastore>) -> Self {
        Self {
            config,
            datastore,
            handlers: HandlerRegistry::new(),
            server_middleware: MiddlewareChain::new(),
            error_handlers: Vec::new(),
            death_handlers: Vec::new(),
            reloader: Arc::new(NoopReloader),
            fetcher: None,
            identity: generate_identity(),
        }
    }

    /// Register a handler under its envelope class name.
    pub fn register_handler(&mut self, class: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.register(class, handler);
    }

    /// Append an error handler. The list is read-only once workers start.
    pub fn on_error(&mut self, handler: impl Fn(&SparkworkError, Option<&Job>) + Send + Sync + 'static) {
        self.error_handlers.push(Arc::new(handler));
    }

    /// Append a death handler. The list is read-only once workers start.
    pub fn on_death(&mut self, handler: impl Fn(&Job, &SparkworkError) + Send + Sync + 'static) {
        self.death_handlers.push(Arc::new(handler));
    }

    pub fn with_reloader(mut self, reloader: Arc<dyn Reloader>) -> Self {
        self.reloader = reloader;
        self
    }

    /// Inject a fetcher implementation in place of the default
    /// [`BasicFetch`](crate::fetch::BasicFetch).
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Report an error through the registered error handlers. A panicking
    /// handler is logged and cannot suppress the remaining handlers.
    pub fn report_error(&self, error: &SparkworkError, job: Option<&Job>) {
        match job {
            Some(job) => error!(jid = %job.jid, class = %job.class, error = %error, "job error"),
            None => error!(error = %error, "error"),
        }
        for handler in &self.error_handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(error, job))).is_err() {
                error!("error handler panicked");
            }
        }
    }
}

fn generate_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let nonce: u32 = rand::thread_rng().gen();
    format!("{}:{}:{:08x}", host, std::process::id(), nonce)
}
