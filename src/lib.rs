//! Sparkwork is a Redis-backed background job engine: clients push JSON job
//! envelopes onto named queues, and server processes compete to fetch and
//! execute them on a pool of worker tasks, with retry backoff, dead-letter
//! handling, scheduled jobs, and graceful shutdown.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use sparkwork::{Client, Config, Context, Job, JobHandler, Manager, RedisDatastore, Result};
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! struct EmailWorker;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for EmailWorker {
//!     async fn perform(&self, args: Vec<Value>) -> Result<()> {
//!         println!("emailing {:?}", args.first());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::new().with_concurrency(5);
//!     let datastore = Arc::new(RedisDatastore::connect(&config.redis_url, None).await?);
//!
//!     let client = Client::new(datastore.clone());
//!     client.push(Job::new("EmailWorker", vec![json!("user@example.com")])).await?;
//!
//!     let mut context = Context::new(config, datastore);
//!     context.register_handler("EmailWorker", Arc::new(EmailWorker));
//!
//!     let mut manager = Manager::new(Arc::new(context));
//!     manager.start().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     manager.stop().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod datastore;
pub mod error;
pub mod fetch;
pub mod job;
pub mod manager;
pub mod middleware;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod scheduled;

pub use client::Client;
pub use config::{Config, Context, DeathHandler, ErrorHandler, NoopReloader, Reloader};
pub use datastore::{Datastore, MemoryDatastore, RedisDatastore};
pub use error::{Failure, SparkworkError};
pub use fetch::{BasicFetch, Fetcher, WorkUnit};
pub use job::{BacktracePolicy, Job, RetryPolicy, generate_jid};
pub use manager::Manager;
pub use middleware::{Middleware, MiddlewareChain};
pub use processor::{Processor, current_jid};
pub use registry::{HandlerRegistry, JobHandler};
pub use retry::RetryEngine;
pub use scheduled::Poller;

pub type Result<T> = std::result::Result<T, SparkworkError>;
