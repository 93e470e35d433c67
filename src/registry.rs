//! Handler registration: mapping the envelope's `class` name to the code
//! that performs the work.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;
use crate::error::SparkworkError;
use crate::job::{Job, RetryPolicy};

/// A job handler: the unit of user code executed for a given `class`.
///
/// Handlers are registered once at startup and shared across processors;
/// per-job state belongs in `perform` locals, not handler fields.
///
/// # Examples
///
/// ```rust
/// use sparkwork::{JobHandler, Result};
/// use serde_json::Value;
///
/// struct EmailWorker;
///
/// #[async_trait::async_trait]
/// impl JobHandler for EmailWorker {
///     async fn perform(&self, args: Vec<Value>) -> Result<()> {
///         println!("sending email to {:?}", args.first());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job. Returning an error routes the envelope through the
    /// retry engine.
    async fn perform(&self, args: Vec<Value>) -> Result<()>;

    /// Declared retry policy, used when the envelope carries no `retry`
    /// field. `None` falls back to the configured default cap.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Custom retry delay in seconds for the given completed-attempt count.
    /// Return `None` (or a non-positive value) to use the default backoff
    /// formula.
    fn retry_in(&self, _count: u32, _error: &SparkworkError) -> Option<i64> {
        None
    }

    /// Called once when the job's retries are exhausted, before dead-letter
    /// placement. Errors are logged and do not affect the death path.
    async fn retries_exhausted(&self, _job: &Job, _error: &SparkworkError) -> Result<()> {
        Ok(())
    }
}

/// Registry mapping handler class names to shared handler instances.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(class.into(), handler);
    }

    pub fn get(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(class).cloned()
    }

    pub fn contains(&self, class: &str) -> bool {
        self.handlers.contains_key(class)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
