//! The retry/death engine: decides, given a failed execution, whether the
//! envelope goes back into the `retry` sorted set with a backoff delay or
//! into the capped dead set.
//!
//! Two entry points wrap execution. [`RetryEngine::global`] guards the span
//! where the payload may not yet have resolved to a handler (parse, handler
//! lookup); [`RetryEngine::local`] guards the handler execution itself. Both
//! re-raise the shutdown marker untouched, record every other failure, and
//! return a sentinel ([`SparkworkError::Handled`] / [`SparkworkError::Skip`])
//! so the processor knows the failure is already persisted.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, error, info};

use crate::Result;
use crate::config::Context;
use crate::datastore::{DEAD_SET, RETRY_SET};
use crate::error::SparkworkError;
use crate::job::{BacktracePolicy, Job, compress_backtrace, now_epoch};
use crate::registry::JobHandler;

/// Hard cap on the stored `error_message`, in bytes.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 10_000;

const MESSAGE_PANIC_PLACEHOLDER: &str = "!!! ERROR MESSAGE THREW AN ERROR !!!";

/// Truncate a message to [`MAX_ERROR_MESSAGE_BYTES`] of valid UTF-8.
pub fn scrub(message: &str) -> String {
    let mut end = message.len().min(MAX_ERROR_MESSAGE_BYTES);
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

fn safe_message(error: &SparkworkError) -> String {
    catch_unwind(AssertUnwindSafe(|| error.to_string()))
        .unwrap_or_else(|_| MESSAGE_PANIC_PLACEHOLDER.to_string())
}

pub struct RetryEngine {
    ctx: Arc<Context>,
}

impl RetryEngine {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Wrap the span where the payload may not have resolved to a handler
    /// yet. On failure the envelope is re-read from the raw payload, so
    /// handler policy defaults do not apply.
    pub async fn global<F>(&self, payload: &str, queue: &str, f: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send,
    {
        let error = match f.await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        match error {
            SparkworkError::Handled | SparkworkError::Skip | SparkworkError::Shutdown => {
                return Err(error);
            }
            _ => {}
        }
        if error.is_shutdown() {
            return Err(SparkworkError::Shutdown);
        }
        let mut job = match Job::from_json(payload) {
            Ok(job) => job,
            // The payload is beyond saving; let the processor report it.
            Err(_) => return Err(error),
        };
        self.record_failure(None, &mut job, queue, &error).await?;
        Err(SparkworkError::Handled)
    }

    /// Wrap handler execution. The handler's declared retry policy fills in
    /// when the envelope carries no `retry` field.
    pub async fn local<F>(
        &self,
        handler: &Arc<dyn JobHandler>,
        payload: &str,
        queue: &str,
        f: F,
    ) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send,
    {
        let error = match f.await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        match error {
            SparkworkError::Handled | SparkworkError::Skip | SparkworkError::Shutdown => {
                return Err(error);
            }
            _ => {}
        }
        if error.is_shutdown() {
            return Err(SparkworkError::Shutdown);
        }
        let mut job = match Job::from_json(payload) {
            Ok(job) => job,
            Err(_) => return Err(error),
        };
        self.record_failure(Some(handler), &mut job, queue, &error).await?;
        Err(SparkworkError::Skip)
    }

    fn max_attempts_for(&self, job: &Job, handler: Option<&Arc<dyn JobHandler>>) -> u32 {
        let policy = job.retry.or_else(|| handler.and_then(|h| h.retry_policy()));
        match policy {
            Some(policy) => policy.max_attempts(self.ctx.config.max_retries),
            None => self.ctx.config.max_retries,
        }
    }

    async fn record_failure(
        &self,
        handler: Option<&Arc<dyn JobHandler>>,
        job: &mut Job,
        queue: &str,
        error: &SparkworkError,
    ) -> Result<()> {
        let max_attempts = self.max_attempts_for(job, handler);
        if max_attempts == 0 {
            // Retries disabled: straight to the death path, envelope as-is.
            self.send_to_death(handler, job, error).await;
            return Ok(());
        }

        job.queue = job.retry_queue.clone().unwrap_or_else(|| queue.to_string());
        job.error_class = Some(error.class());
        job.error_message = Some(scrub(&safe_message(error)));

        let now = now_epoch();
        // First failure sets the count to zero; later failures increment.
        // After N failures the field reads N-1, and this same value drives
        // the retry-vs-death decision below.
        let count = match job.retry_count {
            Some(previous) => {
                job.retried_at = Some(now);
                let count = previous + 1;
                job.retry_count = Some(count);
                count
            }
            None => {
                job.failed_at = Some(now);
                job.retry_count = Some(0);
                0
            }
        };

        let frames = error.backtrace_frames();
        match job.backtrace {
            Some(BacktracePolicy::Enabled(true)) => {
                job.error_backtrace = Some(compress_backtrace(frames)?);
            }
            Some(BacktracePolicy::Limit(limit)) => {
                let capped = &frames[..limit.min(frames.len())];
                job.error_backtrace = Some(compress_backtrace(capped)?);
            }
            _ => {}
        }

        if count < max_attempts {
            let delay = self.delay_for(handler, count, error);
            let payload = job.to_json()?;
            self.ctx
                .datastore
                .zadd(RETRY_SET, now + delay as f64, &payload)
                .await?;
            debug!(
                jid = %job.jid,
                class = %job.class,
                retry_count = count,
                delay,
                "job scheduled for retry"
            );
        } else {
            self.send_to_death(handler, job, error).await;
        }
        Ok(())
    }

    fn delay_for(
        &self,
        handler: Option<&Arc<dyn JobHandler>>,
        count: u32,
        error: &SparkworkError,
    ) -> i64 {
        let jitter = rand::thread_rng().gen_range(0..10) * (i64::from(count) + 1);
        if let Some(handler) = handler {
            if let Some(seconds) = handler.retry_in(count, error) {
                if seconds > 0 {
                    return seconds + jitter;
                }
            }
        }
        i64::from(count).pow(4) + 15 + jitter
    }

    async fn send_to_death(
        &self,
        handler: Option<&Arc<dyn JobHandler>>,
        job: &Job,
        error: &SparkworkError,
    ) {
        info!(jid = %job.jid, class = %job.class, "job exhausted its retries");

        if let Some(handler) = handler {
            if let Err(hook_error) = handler.retries_exhausted(job, error).await {
                error!(jid = %job.jid, error = %hook_error, "retries_exhausted hook failed");
            }
        }

        // Absence means "do dead-letter"; only an explicit false opts out.
        if job.dead != Some(false) {
            if let Err(store_error) = self.push_to_dead_set(job).await {
                error!(jid = %job.jid, error = %store_error, "failed to move job to dead set");
            }
        }

        for death_handler in &self.ctx.death_handlers {
            if catch_unwind(AssertUnwindSafe(|| death_handler(job, error))).is_err() {
                error!(jid = %job.jid, "death handler panicked");
            }
        }
    }

    async fn push_to_dead_set(&self, job: &Job) -> Result<()> {
        let now = now_epoch();
        let datastore = &self.ctx.datastore;
        datastore
            .zremrangebyscore(DEAD_SET, now - self.ctx.config.dead_timeout.as_secs_f64())
            .await?;
        datastore
            .zremrangebyrank(DEAD_SET, 0, -(self.ctx.config.dead_max_jobs as isize))
            .await?;
        datastore.zadd(DEAD_SET, now, &job.to_json()?).await?;
        Ok(())
    }
}
