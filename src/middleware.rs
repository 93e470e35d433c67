//! The middleware chain: an ordered, composable interceptor pipeline invoked
//! around every job execution.
//!
//! Each entry wraps a factory producing a fresh interceptor per invocation.
//! Interceptors run in list order on the way in and reverse order on the way
//! out; an interceptor that never runs its [`Next`] continuation skips the
//! rest of the chain and the terminal action entirely.
//!
//! # Examples
//!
//! ```rust
//! use sparkwork::middleware::MiddlewareChain;
//!
//! struct Timing;
//! # #[async_trait::async_trait]
//! # impl sparkwork::middleware::Middleware for Timing {
//! #     async fn call(
//! #         &self,
//! #         worker: Option<&dyn sparkwork::JobHandler>,
//! #         job: &mut sparkwork::Job,
//! #         queue: &str,
//! #         next: sparkwork::middleware::Next<'_>,
//! #     ) -> sparkwork::Result<()> {
//! #         next.run(worker, job, queue).await
//! #     }
//! # }
//!
//! let mut chain = MiddlewareChain::new();
//! chain.add("timing", || Box::new(Timing));
//! assert!(chain.exists("timing"));
//! assert_eq!(chain.count(), 1);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::Result;
use crate::job::Job;
use crate::registry::JobHandler;

/// The terminal action at the deepest point of the chain. It reads the job
/// synchronously and returns an owned future, so interceptor mutations made
/// before the terminal runs are visible to it.
pub type Terminal<'a> = &'a (dyn Fn(&mut Job) -> BoxFuture<'static, Result<()>> + Send + Sync);

/// An interceptor around job execution.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Run this interceptor. Invoke `next.run(..)` to continue the chain;
    /// returning without doing so skips everything deeper, including the
    /// terminal.
    async fn call(
        &self,
        worker: Option<&dyn JobHandler>,
        job: &mut Job,
        queue: &str,
        next: Next<'_>,
    ) -> Result<()>;
}

type MiddlewareFactory = Arc<dyn Fn() -> Box<dyn Middleware> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    name: String,
    factory: MiddlewareFactory,
}

/// The remainder of a chain, handed to each interceptor as its continuation.
pub struct Next<'a> {
    rest: &'a [Box<dyn Middleware>],
    terminal: Terminal<'a>,
}

impl<'a> Next<'a> {
    /// Continue with the next interceptor, or the terminal when the chain is
    /// exhausted.
    pub async fn run(
        self,
        worker: Option<&dyn JobHandler>,
        job: &mut Job,
        queue: &str,
    ) -> Result<()> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                let next = Next { rest, terminal: self.terminal };
                middleware.call(worker, job, queue, next).await
            }
            None => (self.terminal)(job).await,
        }
    }
}

/// Ordered collection of middleware entries, keyed by name.
///
/// Server and client chains are independent: cloning yields a chain that can
/// be mutated without affecting the original.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Entry>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    fn entry(
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Middleware> + Send + Sync + 'static,
    ) -> Entry {
        Entry { name: name.into(), factory: Arc::new(factory) }
    }

    /// Append an entry, replacing any existing entry with the same name.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Middleware> + Send + Sync + 'static,
    ) {
        let entry = Self::entry(name, factory);
        self.remove(&entry.name);
        self.entries.push(entry);
    }

    /// Insert an entry at the head, replacing any existing entry with the
    /// same name.
    pub fn prepend(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Middleware> + Send + Sync + 'static,
    ) {
        let entry = Self::entry(name, factory);
        self.remove(&entry.name);
        self.entries.insert(0, entry);
    }

    /// Insert an entry just before `anchor` (or at the head when the anchor
    /// is absent), replacing any existing entry with the same name.
    pub fn insert_before(
        &mut self,
        anchor: &str,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Middleware> + Send + Sync + 'static,
    ) {
        let entry = Self::entry(name, factory);
        self.remove(&entry.name);
        let index = self.position(anchor).unwrap_or(0);
        self.entries.insert(index, entry);
    }

    /// Insert an entry just after `anchor` (or at the tail when the anchor
    /// is absent), replacing any existing entry with the same name.
    pub fn insert_after(
        &mut self,
        anchor: &str,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Middleware> + Send + Sync + 'static,
    ) {
        let entry = Self::entry(name, factory);
        self.remove(&entry.name);
        let index = self.position(anchor).map(|i| i + 1).unwrap_or(self.entries.len());
        self.entries.insert(index, entry);
    }

    /// Delete the entry with this name. No-op when absent.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|e| e.name != name);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn exists(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only snapshot of entry names, in invocation order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Build fresh interceptor instances and run them composed inside-out,
    /// with `terminal` at the deepest point.
    pub async fn invoke(
        &self,
        worker: Option<&dyn JobHandler>,
        job: &mut Job,
        queue: &str,
        terminal: Terminal<'_>,
    ) -> Result<()> {
        let stack: Vec<Box<dyn Middleware>> =
            self.entries.iter().map(|e| (e.factory)()).collect();
        Next { rest: &stack, terminal }.run(worker, job, queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Recorder = Arc<Mutex<Vec<String>>>;

    struct Recording {
        label: &'static str,
        recorder: Recorder,
        forward: bool,
    }

    #[async_trait]
    impl Middleware for Recording {
        async fn call(
            &self,
            worker: Option<&dyn JobHandler>,
            job: &mut Job,
            queue: &str,
            next: Next<'_>,
        ) -> Result<()> {
            self.recorder.lock().unwrap().push(format!("{} before", self.label));
            if self.forward {
                next.run(worker, job, queue).await?;
            }
            self.recorder.lock().unwrap().push(format!("{} after", self.label));
            Ok(())
        }
    }

    fn recording_chain(labels: &[&'static str], skip: Option<&'static str>) -> (MiddlewareChain, Recorder) {
        let recorder: Recorder = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        for label in labels {
            let label = *label;
            let recorder = recorder.clone();
            let forward = Some(label) != skip;
            chain.add(label, move || {
                Box::new(Recording { label, recorder: recorder.clone(), forward })
            });
        }
        (chain, recorder)
    }

    async fn run_chain(chain: &MiddlewareChain, recorder: &Recorder) -> Result<()> {
        let mut job = Job::new("TestWorker", vec![]);
        let recorder = recorder.clone();
        let terminal = move |_job: &mut Job| -> BoxFuture<'static, Result<()>> {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.lock().unwrap().push("work".to_string());
                Ok(())
            })
        };
        chain.invoke(None, &mut job, "default", &terminal).await
    }

    #[tokio::test]
    async fn test_invoke_runs_entries_in_order_and_unwinds_in_reverse() {
        let (chain, recorder) = recording_chain(&["A", "B", "C"], None);
        run_chain(&chain, &recorder).await.unwrap();
        assert_eq!(
            *recorder.lock().unwrap(),
            vec!["A before", "B before", "C before", "work", "C after", "B after", "A after"]
        );
    }

    #[tokio::test]
    async fn test_non_forwarding_entry_skips_deeper_entries_and_terminal() {
        let (chain, recorder) = recording_chain(&["A", "B", "C"], Some("B"));
        run_chain(&chain, &recorder).await.unwrap();
        assert_eq!(
            *recorder.lock().unwrap(),
            vec!["A before", "B before", "B after", "A after"]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_runs_terminal() {
        let (chain, recorder) = recording_chain(&[], None);
        run_chain(&chain, &recorder).await.unwrap();
        assert_eq!(*recorder.lock().unwrap(), vec!["work"]);
    }

    #[test]
    fn test_add_replaces_duplicate_in_place() {
        let (mut chain, recorder) = recording_chain(&["A", "B"], None);
        let recorder2 = recorder.clone();
        chain.add("A", move || {
            Box::new(Recording { label: "A", recorder: recorder2.clone(), forward: true })
        });
        // The re-added entry moves to the tail; the chain does not grow.
        assert_eq!(chain.count(), 2);
        assert_eq!(chain.entries(), vec!["B", "A"]);
    }

    #[test]
    fn test_positional_inserts() {
        let (mut chain, recorder) = recording_chain(&["A", "C"], None);
        let r = recorder.clone();
        chain.insert_before("C", "B", move || {
            Box::new(Recording { label: "B", recorder: r.clone(), forward: true })
        });
        let r = recorder.clone();
        chain.insert_after("C", "D", move || {
            Box::new(Recording { label: "D", recorder: r.clone(), forward: true })
        });
        assert_eq!(chain.entries(), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_remove_clear_exists() {
        let (mut chain, _) = recording_chain(&["A", "B"], None);
        chain.remove("A");
        assert!(!chain.exists("A"));
        assert!(chain.exists("B"));
        chain.remove("missing");
        assert_eq!(chain.count(), 1);
        chain.clear();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_cloned_chain_is_independent() {
        let (mut chain, recorder) = recording_chain(&["A"], None);
        let clone = chain.clone();
        let r = recorder.clone();
        chain.add("B", move || {
            Box::new(Recording { label: "B", recorder: r.clone(), forward: true })
        });
        assert_eq!(chain.count(), 2);
        assert_eq!(clone.count(), 1);
    }
}
