//! The job envelope: the canonical JSON representation of a unit of work.
//!
//! Envelopes are what travels through the datastore. Clients serialize one
//! onto a queue list; the server deserializes it, executes it, and writes it
//! back into the retry or dead sets with failure bookkeeping attached.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Retry policy as it appears on the wire: a boolean or an attempt cap.
///
/// `true` means retry with the configured default cap, `false` disables
/// retries entirely, and an integer caps the number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicy {
    Enabled(bool),
    Limit(u32),
}

impl RetryPolicy {
    /// Resolve the policy to a concrete attempt cap.
    pub fn max_attempts(&self, default: u32) -> u32 {
        match self {
            RetryPolicy::Enabled(true) => default,
            RetryPolicy::Enabled(false) => 0,
            RetryPolicy::Limit(n) => *n,
        }
    }
}

/// Backtrace policy: `true` stores the full stack, an integer caps the
/// number of stored frames, `false` (or absence) stores nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BacktracePolicy {
    Enabled(bool),
    Limit(usize),
}

/// A unit of work in wire form.
///
/// Timestamps are Unix epoch seconds as 64-bit floats, matching the sorted
/// set scores used for scheduling. Optional fields are omitted from the
/// serialized form entirely when unset.
///
/// # Examples
///
/// ```rust
/// use sparkwork::{Job, RetryPolicy};
/// use serde_json::json;
///
/// let job = Job::new("EmailWorker", vec![json!("user@example.com")])
///     .with_queue("mailers")
///     .with_retry(RetryPolicy::Limit(5));
///
/// assert_eq!(job.jid.len(), 24);
/// assert_eq!(job.queue, "mailers");
/// assert_eq!(job.retry, Some(RetryPolicy::Limit(5)));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Registered handler name.
    pub class: String,
    /// JSON-safe positional arguments for the handler.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Unique 24-hex identifier, generated at enqueue and immutable after.
    pub jid: String,
    /// Target queue name for execution.
    pub queue: String,
    /// Client-set retry policy. Once set, the server never overwrites it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Override queue for retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_queue: Option<String>,
    /// Attempts completed before the next try. Absent means zero; the field
    /// reads N-1 after N failures, and the pre-increment value drives the
    /// retry-vs-death decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Unix seconds of the first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<f64>,
    /// Unix seconds of the most recent retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<f64>,
    /// Class of the last error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    /// Last error message, truncated to 10,000 bytes of valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Whether (and how much of) the error stack to store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<BacktracePolicy>,
    /// zlib-deflated, base64-encoded JSON array of stack frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_backtrace: Option<String>,
    /// When explicitly `false`, suppress dead-letter placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,
}

impl Job {
    /// Create a new job for the `default` queue with a fresh jid.
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            jid: generate_jid(),
            queue: "default".to_string(),
            retry: None,
            retry_queue: None,
            retry_count: None,
            failed_at: None,
            retried_at: None,
            error_class: None,
            error_message: None,
            backtrace: None,
            error_backtrace: None,
            dead: None,
            created_at: Some(now_epoch()),
            enqueued_at: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_retry_queue(mut self, queue: impl Into<String>) -> Self {
        self.retry_queue = Some(queue.into());
        self
    }

    pub fn with_backtrace(mut self, policy: BacktracePolicy) -> Self {
        self.backtrace = Some(policy);
        self
    }

    /// Opt this job out of the dead set when its retries are exhausted.
    pub fn without_dead_letter(mut self) -> Self {
        self.dead = Some(false);
        self
    }

    /// Deserialize an envelope. Non-object roots are rejected.
    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Serialize to canonical wire JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Generate a 24-character lowercase hex job identifier.
pub fn generate_jid() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Current time as Unix epoch seconds with sub-second precision.
pub(crate) fn now_epoch() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Compress backtrace frames for the `error_backtrace` field: JSON array,
/// zlib-deflated, base64-encoded.
pub fn compress_backtrace(frames: &[String]) -> Result<String> {
    let json = serde_json::to_vec(frames)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

/// Reverse [`compress_backtrace`] exactly.
pub fn decompress_backtrace(encoded: &str) -> Result<Vec<String>> {
    let compressed = BASE64.decode(encoded)?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_job_has_fresh_jid_and_defaults() {
        let job = Job::new("TestWorker", vec![json!(1)]);
        assert_eq!(job.jid.len(), 24);
        assert!(job.jid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(job.queue, "default");
        assert_eq!(job.retry_count, None);
        assert!(job.created_at.is_some());
    }

    #[test]
    fn test_jids_are_unique() {
        let a = generate_jid();
        let b = generate_jid();
        assert_ne!(a, b);
    }

    #[test]
    fn test_serde_round_trip_omits_unset_fields() {
        let job = Job::new("TestWorker", vec![json!("a"), json!(2)]);
        let wire = job.to_json().unwrap();
        assert!(!wire.contains("retry_count"));
        assert!(!wire.contains("error_message"));

        let back = Job::from_json(&wire).unwrap();
        assert_eq!(back.class, "TestWorker");
        assert_eq!(back.args, vec![json!("a"), json!(2)]);
        assert_eq!(back.jid, job.jid);
    }

    #[test]
    fn test_load_rejects_non_object_roots() {
        assert!(Job::from_json("[1, 2, 3]").is_err());
        assert!(Job::from_json("\"job\"").is_err());
        assert!(Job::from_json("42").is_err());
    }

    #[test]
    fn test_retry_policy_wire_forms() {
        let job: Job =
            serde_json::from_str(r#"{"class":"W","args":[],"jid":"abc","queue":"default","retry":true}"#)
                .unwrap();
        assert_eq!(job.retry, Some(RetryPolicy::Enabled(true)));

        let job: Job =
            serde_json::from_str(r#"{"class":"W","args":[],"jid":"abc","queue":"default","retry":false}"#)
                .unwrap();
        assert_eq!(job.retry, Some(RetryPolicy::Enabled(false)));

        let job: Job =
            serde_json::from_str(r#"{"class":"W","args":[],"jid":"abc","queue":"default","retry":5}"#)
                .unwrap();
        assert_eq!(job.retry, Some(RetryPolicy::Limit(5)));
    }

    #[test]
    fn test_retry_policy_max_attempts() {
        assert_eq!(RetryPolicy::Enabled(true).max_attempts(25), 25);
        assert_eq!(RetryPolicy::Enabled(false).max_attempts(25), 0);
        assert_eq!(RetryPolicy::Limit(2).max_attempts(25), 2);
    }

    #[test]
    fn test_timestamp_precision_survives_round_trip() {
        let mut job = Job::new("TestWorker", vec![]);
        job.failed_at = Some(1_700_000_000.123456);
        let back = Job::from_json(&job.to_json().unwrap()).unwrap();
        assert_eq!(back.failed_at, Some(1_700_000_000.123456));
    }

    #[test]
    fn test_backtrace_compression_round_trip() {
        let frames = vec![
            "app/workers/email.rs:42".to_string(),
            "src/lib.rs:7".to_string(),
        ];
        let encoded = compress_backtrace(&frames).unwrap();
        assert_eq!(decompress_backtrace(&encoded).unwrap(), frames);
    }

    #[test]
    fn test_empty_backtrace_compresses_to_nonempty_string() {
        let encoded = compress_backtrace(&[]).unwrap();
        assert!(!encoded.is_empty());
        assert_eq!(decompress_backtrace(&encoded).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_dead_false_is_distinct_from_absent() {
        let job = Job::new("TestWorker", vec![]);
        assert_eq!(job.dead, None);

        let job = job.without_dead_letter();
        assert_eq!(job.dead, Some(false));
        let wire = job.to_json().unwrap();
        assert!(wire.contains(r#""dead":false"#));
    }
}
