use std::fmt;

use thiserror::Error;

/// A captured job failure: the exception-like value recorded on the envelope
/// when a handler or middleware returns an error.
///
/// Failures carry a class name (recorded as `error_class` on the wire), a
/// message, optional backtrace frames, and an optional cause. The cause chain
/// is what the shutdown check walks: a failure whose chain bottoms out at
/// [`SparkworkError::Shutdown`] is treated as an interrupted job, not a
/// failed one.
#[derive(Debug)]
pub struct Failure {
    class: String,
    message: String,
    backtrace: Vec<String>,
    cause: Option<Box<SparkworkError>>,
}

impl Failure {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            backtrace: Vec::new(),
            cause: None,
        }
    }

    /// Attach backtrace frames, outermost first.
    pub fn with_backtrace(mut self, frames: Vec<String>) -> Self {
        self.backtrace = frames;
        self
    }

    /// Chain an underlying error as this failure's cause.
    pub fn caused_by(mut self, cause: SparkworkError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }

    pub fn cause(&self) -> Option<&SparkworkError> {
        self.cause.as_deref()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

#[derive(Error, Debug)]
pub enum SparkworkError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("no handler registered for class: {class}")]
    UnknownHandler { class: String },

    /// Marker injected into worker tasks during hard shutdown. Never
    /// persisted; the unit stays in the in-flight list for requeue.
    #[error("shutting down")]
    Shutdown,

    /// Sentinel: the retry engine already recorded this failure (global
    /// path). The processor acks and suppresses further reporting.
    #[error("failure already recorded by the retry engine")]
    Handled,

    /// Sentinel equivalent of [`Handled`](Self::Handled) for the local
    /// (handler-constructed) path.
    #[error("failure already recorded by the retry engine")]
    Skip,

    #[error(transparent)]
    Job(#[from] Failure),

    #[error("worker error: {message}")]
    Worker { message: String },
}

impl SparkworkError {
    /// Walk the cause chain looking for the shutdown marker.
    ///
    /// The walk is bounded by a visited set keyed on pointer identity so a
    /// malformed chain can never loop forever.
    pub fn is_shutdown(&self) -> bool {
        let mut seen: Vec<*const SparkworkError> = Vec::new();
        let mut current = self;
        loop {
            if matches!(current, SparkworkError::Shutdown) {
                return true;
            }
            let ptr = current as *const SparkworkError;
            if seen.contains(&ptr) {
                return false;
            }
            seen.push(ptr);
            match current {
                SparkworkError::Job(failure) => match failure.cause() {
                    Some(cause) => current = cause,
                    None => return false,
                },
                _ => return false,
            }
        }
    }

    /// The class name recorded as `error_class` on the envelope.
    pub fn class(&self) -> String {
        match self {
            SparkworkError::Redis(_) => "RedisError".to_string(),
            SparkworkError::Serialization(_) => "JsonError".to_string(),
            SparkworkError::Io(_) => "IoError".to_string(),
            SparkworkError::Decode(_) => "DecodeError".to_string(),
            SparkworkError::UnknownHandler { .. } => "UnknownHandler".to_string(),
            SparkworkError::Shutdown => "Shutdown".to_string(),
            SparkworkError::Handled => "Handled".to_string(),
            SparkworkError::Skip => "Skip".to_string(),
            SparkworkError::Job(failure) => failure.class().to_string(),
            SparkworkError::Worker { .. } => "WorkerError".to_string(),
        }
    }

    /// Backtrace frames carried by the failure, if any.
    pub fn backtrace_frames(&self) -> &[String] {
        match self {
            SparkworkError::Job(failure) => failure.backtrace(),
            _ => &[],
        }
    }
}
