//! Error handling for forkq.
use thiserror::Error;

use crate::process::{LifecyclePhase, ProcessKind};
use crate::store::{JobId, RegistrationId};

/// Boxed error returned by user supplied hook callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A referenced environment variable is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A value that parsed but makes no sense (zero batch size, bad cron, ...).
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error reading, writing or locking the store file.
    #[error("Failed to access store: {0}")]
    Io(#[from] std::io::Error),

    /// Error encoding or decoding the store document.
    #[error("Failed to parse store: {0}")]
    Parse(#[from] serde_json::Error),

    /// The registration does not exist (already removed or pruned).
    #[error("Process registration {0} not found")]
    RegistrationNotFound(RegistrationId),

    /// The job does not exist.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// Error for a poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StoreError::MutexPoisonError(err.to_string())
    }
}

/// Everything that may be delivered to the error sink.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// A lifecycle hook returned an error or panicked.
    #[error("{phase} hook for {kind} failed: {source}")]
    HookExecutionError {
        /// Kind of the process invoking the hook.
        kind: ProcessKind,
        /// Phase being run.
        phase: LifecyclePhase,
        /// What the hook raised, untouched.
        #[source]
        source: BoxError,
    },

    /// The process could not register itself with the store.
    #[error("{kind} failed to register: {source}")]
    RegistrationError {
        /// Kind of the process registering.
        kind: ProcessKind,
        /// The underlying store error.
        #[source]
        source: StoreError,
    },

    /// A store call made by a work loop failed.
    #[error("{kind} work loop failed: {source}")]
    WorkLoopError {
        /// Kind of the process running the loop.
        kind: ProcessKind,
        /// The underlying store error.
        #[source]
        source: StoreError,
    },

    /// The work loop panicked.
    #[error("{kind} work loop panicked: {message}")]
    WorkLoopPanic {
        /// Kind of the process running the loop.
        kind: ProcessKind,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// A claimed job could not be executed.
    #[error("Job {job} failed to run: {source}")]
    JobExecutionError {
        /// The job that failed.
        job: JobId,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Spawning, signalling or reaping a child failed.
    #[error("Supervision of {kind} failed: {source}")]
    SupervisionError {
        /// Kind of the child being supervised.
        kind: ProcessKind,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },
}
