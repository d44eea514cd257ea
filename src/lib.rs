//! forkq runs a database-backed job queue as a tree of OS processes. A supervisor
//! forks workers, dispatchers and a scheduler, keeps them alive and drains them
//! on SIGTERM. Every process goes through the same start, stop and exit lifecycle,
//! with hooks registered per process kind.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Dispatcher process: releases scheduled jobs.
pub mod dispatcher;

/// Error handling.
pub mod error;

/// Lifecycle hooks and the error sink.
pub mod hooks;

/// Process identities and the shared lifecycle runtime.
pub mod process;

/// Recurring task definitions.
pub mod recurring;

/// Runtime directories.
pub mod runtime;

/// Scheduler process: enqueues recurring tasks.
pub mod scheduler;

/// Termination signals and shutdown flags.
pub mod signals;

/// Status reporting.
pub mod status;

/// Registration and job persistence.
pub mod store;

/// Supervisor process: forks and watches the others.
pub mod supervisor;

/// Test helpers.
#[doc(hidden)]
pub mod test_utils;

/// Worker process: claims and runs jobs.
pub mod worker;
