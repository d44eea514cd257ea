//! The scheduler turns recurring task definitions into jobs.
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::{
    config::SchedulerConfig,
    error::{ProcessError, StoreError},
    process::{Process, ProcessDetails, ProcessIdentity, ProcessKind, RunContext},
    recurring::RecurringTask,
    store::{JobId, Store},
};

/// A recurring occurrence this scheduler enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedOccurrence {
    pub task: String,
    pub run_at: DateTime<Utc>,
    pub job: JobId,
}

pub struct Scheduler {
    identity: ProcessIdentity,
    tasks: Vec<RecurringTask>,
    skip_recurring: bool,
    polling_interval: Duration,
    last_evaluated: DateTime<Utc>,
}

impl Scheduler {
    /// Occurrences before the moment of construction are never enqueued.
    pub fn new(config: &SchedulerConfig, tasks: Vec<RecurringTask>) -> Self {
        Self {
            identity: ProcessIdentity::current(ProcessDetails::Scheduler),
            tasks,
            skip_recurring: config.skip_recurring,
            polling_interval: config.polling_interval,
            last_evaluated: Utc::now(),
        }
    }

    /// Moves the evaluation window start to `at`.
    pub fn starting_from(mut self, at: DateTime<Utc>) -> Self {
        self.last_evaluated = at;
        self
    }

    /// Enqueues every occurrence due since the previous evaluation.
    ///
    /// Occurrences another scheduler already enqueued are skipped. On error the
    /// window is kept, so the next call retries it.
    pub fn evaluate_recurring_tasks(
        &mut self,
        store: &dyn Store,
        now: DateTime<Utc>,
    ) -> Result<Vec<EnqueuedOccurrence>, StoreError> {
        let mut enqueued = Vec::new();
        if now <= self.last_evaluated {
            return Ok(enqueued);
        }

        for task in &self.tasks {
            for run_at in task.occurrences_between(self.last_evaluated, now) {
                match store.enqueue_recurring(task.occurrence(run_at))? {
                    Some(job) => {
                        info!("Enqueued '{}' for {run_at} as job {job}", task.key);
                        enqueued.push(EnqueuedOccurrence {
                            task: task.key.clone(),
                            run_at,
                            job,
                        });
                    }
                    None => debug!("'{}' for {run_at} was already enqueued", task.key),
                }
            }
        }

        self.last_evaluated = now;
        Ok(enqueued)
    }
}

impl Process for Scheduler {
    fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), ProcessError> {
        if self.skip_recurring || self.tasks.is_empty() {
            debug!("{} has nothing to schedule", self.identity.name);
            while ctx.running() {
                ctx.idle(self.polling_interval);
            }
            return Ok(());
        }

        while ctx.running() {
            if let Err(source) = self.evaluate_recurring_tasks(ctx.store(), Utc::now()) {
                ctx.report(&ProcessError::WorkLoopError {
                    kind: ProcessKind::Scheduler,
                    source,
                });
            }
            ctx.idle(self.polling_interval);
        }
        Ok(())
    }
}
