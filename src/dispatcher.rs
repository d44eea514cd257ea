//! Dispatchers move scheduled jobs whose time has come onto their queues.
use std::time::Duration;

use tracing::debug;

use crate::{
    config::DispatcherConfig,
    error::{ProcessError, StoreError},
    process::{Process, ProcessDetails, ProcessIdentity, ProcessKind, RunContext},
    store::Store,
};

pub struct Dispatcher {
    identity: ProcessIdentity,
    batch_size: usize,
    polling_interval: Duration,
    queues: Vec<String>,
}

impl Dispatcher {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            identity: ProcessIdentity::current(ProcessDetails::Dispatcher {
                batch_size: config.batch_size,
            }),
            batch_size: config.batch_size.max(1),
            polling_interval: config.polling_interval,
            queues: config.queues.clone(),
        }
    }

    /// Releases one batch. Returns how many jobs became ready.
    pub fn dispatch_batch(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let released = store.release_due_jobs(&self.queues, self.batch_size)?;
        if released > 0 {
            debug!("{} released {released} job(s)", self.identity.name);
        }
        Ok(released)
    }
}

impl Process for Dispatcher {
    fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), ProcessError> {
        while ctx.running() {
            match self.dispatch_batch(ctx.store()) {
                // A full batch means more may be due.
                Ok(released) if released >= self.batch_size => {}
                Ok(_) => ctx.idle(self.polling_interval),
                Err(source) => {
                    ctx.report(&ProcessError::WorkLoopError {
                        kind: ProcessKind::Dispatcher,
                        source,
                    });
                    ctx.idle(self.polling_interval);
                }
            }
        }
        Ok(())
    }
}
