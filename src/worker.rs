//! Workers claim ready jobs and run them as shell commands.
use std::{
    io,
    os::unix::process::CommandExt,
    process::{Command, ExitStatus, Stdio},
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    config::WorkerConfig,
    error::{ProcessError, StoreError},
    process::{Process, ProcessDetails, ProcessIdentity, ProcessKind, RunContext},
    store::{Job, JobOutcome},
};

/// How often running jobs are checked for completion.
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Worker {
    identity: ProcessIdentity,
    queues: Vec<String>,
    threads: usize,
    polling_interval: Duration,
}

impl Worker {
    /// Builds a worker for the calling OS process.
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            identity: ProcessIdentity::current(ProcessDetails::Worker {
                queues: config.queues.clone(),
            }),
            queues: config.queues.clone(),
            threads: config.threads.max(1),
            polling_interval: config.polling_interval,
        }
    }

    /// Claims up to `threads` jobs, runs them concurrently and records the outcomes.
    /// Returns the number of jobs claimed.
    ///
    /// The registration keeps heartbeating while the jobs run.
    pub fn work_off(&self, ctx: &mut RunContext<'_>) -> Result<usize, StoreError> {
        let jobs = ctx
            .store()
            .claim_jobs(&self.queues, self.threads, ctx.registration())?;
        if jobs.is_empty() {
            return Ok(0);
        }
        debug!("{} claimed {} job(s)", self.identity.name, jobs.len());

        let results: Vec<(&Job, io::Result<ExitStatus>)> = thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .iter()
                .map(|job| (job, scope.spawn(move || execute(job))))
                .collect();
            while !handles.iter().all(|(_, handle)| handle.is_finished()) {
                ctx.heartbeat_if_due();
                thread::sleep(JOB_POLL_INTERVAL);
            }
            handles
                .into_iter()
                .map(|(job, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(io::Error::other("job execution thread panicked"))
                    });
                    (job, result)
                })
                .collect()
        });

        for (job, result) in results {
            let outcome = match result {
                Ok(status) if status.success() => {
                    info!("Job {} on '{}' finished", job.id, job.queue);
                    JobOutcome::Finished
                }
                Ok(status) => {
                    warn!("Job {} on '{}' failed: {status}", job.id, job.queue);
                    JobOutcome::Failed(status.to_string())
                }
                Err(source) => {
                    let message = source.to_string();
                    ctx.report(&ProcessError::JobExecutionError {
                        job: job.id,
                        source,
                    });
                    JobOutcome::Failed(message)
                }
            };
            if let Err(source) = ctx.store().complete_job(job.id, outcome) {
                ctx.report(&ProcessError::WorkLoopError {
                    kind: ProcessKind::Worker,
                    source,
                });
            }
        }
        Ok(jobs.len())
    }
}

/// Runs the job command in its own process group and waits for it.
fn execute(job: &Job) -> io::Result<ExitStatus> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&job.command)
        .env("FORKQ_JOB_ID", job.id.to_string())
        .env("FORKQ_QUEUE", &job.queue)
        .stdin(Stdio::null());

    unsafe {
        cmd.pre_exec(|| {
            // Own group: terminal SIGINT reaches the worker only, and in-flight
            // jobs run to completion while it drains.
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    cmd.status()
}

impl Process for Worker {
    fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), ProcessError> {
        while ctx.running() {
            match self.work_off(ctx) {
                Ok(0) => ctx.idle(self.polling_interval),
                Ok(_) => {}
                Err(source) => {
                    ctx.report(&ProcessError::WorkLoopError {
                        kind: ProcessKind::Worker,
                        source,
                    });
                    ctx.idle(self.polling_interval);
                }
            }
        }
        Ok(())
    }
}
