//! Status reporting for registered processes and queued jobs.
use std::io::{self, Write};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::{
    error::StoreError,
    process::{ProcessKind, hostname},
    store::{Job, JobState, Registration, Store},
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Whether a registered process is alive, as seen from this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Running,
    Missing,
    /// Registered from another host; cannot be checked here.
    Remote,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    #[serde(flatten)]
    pub registration: Registration,
    pub liveness: Liveness,
    /// Resident memory in bytes, when the process could be inspected.
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobCounts {
    pub scheduled: usize,
    pub ready: usize,
    pub claimed: usize,
    pub finished: usize,
    pub failed: usize,
}

impl JobCounts {
    fn tally(jobs: &[Job]) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.state {
                JobState::Scheduled => counts.scheduled += 1,
                JobState::Ready => counts.ready += 1,
                JobState::Claimed => counts.claimed += 1,
                JobState::Finished => counts.finished += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// Snapshot of the store, enriched with what this host knows about each PID.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub processes: Vec<ProcessStatus>,
    pub jobs: JobCounts,
}

impl StatusReport {
    pub fn collect(store: &dyn Store) -> Result<Self, StoreError> {
        let registrations = store.registrations()?;
        let jobs = store.jobs()?;
        let local_host = hostname();

        let mut system = System::new();
        let local_pids: Vec<Pid> = registrations
            .iter()
            .filter(|r| r.identity.hostname == local_host)
            .map(|r| Pid::from_u32(r.identity.pid))
            .collect();
        system.refresh_processes(ProcessesToUpdate::Some(&local_pids), true);

        let mut processes: Vec<ProcessStatus> = registrations
            .into_iter()
            .map(|registration| {
                if registration.identity.hostname != local_host {
                    return ProcessStatus {
                        registration,
                        liveness: Liveness::Remote,
                        memory_bytes: None,
                    };
                }
                let process = system.process(Pid::from_u32(registration.identity.pid));
                ProcessStatus {
                    liveness: if process.is_some() {
                        Liveness::Running
                    } else {
                        Liveness::Missing
                    },
                    memory_bytes: process.map(|p| p.memory()),
                    registration,
                }
            })
            .collect();
        processes.sort_by_key(|status| {
            (
                status.registration.supervisor.is_some(),
                status.registration.identity.kind(),
                status.registration.id,
            )
        });

        Ok(Self {
            generated_at: Utc::now(),
            processes,
            jobs: JobCounts::tally(&jobs),
        })
    }

    /// Registered supervisors running on this host.
    pub fn local_supervisors(&self) -> impl Iterator<Item = &ProcessStatus> {
        self.processes.iter().filter(|status| {
            status.registration.identity.kind() == ProcessKind::Supervisor
                && status.liveness == Liveness::Running
        })
    }

    pub fn write_table(&self, out: &mut impl Write, color: bool) -> io::Result<()> {
        if self.processes.is_empty() {
            writeln!(out, "No registered processes.")?;
        } else {
            writeln!(
                out,
                "{:<6} {:<12} {:<8} {:<10} {:<20} {:<10} DETAILS",
                "ID", "KIND", "PID", "STATE", "HEARTBEAT", "MEMORY"
            )?;
            for status in &self.processes {
                write_process_row(out, status, color)?;
            }
        }

        let jobs = &self.jobs;
        writeln!(
            out,
            "\nJobs: {} scheduled, {} ready, {} claimed, {} finished, {} failed",
            jobs.scheduled, jobs.ready, jobs.claimed, jobs.finished, jobs.failed
        )
    }

    pub fn write_json(&self, out: &mut impl Write) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *out, self).map_err(io::Error::other)?;
        writeln!(out)
    }
}

fn write_process_row(out: &mut impl Write, status: &ProcessStatus, color: bool) -> io::Result<()> {
    let registration = &status.registration;
    let identity = &registration.identity;
    let (label, paint) = match status.liveness {
        Liveness::Running => ("running", GREEN_BOLD),
        Liveness::Missing => ("missing", RED_BOLD),
        Liveness::Remote => ("remote", YELLOW_BOLD),
    };
    let state = if color {
        format!("{paint}{label:<10}{RESET}")
    } else {
        format!("{label:<10}")
    };
    let memory = status
        .memory_bytes
        .map(|bytes| format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0)))
        .unwrap_or_else(|| "-".to_string());
    let details = match (identity.queues(), identity.batch_size()) {
        (Some(queues), _) => format!("queues={}", queues.join(",")),
        (_, Some(batch_size)) => format!("batch_size={batch_size}"),
        _ => String::new(),
    };

    writeln!(
        out,
        "{:<6} {:<12} {:<8} {} {:<20} {:<10} {}",
        registration.id,
        identity.kind().as_ref(),
        identity.pid,
        state,
        registration.last_heartbeat_at.format("%Y-%m-%d %H:%M:%S"),
        memory,
        details
    )
}

/// Prints jobs, newest first, optionally filtered by state.
pub fn write_jobs(
    out: &mut impl Write,
    jobs: &[Job],
    state: Option<JobState>,
    limit: usize,
) -> io::Result<()> {
    let selected: Vec<&Job> = jobs
        .iter()
        .rev()
        .filter(|job| state.is_none_or(|s| job.state == s))
        .take(limit)
        .collect();

    if selected.is_empty() {
        return writeln!(out, "No jobs.");
    }

    writeln!(
        out,
        "{:<6} {:<16} {:<9} {:<10} {:<20} COMMAND",
        "ID", "QUEUE", "PRIORITY", "STATE", "CREATED"
    )?;
    for job in selected {
        writeln!(
            out,
            "{:<6} {:<16} {:<9} {:<10} {:<20} {}",
            job.id,
            job.queue,
            job.priority,
            job.state.to_string(),
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.command
        )?;
        if let Some(error) = &job.error {
            writeln!(out, "       error: {error}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        process::{ProcessDetails, ProcessIdentity},
        store::{JobOutcome, MemoryStore, NewJob},
    };

    #[test]
    fn report_marks_live_and_dead_pids() {
        let store = MemoryStore::new();
        let me = ProcessIdentity::current(ProcessDetails::Supervisor);
        let mut ghost = ProcessIdentity::current(ProcessDetails::Worker {
            queues: vec!["default".into()],
        });
        ghost.pid = u32::MAX - 1;
        let mut remote = ghost.clone();
        remote.hostname = "some-other-host".into();

        let supervisor = store.register(&me, None).unwrap();
        store.register(&ghost, Some(supervisor)).unwrap();
        store.register(&remote, Some(supervisor)).unwrap();

        let report = StatusReport::collect(&store).unwrap();
        let liveness: Vec<Liveness> = report.processes.iter().map(|p| p.liveness).collect();
        assert_eq!(
            liveness,
            vec![Liveness::Running, Liveness::Missing, Liveness::Remote]
        );
        assert_eq!(report.local_supervisors().count(), 1);
    }

    #[test]
    fn table_and_json_include_job_counts() {
        let store = MemoryStore::new();
        let id = store.enqueue(NewJob::new("default", "true")).unwrap();
        store.enqueue(NewJob::new("default", "true")).unwrap();
        store.complete_job(id, JobOutcome::Finished).unwrap();

        let report = StatusReport::collect(&store).unwrap();
        let mut table = Vec::new();
        report.write_table(&mut table, false).unwrap();
        let table = String::from_utf8(table).unwrap();
        assert!(table.contains("No registered processes."));
        assert!(table.contains("1 ready"));
        assert!(table.contains("1 finished"));

        let mut json = Vec::new();
        report.write_json(&mut json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["jobs"]["ready"], 1);
    }

    #[test]
    fn job_listing_filters_by_state() {
        let store = MemoryStore::new();
        let failed = store.enqueue(NewJob::new("mailers", "exit 1")).unwrap();
        store.enqueue(NewJob::new("default", "true")).unwrap();
        store
            .complete_job(failed, JobOutcome::Failed("exit status: 1".into()))
            .unwrap();

        let mut out = Vec::new();
        write_jobs(&mut out, &store.jobs().unwrap(), Some(JobState::Failed), 10).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("mailers"));
        assert!(out.contains("error: exit status: 1"));
        assert!(!out.contains("default"));
    }
}
