//! Persistence shared by every process: registrations, jobs and recurring runs.
//!
//! [`StoreState`] holds the data and the queue semantics. [`MemoryStore`] keeps it
//! behind a mutex for single-process use; [`FileStore`] keeps it in a JSON document
//! guarded by an exclusive lock file so forked processes see one another.
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, info};

use crate::{error::StoreError, process::ProcessIdentity};

pub type JobId = u64;
pub type RegistrationId = u64;

const STATE_FILE: &str = "store.json";
const LOCK_FILE: &str = "store.lock";

/// How long enqueued recurring run keys are remembered.
pub const RECURRING_RUN_RETENTION: chrono::TimeDelta = chrono::TimeDelta::days(1);

/// Live record of a running process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: RegistrationId,
    pub identity: ProcessIdentity,
    /// Registration of the supervisor that forked this process.
    pub supervisor: Option<RegistrationId>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    /// Waiting for its `scheduled_at` time and a dispatcher.
    Scheduled,
    Ready,
    Claimed,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Shell command run by the worker.
    pub command: String,
    /// Lower values are claimed first.
    pub priority: i32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<RegistrationId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub queue: String,
    pub command: String,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            command: command.into(),
            priority: 0,
            scheduled_at: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Holds the job back until `at`; a dispatcher releases it afterwards.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Finished,
    Failed(String),
}

/// One due run of a recurring task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub task: String,
    pub run_at: DateTime<Utc>,
    pub job: NewJob,
}

/// Whether `queue` is selected by `selector`: exact name, `*`, or `prefix*`.
pub fn queue_matches(selector: &str, queue: &str) -> bool {
    match selector.strip_suffix('*') {
        Some(prefix) => queue.starts_with(prefix),
        None => selector == queue,
    }
}

fn selected(selectors: &[String], queue: &str) -> bool {
    selectors.iter().any(|selector| queue_matches(selector, queue))
}

/// The whole persisted document.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    next_registration: RegistrationId,
    #[serde(default)]
    next_job: JobId,
    #[serde(default)]
    processes: BTreeMap<RegistrationId, Registration>,
    #[serde(default)]
    jobs: BTreeMap<JobId, Job>,
    #[serde(default)]
    recurring_runs: BTreeSet<(String, DateTime<Utc>)>,
}

impl StoreState {
    pub fn register(
        &mut self,
        identity: &ProcessIdentity,
        supervisor: Option<RegistrationId>,
        now: DateTime<Utc>,
    ) -> RegistrationId {
        self.next_registration += 1;
        let id = self.next_registration;
        self.processes.insert(
            id,
            Registration {
                id,
                identity: identity.clone(),
                supervisor,
                registered_at: now,
                last_heartbeat_at: now,
            },
        );
        id
    }

    pub fn heartbeat(
        &mut self,
        id: RegistrationId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let registration = self
            .processes
            .get_mut(&id)
            .ok_or(StoreError::RegistrationNotFound(id))?;
        registration.last_heartbeat_at = now;
        Ok(())
    }

    /// Removes the registration and hands its claimed jobs back to the queue.
    pub fn deregister(&mut self, id: RegistrationId) -> Result<Registration, StoreError> {
        let registration = self
            .processes
            .remove(&id)
            .ok_or(StoreError::RegistrationNotFound(id))?;
        let released = self.release_claims_of(id);
        if released > 0 {
            info!(
                "Released {released} job(s) claimed by {}",
                registration.identity.name
            );
        }
        Ok(registration)
    }

    /// Removes every registration left by `pid` on `hostname`.
    pub fn deregister_pid(&mut self, hostname: &str, pid: u32) -> Vec<Registration> {
        let ids: Vec<RegistrationId> = self
            .processes
            .values()
            .filter(|r| r.identity.pid == pid && r.identity.hostname == hostname)
            .map(|r| r.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.deregister(id).ok())
            .collect()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.processes.values().cloned().collect()
    }

    /// Removes registrations whose heartbeat is older than `threshold`.
    pub fn prune_stale(&mut self, threshold: Duration, now: DateTime<Utc>) -> Vec<Registration> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let stale: Vec<RegistrationId> = self
            .processes
            .values()
            .filter(|r| now.signed_duration_since(r.last_heartbeat_at) > threshold)
            .map(|r| r.id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.deregister(id).ok())
            .collect()
    }

    pub fn enqueue(&mut self, job: NewJob, now: DateTime<Utc>) -> JobId {
        self.next_job += 1;
        let id = self.next_job;
        let state = match job.scheduled_at {
            Some(at) if at > now => JobState::Scheduled,
            _ => JobState::Ready,
        };
        self.jobs.insert(
            id,
            Job {
                id,
                queue: job.queue,
                command: job.command,
                priority: job.priority,
                state,
                created_at: now,
                scheduled_at: job.scheduled_at,
                claimed_by: None,
                claimed_at: None,
                finished_at: None,
                error: None,
            },
        );
        id
    }

    /// Claims up to `limit` ready jobs, walking `queues` in order and each queue
    /// by priority then id.
    pub fn claim_jobs(
        &mut self,
        queues: &[String],
        limit: usize,
        claimant: RegistrationId,
        now: DateTime<Utc>,
    ) -> Vec<Job> {
        let mut picked: Vec<JobId> = Vec::new();
        let mut seen: HashSet<JobId> = HashSet::new();

        for selector in queues {
            if picked.len() >= limit {
                break;
            }
            let mut candidates: Vec<&Job> = self
                .jobs
                .values()
                .filter(|job| job.state == JobState::Ready)
                .filter(|job| queue_matches(selector, &job.queue))
                .filter(|job| !seen.contains(&job.id))
                .collect();
            candidates.sort_by_key(|job| (job.priority, job.id));

            for job in candidates.into_iter().take(limit - picked.len()) {
                seen.insert(job.id);
                picked.push(job.id);
            }
        }

        let mut claimed = Vec::with_capacity(picked.len());
        for id in picked {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Claimed;
                job.claimed_by = Some(claimant);
                job.claimed_at = Some(now);
                claimed.push(job.clone());
            }
        }
        claimed
    }

    pub fn complete_job(
        &mut self,
        id: JobId,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        match outcome {
            JobOutcome::Finished => {
                job.state = JobState::Finished;
                job.error = None;
            }
            JobOutcome::Failed(error) => {
                job.state = JobState::Failed;
                job.error = Some(error);
            }
        }
        job.finished_at = Some(now);
        Ok(())
    }

    /// Moves up to `limit` due scheduled jobs to `Ready`, oldest first.
    pub fn release_due_jobs(
        &mut self,
        queues: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> usize {
        let mut due: Vec<(DateTime<Utc>, i32, JobId)> = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Scheduled && selected(queues, &job.queue))
            .filter_map(|job| {
                job.scheduled_at
                    .filter(|at| *at <= now)
                    .map(|at| (at, job.priority, job.id))
            })
            .collect();
        due.sort();
        due.truncate(limit);

        for (_, _, id) in &due {
            if let Some(job) = self.jobs.get_mut(id) {
                job.state = JobState::Ready;
            }
        }
        due.len()
    }

    /// Enqueues the occurrence unless it was enqueued before. The job keeps
    /// `run_at` as its `scheduled_at`.
    ///
    /// Run keys older than [`RECURRING_RUN_RETENTION`] are forgotten, and
    /// occurrences that old are refused since they can no longer be deduplicated.
    pub fn enqueue_recurring(&mut self, occurrence: Occurrence, now: DateTime<Utc>) -> Option<JobId> {
        let horizon = now - RECURRING_RUN_RETENTION;
        self.recurring_runs.retain(|(_, run_at)| *run_at >= horizon);
        if occurrence.run_at < horizon {
            debug!(
                "Dropping '{}' for {}: older than the retention horizon",
                occurrence.task, occurrence.run_at
            );
            return None;
        }
        if !self
            .recurring_runs
            .insert((occurrence.task, occurrence.run_at))
        {
            return None;
        }
        let job = occurrence.job.scheduled_at(occurrence.run_at);
        Some(self.enqueue(job, now))
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.values().cloned().collect()
    }

    fn release_claims_of(&mut self, id: RegistrationId) -> usize {
        let mut released = 0;
        for job in self.jobs.values_mut() {
            if job.state == JobState::Claimed && job.claimed_by == Some(id) {
                job.state = JobState::Ready;
                job.claimed_by = None;
                job.claimed_at = None;
                released += 1;
            }
        }
        released
    }
}

/// Persistence collaborator used by every process kind.
pub trait Store: Send + Sync {
    fn register(
        &self,
        identity: &ProcessIdentity,
        supervisor: Option<RegistrationId>,
    ) -> Result<RegistrationId, StoreError>;

    fn heartbeat(&self, id: RegistrationId) -> Result<(), StoreError>;

    fn deregister(&self, id: RegistrationId) -> Result<(), StoreError>;

    /// Removes whatever registrations process `pid` on this host left behind.
    fn deregister_pid(&self, pid: u32) -> Result<Vec<Registration>, StoreError>;

    fn registrations(&self) -> Result<Vec<Registration>, StoreError>;

    fn prune_stale(&self, threshold: Duration) -> Result<Vec<Registration>, StoreError>;

    fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError>;

    fn claim_jobs(
        &self,
        queues: &[String],
        limit: usize,
        claimant: RegistrationId,
    ) -> Result<Vec<Job>, StoreError>;

    fn complete_job(&self, id: JobId, outcome: JobOutcome) -> Result<(), StoreError>;

    fn release_due_jobs(&self, queues: &[String], limit: usize) -> Result<usize, StoreError>;

    /// Returns `None` when the occurrence was already enqueued by someone.
    fn enqueue_recurring(&self, occurrence: Occurrence) -> Result<Option<JobId>, StoreError>;

    fn jobs(&self) -> Result<Vec<Job>, StoreError>;
}

/// Atomic access to a [`StoreState`]. Every implementor is a [`Store`].
pub trait Transact: Send + Sync {
    /// Runs `f` against the state and persists whatever it changed.
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError>;

    /// Runs `f` against a consistent view of the state.
    fn inspect<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T, StoreError>;
}

impl<S: Transact> Store for S {
    fn register(
        &self,
        identity: &ProcessIdentity,
        supervisor: Option<RegistrationId>,
    ) -> Result<RegistrationId, StoreError> {
        self.transact(|state| Ok(state.register(identity, supervisor, Utc::now())))
    }

    fn heartbeat(&self, id: RegistrationId) -> Result<(), StoreError> {
        self.transact(|state| state.heartbeat(id, Utc::now()))
    }

    fn deregister(&self, id: RegistrationId) -> Result<(), StoreError> {
        self.transact(|state| state.deregister(id).map(|_| ()))
    }

    fn deregister_pid(&self, pid: u32) -> Result<Vec<Registration>, StoreError> {
        let hostname = crate::process::hostname();
        self.transact(|state| Ok(state.deregister_pid(&hostname, pid)))
    }

    fn registrations(&self) -> Result<Vec<Registration>, StoreError> {
        self.inspect(StoreState::registrations)
    }

    fn prune_stale(&self, threshold: Duration) -> Result<Vec<Registration>, StoreError> {
        self.transact(|state| Ok(state.prune_stale(threshold, Utc::now())))
    }

    fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        self.transact(|state| Ok(state.enqueue(job, Utc::now())))
    }

    fn claim_jobs(
        &self,
        queues: &[String],
        limit: usize,
        claimant: RegistrationId,
    ) -> Result<Vec<Job>, StoreError> {
        self.transact(|state| Ok(state.claim_jobs(queues, limit, claimant, Utc::now())))
    }

    fn complete_job(&self, id: JobId, outcome: JobOutcome) -> Result<(), StoreError> {
        self.transact(|state| state.complete_job(id, outcome, Utc::now()))
    }

    fn release_due_jobs(&self, queues: &[String], limit: usize) -> Result<usize, StoreError> {
        self.transact(|state| Ok(state.release_due_jobs(queues, limit, Utc::now())))
    }

    fn enqueue_recurring(&self, occurrence: Occurrence) -> Result<Option<JobId>, StoreError> {
        self.transact(|state| Ok(state.enqueue_recurring(occurrence, Utc::now())))
    }

    fn jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.inspect(StoreState::jobs)
    }
}

/// In-process store. Not shared across `fork`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transact for MemoryStore {
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock()?;
        f(&mut state)
    }

    fn inspect<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T, StoreError> {
        let state = self.state.lock()?;
        Ok(f(&state))
    }
}

/// Store kept in `<dir>/store.json`, serialised through `<dir>/store.lock`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl FileStore {
    /// Opens (creating if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("Using store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn lock(&self) -> Result<LockGuard, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        FileExt::lock_exclusive(&file)?;
        Ok(LockGuard(file))
    }

    fn load(&self) -> Result<StoreState, StoreError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(StoreState::default());
        }
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(StoreState::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, state: &StoreState) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!("{STATE_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        fs::rename(tmp, self.state_path())?;
        Ok(())
    }
}

impl Transact for FileStore {
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock()?;
        let mut state = self.load()?;
        let value = f(&mut state)?;
        self.save(&state)?;
        Ok(value)
    }

    fn inspect<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T, StoreError> {
        let _lock = self.lock()?;
        let state = self.load()?;
        Ok(f(&state))
    }
}
