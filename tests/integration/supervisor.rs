#[path = "common/mod.rs"]
mod common;

use std::{collections::BTreeSet, path::Path, sync::Arc, time::Duration};

use chrono::Utc;
use common::{
    fork_process, terminate_and_wait, wait_for_jobs, wait_for_lines, wait_for_registrations,
};
use forkq::{
    config::{DispatcherConfig, SchedulerConfig, Topology, WorkerConfig},
    hooks::HookRegistry,
    process::ProcessKind,
    recurring::RecurringTask,
    signals,
    store::{FileStore, JobState, NewJob, Store},
    supervisor::{Supervisor, SupervisorSettings},
    test_utils::fork_lock,
};
use nix::unistd::Pid;
use tempfile::tempdir;

fn run_supervisor(store_dir: &Path, topology: Topology, settings: SupervisorSettings) -> Pid {
    let store_dir = store_dir.to_path_buf();
    fork_process(move || {
        let store = match FileStore::open(&store_dir) {
            Ok(store) => Arc::new(store),
            Err(_) => return 2,
        };
        match Supervisor::new(topology, settings, store, HookRegistry::new()).start() {
            Ok(exit) => exit.code(),
            Err(_) => 3,
        }
    })
}

fn fast_settings() -> SupervisorSettings {
    SupervisorSettings::default().polling_interval(Duration::from_millis(100))
}

fn fast_worker(queue: &str) -> WorkerConfig {
    WorkerConfig::new([queue]).polling_interval(Duration::from_millis(50))
}

#[test]
fn killed_worker_is_replaced() {
    let _fork = fork_lock();
    let temp = tempdir().expect("failed to create tempdir");
    let store_dir = temp.path().join("store");
    let store = FileStore::open(&store_dir).expect("open store");

    let pid = run_supervisor(
        &store_dir,
        Topology::empty().worker(fast_worker("default")),
        fast_settings(),
    );

    let registrations = wait_for_registrations(&store, 2);
    let worker = registrations
        .iter()
        .find(|r| r.identity.kind() == ProcessKind::Worker)
        .expect("worker registered")
        .clone();

    signals::kill(Pid::from_raw(worker.identity.pid as i32)).expect("kill worker");

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    let replacement = loop {
        let workers: Vec<_> = store
            .registrations()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.identity.kind() == ProcessKind::Worker)
            .collect();
        if workers.len() == 1 && workers[0].identity.pid != worker.identity.pid {
            break workers[0].clone();
        }
        assert!(std::time::Instant::now() < deadline, "worker was not replaced");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(replacement.supervisor, worker.supervisor);

    assert_eq!(terminate_and_wait(pid), 0);
    wait_for_registrations(&store, 0);
}

#[test]
fn scheduled_job_is_dispatched_and_run() {
    let _fork = fork_lock();
    let temp = tempdir().expect("failed to create tempdir");
    let store_dir = temp.path().join("store");
    let marker = temp.path().join("marker");
    let store = FileStore::open(&store_dir).expect("open store");

    let topology = Topology::empty()
        .worker(fast_worker("reports"))
        .dispatcher(DispatcherConfig::new(10).polling_interval(Duration::from_millis(100)));
    let pid = run_supervisor(&store_dir, topology, fast_settings());
    wait_for_registrations(&store, 3);

    let job = store
        .enqueue(
            NewJob::new(
                "reports",
                format!("echo \"$FORKQ_QUEUE:$FORKQ_JOB_ID\" >> {}", marker.display()),
            )
            .scheduled_at(Utc::now() + chrono::Duration::milliseconds(500)),
        )
        .expect("enqueue");
    assert_eq!(store.jobs().unwrap()[0].state, JobState::Scheduled);

    let lines = wait_for_lines(&marker, 1);
    assert_eq!(lines, vec![format!("reports:{job}")]);
    wait_for_jobs(&store, |jobs| jobs[0].state == JobState::Finished);

    assert_eq!(terminate_and_wait(pid), 0);
}

#[test]
fn competing_schedulers_enqueue_each_occurrence_once() {
    let _fork = fork_lock();
    let temp = tempdir().expect("failed to create tempdir");
    let store_dir = temp.path().join("store");
    let store = FileStore::open(&store_dir).expect("open store");

    let topology = || {
        Topology::empty()
            .scheduler(SchedulerConfig::default().polling_interval(Duration::from_millis(100)))
            .recurring(
                RecurringTask::new("every_second", "* * * * * *", "true")
                    .expect("valid cron")
                    .queue("periodic"),
            )
    };
    let first = run_supervisor(&store_dir, topology(), fast_settings());
    let second = run_supervisor(&store_dir, topology(), fast_settings());
    wait_for_registrations(&store, 4);

    let jobs = wait_for_jobs(&store, |jobs| jobs.len() >= 3);

    assert_eq!(terminate_and_wait(first), 0);
    assert_eq!(terminate_and_wait(second), 0);

    let jobs = store.jobs().unwrap_or(jobs);
    let run_times: BTreeSet<_> = jobs.iter().filter_map(|job| job.scheduled_at).collect();
    assert_eq!(run_times.len(), jobs.len(), "duplicate occurrences: {jobs:?}");
    assert!(jobs.iter().all(|job| job.queue == "periodic"));
}

#[test]
fn shutdown_timeout_kills_stuck_children_and_releases_their_jobs() {
    let _fork = fork_lock();
    let temp = tempdir().expect("failed to create tempdir");
    let store_dir = temp.path().join("store");
    let store = FileStore::open(&store_dir).expect("open store");

    let job = store
        .enqueue(NewJob::new("slow", "sleep 30"))
        .expect("enqueue");
    let pid = run_supervisor(
        &store_dir,
        Topology::empty().worker(fast_worker("slow")),
        fast_settings().shutdown_timeout(Duration::from_millis(500)),
    );

    wait_for_jobs(&store, |jobs| jobs[0].state == JobState::Claimed);

    let started = std::time::Instant::now();
    assert_eq!(terminate_and_wait(pid), 0);
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(store.registrations().unwrap().is_empty());
    let jobs = store.jobs().unwrap();
    assert_eq!(jobs[0].id, job);
    assert_eq!(jobs[0].state, JobState::Ready);
    assert_eq!(jobs[0].claimed_by, None);
}

#[test]
fn unexpected_exit_without_restart_is_cleaned_up() {
    let _fork = fork_lock();
    let temp = tempdir().expect("failed to create tempdir");
    let store_dir = temp.path().join("store");
    let store = FileStore::open(&store_dir).expect("open store");

    let pid = run_supervisor(
        &store_dir,
        Topology::empty().worker(fast_worker("default")),
        fast_settings().restart_children(false),
    );
    let registrations = wait_for_registrations(&store, 2);
    let worker = registrations
        .iter()
        .find(|r| r.identity.kind() == ProcessKind::Worker)
        .expect("worker registered");

    signals::kill(Pid::from_raw(worker.identity.pid as i32)).expect("kill worker");
    let left = wait_for_registrations(&store, 1);
    assert_eq!(left[0].identity.kind(), ProcessKind::Supervisor);

    assert_eq!(terminate_and_wait(pid), 0);
    wait_for_registrations(&store, 0);
}
