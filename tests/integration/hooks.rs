#[path = "common/mod.rs"]
mod common;

use std::{path::Path, sync::Arc, time::Duration};

use common::{
    append_line, fork_process, hook_label, read_lines, terminate_and_wait,
    wait_for_registrations,
};
use forkq::{
    config::{DispatcherConfig, SchedulerConfig, Topology, WorkerConfig},
    hooks::{HookRegistry, root_message},
    process::{LifecyclePhase, ProcessKind},
    store::{FileStore, Store},
    supervisor::{Supervisor, SupervisorSettings},
    test_utils::fork_lock,
};
use tempfile::tempdir;

const PHASES: [LifecyclePhase; 3] = [
    LifecyclePhase::Start,
    LifecyclePhase::Stop,
    LifecyclePhase::Exit,
];

fn recording_hooks(log: &Path) -> HookRegistry {
    let hooks = HookRegistry::new();
    for kind in ProcessKind::ALL {
        for phase in PHASES {
            let log = log.to_path_buf();
            hooks.register(kind, phase, move |identity| {
                append_line(&log, &hook_label(identity, phase))?;
                Ok(())
            });
        }
    }
    hooks
}

fn two_queue_topology() -> Topology {
    Topology::empty()
        .worker(WorkerConfig::new(["first_queue"]).polling_interval(Duration::from_millis(50)))
        .worker(WorkerConfig::new(["second_queue"]).polling_interval(Duration::from_millis(50)))
        .dispatcher(DispatcherConfig::new(100).polling_interval(Duration::from_millis(100)))
        .scheduler(SchedulerConfig::default().polling_interval(Duration::from_millis(100)))
}

fn fast_settings() -> SupervisorSettings {
    SupervisorSettings::default().polling_interval(Duration::from_millis(100))
}

fn run_supervisor(
    store_dir: &Path,
    topology: Topology,
    hooks: HookRegistry,
) -> nix::unistd::Pid {
    let store_dir = store_dir.to_path_buf();
    fork_process(move || {
        let store = match FileStore::open(&store_dir) {
            Ok(store) => Arc::new(store),
            Err(_) => return 2,
        };
        match Supervisor::new(topology, fast_settings(), store, hooks).start() {
            Ok(exit) => exit.code(),
            Err(_) => 3,
        }
    })
}

#[test]
fn every_process_runs_each_lifecycle_phase_once() {
    let _fork = fork_lock();
    let temp = tempdir().expect("failed to create tempdir");
    let log = temp.path().join("hooks.log");
    let store_dir = temp.path().join("store");
    let store = FileStore::open(&store_dir).expect("open store");

    let pid = run_supervisor(&store_dir, two_queue_topology(), recording_hooks(&log));

    let registrations = wait_for_registrations(&store, 5);
    let supervisor = registrations
        .iter()
        .find(|r| r.identity.kind() == ProcessKind::Supervisor)
        .expect("supervisor registered");
    assert!(
        registrations
            .iter()
            .filter(|r| r.id != supervisor.id)
            .all(|r| r.supervisor == Some(supervisor.id))
    );

    assert_eq!(terminate_and_wait(pid), 0);
    wait_for_registrations(&store, 0);

    let lines = read_lines(&log);
    assert_eq!(lines.first().map(String::as_str), Some("supervisor_start"));
    assert_eq!(lines.last().map(String::as_str), Some("supervisor_exit"));

    let mut sorted = lines.clone();
    sorted.sort();
    let mut expected = vec![
        "supervisor_start",
        "supervisor_stop",
        "supervisor_exit",
        "worker_first_queue_start",
        "worker_first_queue_stop",
        "worker_first_queue_exit",
        "worker_second_queue_start",
        "worker_second_queue_stop",
        "worker_second_queue_exit",
        "dispatcher_100_start",
        "dispatcher_100_stop",
        "dispatcher_100_exit",
        "scheduler_start",
        "scheduler_stop",
        "scheduler_exit",
    ];
    expected.sort();
    assert_eq!(sorted, expected);

    for prefix in [
        "supervisor",
        "worker_first_queue",
        "worker_second_queue",
        "dispatcher_100",
        "scheduler",
    ] {
        let phases: Vec<&str> = lines
            .iter()
            .filter_map(|line| line.strip_prefix(prefix)?.strip_prefix('_'))
            .collect();
        assert_eq!(phases, vec!["start", "stop", "exit"], "order for {prefix}");
    }
}

#[test]
fn failing_start_hook_is_reported_once_and_lifecycle_completes() {
    let _fork = fork_lock();
    let temp = tempdir().expect("failed to create tempdir");
    let log = temp.path().join("hooks.log");
    let errors = temp.path().join("errors.log");
    let store_dir = temp.path().join("store");
    let store = FileStore::open(&store_dir).expect("open store");

    let hooks = HookRegistry::new();
    hooks.on_start(ProcessKind::Supervisor, |_| Err("everything is broken".into()));
    for phase in PHASES {
        let log = log.clone();
        hooks.register(ProcessKind::Supervisor, phase, move |identity| {
            append_line(&log, &hook_label(identity, phase))?;
            Ok(())
        });
    }
    let sink_log = errors.clone();
    hooks.on_thread_error(move |err| {
        let _ = append_line(&sink_log, &root_message(err));
    });

    let pid = run_supervisor(&store_dir, Topology::default(), hooks);

    wait_for_registrations(&store, 4);
    assert_eq!(terminate_and_wait(pid), 0);
    wait_for_registrations(&store, 0);

    assert_eq!(read_lines(&errors), vec!["everything is broken"]);
    assert_eq!(
        read_lines(&log),
        vec!["supervisor_start", "supervisor_stop", "supervisor_exit"]
    );
}

#[test]
fn panicking_worker_hooks_do_not_stop_the_worker_lifecycle() {
    let _fork = fork_lock();
    let temp = tempdir().expect("failed to create tempdir");
    let log = temp.path().join("hooks.log");
    let errors = temp.path().join("errors.log");
    let store_dir = temp.path().join("store");
    let store = FileStore::open(&store_dir).expect("open store");

    let hooks = HookRegistry::new();
    for phase in PHASES {
        hooks.register(ProcessKind::Worker, phase, move |_| panic!("worker {phase} hook exploded"));
        let log = log.clone();
        hooks.register(ProcessKind::Worker, phase, move |identity| {
            append_line(&log, &hook_label(identity, phase))?;
            Ok(())
        });
    }
    let sink_log = errors.clone();
    hooks.on_thread_error(move |err| {
        let _ = append_line(&sink_log, &root_message(err));
    });

    let topology = Topology::empty().worker(WorkerConfig::new(["default"]));
    let pid = run_supervisor(&store_dir, topology, hooks);

    wait_for_registrations(&store, 2);
    assert_eq!(terminate_and_wait(pid), 0);

    assert_eq!(
        read_lines(&log),
        vec![
            "worker_default_start",
            "worker_default_stop",
            "worker_default_exit"
        ]
    );
    assert_eq!(
        read_lines(&errors),
        vec![
            "worker start hook exploded",
            "worker stop hook exploded",
            "worker exit hook exploded",
        ]
    );
}
