#![allow(dead_code)]

use std::{
    fs::{self, OpenOptions},
    io::Write,
    panic::{self, AssertUnwindSafe},
    path::Path,
    thread,
    time::{Duration, Instant},
};

use forkq::{
    process::{LifecyclePhase, ProcessDetails, ProcessIdentity},
    signals,
    store::{Job, Registration, Store},
};
use nix::{
    sys::wait::{WaitPidFlag, WaitStatus, waitpid},
    unistd::{ForkResult, Pid, fork},
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const POLL: Duration = Duration::from_millis(50);

/// Appends one line. Each line is a single `write` on an `O_APPEND` file, so
/// lines from concurrent processes never interleave.
pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(format!("{line}\n").as_bytes())
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let lines = read_lines(path);
        if lines.len() >= expected {
            return lines;
        }

        if Instant::now() >= deadline {
            panic!(
                "Timed out waiting for {expected} lines in {:?}, got {lines:?}",
                path
            );
        }

        thread::sleep(POLL);
    }
}

/// Label of a hook call: `<kind>[_<context>]_<phase>`.
pub fn hook_label(identity: &ProcessIdentity, phase: LifecyclePhase) -> String {
    match &identity.details {
        ProcessDetails::Worker { queues } => format!("worker_{}_{phase}", queues.join("_")),
        ProcessDetails::Dispatcher { batch_size } => format!("dispatcher_{batch_size}_{phase}"),
        details => format!("{}_{phase}", details.kind()),
    }
}

pub fn wait_for_registrations(store: &dyn Store, expected: usize) -> Vec<Registration> {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let registrations = store.registrations().unwrap_or_default();
        if registrations.len() == expected {
            return registrations;
        }

        if Instant::now() >= deadline {
            panic!(
                "Timed out waiting for {expected} registrations, got {}",
                registrations.len()
            );
        }

        thread::sleep(POLL);
    }
}

pub fn wait_for_jobs(store: &dyn Store, done: impl Fn(&[Job]) -> bool) -> Vec<Job> {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let jobs = store.jobs().unwrap_or_default();
        if done(&jobs) {
            return jobs;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for jobs, last saw {jobs:?}");
        }

        thread::sleep(POLL);
    }
}

/// Runs `body` in a forked child and returns its PID. The child exits with the
/// returned status, or 101 if `body` panicked.
///
/// Callers hold [`forkq::test_utils::fork_lock`] so no other test thread forks
/// at the same time.
pub fn fork_process(body: impl FnOnce() -> i32) -> Pid {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            let code = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(101);
            unsafe { libc::_exit(code) }
        }
        Err(err) => panic!("fork failed: {err}"),
    }
}

/// Waits for `pid` to exit and returns its exit code.
pub fn wait_for_exit(pid: Pid) -> i32 {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, signal, _)) => panic!("{pid} killed by {signal}"),
            Ok(_) => {}
            Err(err) => panic!("waitpid({pid}) failed: {err}"),
        }

        if Instant::now() >= deadline {
            let _ = signals::kill(pid);
            panic!("Timed out waiting for {pid} to exit");
        }

        thread::sleep(POLL);
    }
}

/// Sends SIGTERM to `pid` and returns its exit code once it is gone.
pub fn terminate_and_wait(pid: Pid) -> i32 {
    signals::terminate(pid).expect("failed to send SIGTERM");
    wait_for_exit(pid)
}
