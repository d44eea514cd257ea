//! The supervisor forks one OS process per configured unit and keeps them alive.
use std::{
    collections::HashMap,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::wait::{WaitPidFlag, WaitStatus, waitpid},
    unistd::{ForkResult, Pid, fork},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, DispatcherConfig, SchedulerConfig, Topology, WorkerConfig},
    dispatcher::Dispatcher,
    error::ProcessError,
    hooks::HookRegistry,
    process::{
        DEFAULT_HEARTBEAT_INTERVAL, Process, ProcessDetails, ProcessExit, ProcessIdentity,
        ProcessKind, ProcessRuntime, RunContext,
    },
    scheduler::Scheduler,
    signals::{self, Shutdown},
    store::{RegistrationId, Store},
    worker::Worker,
};

/// How often children are polled while the supervisor waits for them to exit.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Timing and restart behaviour of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub polling_interval: Duration,
    /// SIGKILL children still alive this long after SIGTERM. `None` waits forever.
    pub shutdown_timeout: Option<Duration>,
    pub restart_children: bool,
    /// Heartbeat cadence of the supervisor and every child.
    pub heartbeat_interval: Duration,
    /// Registrations without a heartbeat for this long are pruned.
    pub process_alive_threshold: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            shutdown_timeout: None,
            restart_children: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            process_alive_threshold: Duration::from_secs(5 * 60),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            polling_interval: config.supervisor.polling_interval,
            shutdown_timeout: config.supervisor.shutdown_timeout,
            restart_children: config.supervisor.restart_children,
            heartbeat_interval: config.heartbeat_interval,
            process_alive_threshold: config.process_alive_threshold,
        }
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn restart_children(mut self, restart: bool) -> Self {
        self.restart_children = restart;
        self
    }
}

/// What a forked child runs.
#[derive(Debug, Clone)]
enum ChildUnit {
    Worker(WorkerConfig),
    Dispatcher(DispatcherConfig),
    Scheduler(SchedulerConfig),
}

impl ChildUnit {
    fn kind(&self) -> ProcessKind {
        match self {
            ChildUnit::Worker(_) => ProcessKind::Worker,
            ChildUnit::Dispatcher(_) => ProcessKind::Dispatcher,
            ChildUnit::Scheduler(_) => ProcessKind::Scheduler,
        }
    }
}

fn describe_exit(status: &WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exit code {code}"),
        WaitStatus::Signaled(_, signal, _) => format!("signal {signal}"),
        other => format!("{other:?}"),
    }
}

pub struct Supervisor {
    identity: ProcessIdentity,
    topology: Topology,
    settings: SupervisorSettings,
    store: Arc<dyn Store>,
    hooks: HookRegistry,
    children: HashMap<Pid, ChildUnit>,
}

impl Supervisor {
    pub fn new(
        topology: Topology,
        settings: SupervisorSettings,
        store: Arc<dyn Store>,
        hooks: HookRegistry,
    ) -> Self {
        Self {
            identity: ProcessIdentity::current(ProcessDetails::Supervisor),
            topology,
            settings,
            store,
            hooks,
            children: HashMap::new(),
        }
    }

    /// Runs the supervisor in the foreground until SIGTERM or SIGINT.
    ///
    /// Fails only when the signal handlers cannot be installed; everything
    /// else ends up in the returned [`ProcessExit`] and the error sink.
    pub fn start(self) -> Result<ProcessExit, ProcessError> {
        signals::install_termination_handlers().map_err(|source| {
            ProcessError::SupervisionError {
                kind: ProcessKind::Supervisor,
                source,
            }
        })?;

        let hooks = self.hooks.clone();
        let store = Arc::clone(&self.store);
        let heartbeat_interval = self.settings.heartbeat_interval;
        Ok(ProcessRuntime::new(self, hooks, store)
            .with_shutdown(Shutdown::from_signals())
            .heartbeat_interval(heartbeat_interval)
            .launch())
    }

    /// PIDs of the children currently alive.
    pub fn children(&self) -> Vec<u32> {
        self.children
            .keys()
            .map(|pid| pid.as_raw() as u32)
            .collect()
    }

    fn planned_units(&self) -> Vec<ChildUnit> {
        let workers = self.topology.workers.iter().flat_map(|worker| {
            std::iter::repeat_n(ChildUnit::Worker(worker.clone()), worker.processes)
        });
        let dispatchers = self
            .topology
            .dispatchers
            .iter()
            .cloned()
            .map(ChildUnit::Dispatcher);
        let scheduler = self.topology.scheduler.clone().map(ChildUnit::Scheduler);

        workers.chain(dispatchers).chain(scheduler).collect()
    }

    fn spawn(&mut self, unit: ChildUnit, supervisor: RegistrationId) -> Result<Pid, ProcessError> {
        let kind = unit.kind();
        // SAFETY: the supervisor is single threaded, so the child only inherits
        // the thread calling fork and no lock can be held by a vanished thread.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                info!("Forked {kind} (PID {child})");
                self.children.insert(child, unit);
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                let code = self.run_child(&unit, supervisor);
                std::process::exit(code)
            }
            Err(source) => {
                error!("Failed to fork {kind}: {source}");
                Err(ProcessError::SupervisionError { kind, source })
            }
        }
    }

    /// Body of a forked child. Never returns to the supervisor loop.
    fn run_child(&self, unit: &ChildUnit, supervisor: RegistrationId) -> i32 {
        let exit = match unit {
            ChildUnit::Worker(config) => self.launch_child(Worker::new(config), supervisor),
            ChildUnit::Dispatcher(config) => {
                self.launch_child(Dispatcher::new(config), supervisor)
            }
            ChildUnit::Scheduler(config) => self.launch_child(
                Scheduler::new(config, self.topology.recurring.clone()),
                supervisor,
            ),
        };
        exit.code()
    }

    fn launch_child<P: Process>(&self, process: P, supervisor: RegistrationId) -> ProcessExit {
        ProcessRuntime::new(process, self.hooks.clone(), Arc::clone(&self.store))
            .with_shutdown(Shutdown::from_signals())
            .supervised_by(supervisor)
            .heartbeat_interval(self.settings.heartbeat_interval)
            .launch()
    }

    /// Reaps children that exited and returns them with their exit status.
    fn reap(&mut self, ctx: &RunContext<'_>) -> Vec<(Pid, ChildUnit, WaitStatus)> {
        let mut exited = Vec::new();
        let pids: Vec<Pid> = self.children.keys().copied().collect();
        for pid in pids {
            let status = loop {
                match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Err(Errno::EINTR) => continue,
                    other => break other,
                }
            };
            match status {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    if let Some(unit) = self.children.remove(&pid) {
                        self.clean_up_after(pid, ctx);
                        exited.push((pid, unit, status));
                    }
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => {
                    debug!("PID {pid} was already reaped");
                    if let Some(unit) = self.children.remove(&pid) {
                        self.clean_up_after(pid, ctx);
                        exited.push((pid, unit, WaitStatus::StillAlive));
                    }
                }
                Err(source) => {
                    let kind = self.children.get(&pid).map_or(ProcessKind::Supervisor, ChildUnit::kind);
                    ctx.report(&ProcessError::SupervisionError { kind, source });
                }
            }
        }
        exited
    }

    /// Removes registrations a dead child could not remove itself.
    fn clean_up_after(&self, pid: Pid, ctx: &RunContext<'_>) {
        match ctx.store().deregister_pid(pid.as_raw() as u32) {
            Ok(left) if !left.is_empty() => {
                warn!("Removed {} registration(s) left by PID {pid}", left.len());
            }
            Ok(_) => {}
            Err(source) => ctx.report(&ProcessError::WorkLoopError {
                kind: ProcessKind::Supervisor,
                source,
            }),
        }
    }

    fn replace_exited(&mut self, ctx: &RunContext<'_>) {
        for (pid, unit, status) in self.reap(ctx) {
            let kind = unit.kind();
            warn!("{kind} (PID {pid}) exited unexpectedly: {}", describe_exit(&status));

            if !self.settings.restart_children || ctx.shutdown().is_requested() {
                continue;
            }
            match self.spawn(unit, ctx.registration()) {
                Ok(child) => info!("Replaced {kind} (PID {pid}) with PID {child}"),
                Err(err) => ctx.report(&err),
            }
        }
    }

    fn prune_stale(&self, ctx: &RunContext<'_>) {
        match ctx.store().prune_stale(self.settings.process_alive_threshold) {
            Ok(pruned) => {
                for registration in pruned {
                    warn!(
                        "Pruned {} (no heartbeat since {})",
                        registration.identity.name, registration.last_heartbeat_at
                    );
                }
            }
            Err(source) => ctx.report(&ProcessError::WorkLoopError {
                kind: ProcessKind::Supervisor,
                source,
            }),
        }
    }

    /// Sends SIGTERM to every child and blocks until all have exited, heartbeating
    /// while it waits.
    fn stop_children(&mut self, ctx: &mut RunContext<'_>) {
        if self.children.is_empty() {
            return;
        }
        info!("Stopping {} child process(es)", self.children.len());
        for (pid, unit) in &self.children {
            debug!("Sending SIGTERM to {} (PID {pid})", unit.kind());
            if let Err(source) = signals::terminate(*pid) {
                ctx.report(&ProcessError::SupervisionError {
                    kind: unit.kind(),
                    source,
                });
            }
        }

        let deadline = self.settings.shutdown_timeout.map(|t| Instant::now() + t);
        let mut escalated = false;
        loop {
            for (pid, unit, status) in self.reap(ctx) {
                debug!("{} (PID {pid}) exited with {}", unit.kind(), describe_exit(&status));
            }
            if self.children.is_empty() {
                break;
            }
            if let Some(deadline) = deadline
                && !escalated
                && Instant::now() >= deadline
            {
                warn!(
                    "{} child process(es) still running after shutdown timeout, sending SIGKILL",
                    self.children.len()
                );
                for pid in self.children.keys() {
                    if let Err(err) = signals::kill(*pid) {
                        warn!("Failed to SIGKILL PID {pid}: {err}");
                    }
                }
                escalated = true;
            }
            ctx.heartbeat_if_due();
            thread::sleep(REAP_INTERVAL);
        }
        info!("All child processes exited");
    }
}

impl Process for Supervisor {
    fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), ProcessError> {
        let registration = ctx.registration();
        for unit in self.planned_units() {
            if let Err(err) = self.spawn(unit, registration) {
                error!(
                    "Startup failed, stopping {} spawned child process(es)",
                    self.children.len()
                );
                self.stop_children(ctx);
                return Err(err);
            }
        }
        info!("Supervising {} child process(es)", self.children.len());

        while ctx.running() {
            self.replace_exited(ctx);
            self.prune_stale(ctx);
            ctx.idle(self.settings.polling_interval);
        }

        self.stop_children(ctx);
        Ok(())
    }
}
