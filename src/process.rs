//! Process identities and the lifecycle shared by every supervised process.
//!
//! Every process kind runs through [`ProcessRuntime::launch`], which drives the
//! `Created -> Running -> Draining -> Stopped -> Exited` state machine, fires the
//! lifecycle hooks registered for the kind and keeps the store registration in
//! sync. The kind-specific behaviour lives behind the [`Process`] trait.
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::{
    error::ProcessError,
    hooks::HookRegistry,
    signals::Shutdown,
    store::{RegistrationId, Store},
};

/// Heartbeat cadence used when the runtime is not told otherwise.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// The four kinds of supervised process.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessKind {
    Supervisor,
    Worker,
    Dispatcher,
    Scheduler,
}

impl ProcessKind {
    /// All kinds, in the order the supervisor reports them.
    pub const ALL: [ProcessKind; 4] = [
        ProcessKind::Supervisor,
        ProcessKind::Worker,
        ProcessKind::Dispatcher,
        ProcessKind::Scheduler,
    ];
}

/// Points in a process's life at which hooks run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecyclePhase {
    Start,
    Stop,
    Exit,
}

/// Kind-specific attributes handed to hooks alongside the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessDetails {
    Supervisor,
    Worker {
        /// Queue selectors the worker claims from, in priority order.
        queues: Vec<String>,
    },
    Dispatcher {
        /// Maximum number of jobs released per poll.
        batch_size: usize,
    },
    Scheduler,
}

impl ProcessDetails {
    pub fn kind(&self) -> ProcessKind {
        match self {
            ProcessDetails::Supervisor => ProcessKind::Supervisor,
            ProcessDetails::Worker { .. } => ProcessKind::Worker,
            ProcessDetails::Dispatcher { .. } => ProcessKind::Dispatcher,
            ProcessDetails::Scheduler => ProcessKind::Scheduler,
        }
    }
}

/// Who a process is. Built once when the process comes to life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    /// Human readable name, `<kind>-<pid>`.
    pub name: String,
    /// OS process id.
    pub pid: u32,
    /// Host the process runs on.
    pub hostname: String,
    /// Kind and kind-specific attributes.
    pub details: ProcessDetails,
}

impl ProcessIdentity {
    /// Builds the identity of the calling OS process.
    pub fn current(details: ProcessDetails) -> Self {
        let pid = std::process::id();
        Self {
            name: format!("{}-{pid}", details.kind()),
            pid,
            hostname: hostname(),
            details,
        }
    }

    pub fn kind(&self) -> ProcessKind {
        self.details.kind()
    }

    /// Queue selectors, for workers.
    pub fn queues(&self) -> Option<&[String]> {
        match &self.details {
            ProcessDetails::Worker { queues } => Some(queues),
            _ => None,
        }
    }

    /// Batch size, for dispatchers.
    pub fn batch_size(&self) -> Option<usize> {
        match self.details {
            ProcessDetails::Dispatcher { batch_size } => Some(batch_size),
            _ => None,
        }
    }
}

/// Hostname of this machine, as recorded in registrations.
pub fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// States a process moves through. `Exited` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running,
    Draining,
    Stopped,
    Exited,
}

/// Kind-specific work performed between the Start and Stop hooks.
pub trait Process {
    /// Identity passed to hooks and stored in the registration.
    fn identity(&self) -> &ProcessIdentity;

    /// Runs the work loop until [`RunContext::running`] turns false.
    ///
    /// Transient failures should be reported through [`RunContext::report`] and the
    /// loop continued. Returning an error ends the process early.
    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), ProcessError>;
}

/// Handle a work loop uses to talk to its runtime.
pub struct RunContext<'a> {
    identity: &'a ProcessIdentity,
    registration: RegistrationId,
    store: &'a dyn Store,
    hooks: &'a HookRegistry,
    shutdown: &'a Shutdown,
    heartbeat_interval: Duration,
    last_heartbeat: Instant,
    transitions: &'a mut Vec<ProcessState>,
}

impl<'a> RunContext<'a> {
    pub fn identity(&self) -> &ProcessIdentity {
        self.identity
    }

    /// Registration created for this process on start.
    pub fn registration(&self) -> RegistrationId {
        self.registration
    }

    pub fn store(&self) -> &dyn Store {
        self.store
    }

    pub fn shutdown(&self) -> &Shutdown {
        self.shutdown
    }

    /// Whether the loop should keep claiming work.
    ///
    /// Refreshes the heartbeat when one is due. The first call after a shutdown
    /// request moves the process to `Draining`.
    pub fn running(&mut self) -> bool {
        self.heartbeat_if_due();
        if self.shutdown.is_requested() {
            self.begin_draining();
            return false;
        }
        true
    }

    /// Sleeps for up to `duration`, returning early on shutdown.
    pub fn idle(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || self.shutdown.is_requested() {
                return;
            }
            let next_heartbeat = self.last_heartbeat + self.heartbeat_interval;
            let wake = deadline.min(next_heartbeat.max(now));
            self.shutdown.sleep(wake - now);
            self.heartbeat_if_due();
        }
    }

    /// Delivers an error to the error sink without interrupting the loop.
    pub fn report(&self, err: &ProcessError) {
        self.hooks.report(err);
    }

    /// Refreshes the registration when a heartbeat is due. Loops that block
    /// outside [`RunContext::idle`] call this to stay registered.
    pub fn heartbeat_if_due(&mut self) {
        if self.last_heartbeat.elapsed() < self.heartbeat_interval {
            return;
        }
        self.last_heartbeat = Instant::now();
        if let Err(source) = self.store.heartbeat(self.registration) {
            self.hooks.report(&ProcessError::WorkLoopError {
                kind: self.identity.kind(),
                source,
            });
        }
    }

    fn begin_draining(&mut self) {
        if self.transitions.last() == Some(&ProcessState::Running) {
            info!("{} draining", self.identity.name);
            self.transitions.push(ProcessState::Draining);
        }
    }
}

/// What is left once a process has gone through its lifecycle.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    /// Identity the process ran with.
    pub identity: ProcessIdentity,
    /// Every state entered, in order.
    pub transitions: Vec<ProcessState>,
    /// False when the work loop ended with an error or never ran.
    pub clean: bool,
}

impl ProcessExit {
    /// Exit status for the OS process hosting this runtime.
    pub fn code(&self) -> i32 {
        if self.clean { 0 } else { 1 }
    }
}

/// Drives one [`Process`] through start, work, stop and exit.
pub struct ProcessRuntime<P> {
    process: P,
    hooks: HookRegistry,
    store: Arc<dyn Store>,
    shutdown: Shutdown,
    supervisor: Option<RegistrationId>,
    heartbeat_interval: Duration,
}

impl<P: Process> ProcessRuntime<P> {
    pub fn new(process: P, hooks: HookRegistry, store: Arc<dyn Store>) -> Self {
        Self {
            process,
            hooks,
            store,
            shutdown: Shutdown::new(),
            supervisor: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Replaces the shutdown flag the work loop observes.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Records the supervisor that owns this process.
    pub fn supervised_by(mut self, supervisor: RegistrationId) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Handle that can stop the process from another thread.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Runs the whole lifecycle. Always ends in `Exited`.
    pub fn launch(mut self) -> ProcessExit {
        let identity = self.process.identity().clone();
        let kind = identity.kind();
        let mut transitions = vec![ProcessState::Created];

        info!("Starting {}", identity.name);
        transitions.push(ProcessState::Running);
        self.hooks.invoke(&identity, LifecyclePhase::Start);

        let registration = match self.store.register(&identity, self.supervisor) {
            Ok(id) => {
                debug!("{} registered as {id}", identity.name);
                Some(id)
            }
            Err(source) => {
                error!("{} could not register: {source}", identity.name);
                self.hooks
                    .report(&ProcessError::RegistrationError { kind, source });
                None
            }
        };

        let mut clean = registration.is_some();
        if let Some(id) = registration {
            let mut ctx = RunContext {
                identity: &identity,
                registration: id,
                store: &*self.store,
                hooks: &self.hooks,
                shutdown: &self.shutdown,
                heartbeat_interval: self.heartbeat_interval,
                last_heartbeat: Instant::now(),
                transitions: &mut transitions,
            };

            let process = &mut self.process;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| process.run(&mut ctx)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!("{} work loop ended with error: {err}", identity.name);
                    self.hooks.report(&err);
                    clean = false;
                }
                Err(payload) => {
                    let err = ProcessError::WorkLoopPanic {
                        kind,
                        message: panic_message(payload.as_ref()),
                    };
                    error!("{}: {err}", identity.name);
                    self.hooks.report(&err);
                    clean = false;
                }
            }
        }

        if transitions.last() == Some(&ProcessState::Running) {
            transitions.push(ProcessState::Draining);
        }

        transitions.push(ProcessState::Stopped);
        self.hooks.invoke(&identity, LifecyclePhase::Stop);

        if let Some(id) = registration
            && let Err(err) = self.store.deregister(id)
        {
            warn!("{} could not deregister: {err}", identity.name);
            self.hooks
                .report(&ProcessError::WorkLoopError { kind, source: err });
        }

        transitions.push(ProcessState::Exited);
        self.hooks.invoke(&identity, LifecyclePhase::Exit);
        info!("{} exited", identity.name);

        ProcessExit {
            identity,
            transitions,
            clean,
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
