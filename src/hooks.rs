//! Lifecycle hook registry and error sink.
//!
//! Hooks are plain callbacks keyed by process kind and lifecycle phase. The
//! registry is an explicit handle: clones share the same table, and every
//! process reads it at each phase transition. Children forked by the supervisor
//! inherit a copy of the table as it was at fork time.
use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    process::Command,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::{debug, error};

use crate::{
    config::{HooksConfig, PhaseHooks},
    error::{BoxError, ProcessError},
    process::{LifecyclePhase, ProcessIdentity, ProcessKind, panic_message},
};

/// A lifecycle callback.
pub type Hook = Arc<dyn Fn(&ProcessIdentity) -> Result<(), BoxError> + Send + Sync>;

/// Receives every error raised by hooks or supervised work.
pub type ErrorSink = Arc<dyn Fn(&ProcessError) + Send + Sync>;

/// Hooks registered for one process kind.
#[derive(Clone, Default)]
pub struct HookSet {
    start: Vec<Hook>,
    stop: Vec<Hook>,
    exit: Vec<Hook>,
}

impl HookSet {
    fn phase(&self, phase: LifecyclePhase) -> &Vec<Hook> {
        match phase {
            LifecyclePhase::Start => &self.start,
            LifecyclePhase::Stop => &self.stop,
            LifecyclePhase::Exit => &self.exit,
        }
    }

    fn phase_mut(&mut self, phase: LifecyclePhase) -> &mut Vec<Hook> {
        match phase {
            LifecyclePhase::Start => &mut self.start,
            LifecyclePhase::Stop => &mut self.stop,
            LifecyclePhase::Exit => &mut self.exit,
        }
    }

    /// Number of hooks registered for `phase`.
    pub fn len(&self, phase: LifecyclePhase) -> usize {
        self.phase(phase).len()
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty() && self.exit.is_empty()
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("start", &self.start.len())
            .field("stop", &self.stop.len())
            .field("exit", &self.exit.len())
            .finish()
    }
}

struct HookTable {
    sets: HashMap<ProcessKind, HookSet>,
    error_sink: ErrorSink,
}

/// Shared handle to the hook table and error sink of this process.
#[derive(Clone)]
pub struct HookRegistry {
    inner: Arc<RwLock<HookTable>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("sets", &self.read().sets)
            .finish()
    }
}

/// Error sink used until `on_thread_error` replaces it.
pub fn log_error_sink() -> ErrorSink {
    Arc::new(|err: &ProcessError| error!("{err}"))
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HookTable {
                sets: HashMap::new(),
                error_sink: log_error_sink(),
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HookTable> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HookTable> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `hook` to the hooks run for `kind` at `phase`.
    pub fn register<F>(&self, kind: ProcessKind, phase: LifecyclePhase, hook: F)
    where
        F: Fn(&ProcessIdentity) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.write()
            .sets
            .entry(kind)
            .or_default()
            .phase_mut(phase)
            .push(Arc::new(hook));
    }

    pub fn on_start<F>(&self, kind: ProcessKind, hook: F)
    where
        F: Fn(&ProcessIdentity) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register(kind, LifecyclePhase::Start, hook);
    }

    pub fn on_stop<F>(&self, kind: ProcessKind, hook: F)
    where
        F: Fn(&ProcessIdentity) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register(kind, LifecyclePhase::Stop, hook);
    }

    pub fn on_exit<F>(&self, kind: ProcessKind, hook: F)
    where
        F: Fn(&ProcessIdentity) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register(kind, LifecyclePhase::Exit, hook);
    }

    /// Replaces the error sink, returning the previous one.
    pub fn on_thread_error<F>(&self, sink: F) -> ErrorSink
    where
        F: Fn(&ProcessError) + Send + Sync + 'static,
    {
        self.set_error_sink(Arc::new(sink))
    }

    /// Installs `sink`, returning the previous one so it can be restored.
    pub fn set_error_sink(&self, sink: ErrorSink) -> ErrorSink {
        std::mem::replace(&mut self.write().error_sink, sink)
    }

    pub fn error_sink(&self) -> ErrorSink {
        Arc::clone(&self.read().error_sink)
    }

    /// Delivers `err` to the error sink. A panicking sink is logged and swallowed.
    pub fn report(&self, err: &ProcessError) {
        let sink = self.error_sink();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink(err))) {
            error!(
                "error sink panicked while handling '{err}': {}",
                panic_message(payload.as_ref())
            );
        }
    }

    /// Runs every hook for the identity's kind at `phase`, in registration order.
    ///
    /// Failures are sent to the error sink and never stop the remaining hooks.
    /// Returns how many hooks failed.
    pub fn invoke(&self, identity: &ProcessIdentity, phase: LifecyclePhase) -> usize {
        let kind = identity.kind();
        let hooks: Vec<Hook> = self
            .read()
            .sets
            .get(&kind)
            .map(|set| set.phase(phase).clone())
            .unwrap_or_default();

        if hooks.is_empty() {
            return 0;
        }
        debug!("Running {} {phase} hook(s) for {}", hooks.len(), identity.name);

        let mut failures = 0;
        for hook in hooks {
            let source = match panic::catch_unwind(AssertUnwindSafe(|| hook(identity))) {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => source,
                Err(payload) => panic_message(payload.as_ref()).into(),
            };
            failures += 1;
            self.report(&ProcessError::HookExecutionError {
                kind,
                phase,
                source,
            });
        }
        failures
    }

    /// Number of hooks registered for `kind` at `phase`.
    pub fn count(&self, kind: ProcessKind, phase: LifecyclePhase) -> usize {
        self.read()
            .sets
            .get(&kind)
            .map_or(0, |set| set.len(phase))
    }

    /// Copy of the hooks registered for `kind`.
    pub fn snapshot(&self, kind: ProcessKind) -> HookSet {
        self.read().sets.get(&kind).cloned().unwrap_or_default()
    }

    /// Installs `set` for `kind`, returning what was there before.
    pub fn replace(&self, kind: ProcessKind, set: HookSet) -> HookSet {
        self.write().sets.insert(kind, set).unwrap_or_default()
    }

    /// Clears every hook of `kind`, returning the removed set.
    pub fn reset(&self, kind: ProcessKind) -> HookSet {
        self.replace(kind, HookSet::default())
    }

    /// Runs `f` with the hooks of `kinds` cleared, restoring them afterwards.
    ///
    /// Restoration also happens if `f` panics.
    pub fn with_reset<T>(&self, kinds: &[ProcessKind], f: impl FnOnce() -> T) -> T {
        let _guard = ResetGuard {
            registry: self,
            saved: kinds.iter().map(|kind| (*kind, self.reset(*kind))).collect(),
        };
        f()
    }
}

struct ResetGuard<'a> {
    registry: &'a HookRegistry,
    saved: Vec<(ProcessKind, HookSet)>,
}

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        for (kind, set) in self.saved.drain(..) {
            self.registry.replace(kind, set);
        }
    }
}

/// Environment describing `identity` to shell hooks.
pub fn identity_env(identity: &ProcessIdentity) -> Vec<(&'static str, String)> {
    let mut env = vec![
        ("FORKQ_PROCESS_KIND", identity.kind().to_string()),
        ("FORKQ_PROCESS_NAME", identity.name.clone()),
        ("FORKQ_PID", identity.pid.to_string()),
        ("FORKQ_HOSTNAME", identity.hostname.clone()),
    ];
    if let Some(queues) = identity.queues() {
        env.push(("FORKQ_QUEUES", queues.join(",")));
    }
    if let Some(batch_size) = identity.batch_size() {
        env.push(("FORKQ_BATCH_SIZE", batch_size.to_string()));
    }
    env
}

/// Builds a hook that runs `command` through `sh -c`.
///
/// The identity is exposed through `FORKQ_*` variables. A non-zero exit status is
/// a hook failure.
pub fn command_hook(
    command: String,
) -> impl Fn(&ProcessIdentity) -> Result<(), BoxError> + Send + Sync + 'static {
    move |identity| {
        let status = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .envs(identity_env(identity))
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("hook command `{command}` exited with {status}").into())
        }
    }
}

/// Registers the shell hooks declared in configuration.
pub fn register_command_hooks(registry: &HookRegistry, config: &HooksConfig) {
    let per_kind: [(ProcessKind, &PhaseHooks); 4] = [
        (ProcessKind::Supervisor, &config.supervisor),
        (ProcessKind::Worker, &config.worker),
        (ProcessKind::Dispatcher, &config.dispatcher),
        (ProcessKind::Scheduler, &config.scheduler),
    ];

    for (kind, hooks) in per_kind {
        let phases = [
            (LifecyclePhase::Start, &hooks.on_start),
            (LifecyclePhase::Stop, &hooks.on_stop),
            (LifecyclePhase::Exit, &hooks.on_exit),
        ];
        for (phase, command) in phases {
            if let Some(command) = command {
                debug!("Registering {kind} {phase} hook: `{command}`");
                registry.register(kind, phase, command_hook(command.clone()));
            }
        }
    }

    if let Some(command) = config.on_thread_error.clone() {
        registry.on_thread_error(move |err| {
            let result = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .env("FORKQ_ERROR", root_message(err))
                .env("FORKQ_ERROR_DETAIL", err.to_string())
                .status();
            match result {
                Ok(status) if status.success() => {}
                Ok(status) => error!("on_thread_error command exited with {status}"),
                Err(spawn_err) => error!("on_thread_error command failed: {spawn_err}"),
            }
        });
    }
}

/// Message of the innermost error in the chain: what the hook itself raised.
pub fn root_message(err: &ProcessError) -> String {
    let mut current: &dyn std::error::Error = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}
