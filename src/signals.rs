//! Termination signals and the shutdown flag observed by work loops.
//!
//! SIGTERM and SIGINT only flip a process-wide atomic; loops poll it through
//! [`Shutdown`]. The handler is inherited across `fork`, so children installed
//! by the supervisor react to signals from the moment they exist.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::Pid,
};

/// Granularity at which sleeping loops re-check the shutdown flag.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

static TERMINATION_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_termination(_: libc::c_int) {
    TERMINATION_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs the SIGTERM and SIGINT handlers for this process.
pub fn install_termination_handlers() -> Result<(), Errno> {
    let action = SigAction::new(
        SigHandler::Handler(on_termination),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        unsafe { signal::sigaction(sig, &action)? };
    }
    Ok(())
}

/// Whether this process has received SIGTERM or SIGINT.
pub fn termination_requested() -> bool {
    TERMINATION_REQUESTED.load(Ordering::SeqCst)
}

/// Sends SIGTERM to `pid`. A process that is already gone is not an error.
pub fn terminate(pid: Pid) -> Result<(), Errno> {
    send(pid, Signal::SIGTERM)
}

/// Sends SIGKILL to `pid`. A process that is already gone is not an error.
pub fn kill(pid: Pid) -> Result<(), Errno> {
    send(pid, Signal::SIGKILL)
}

fn send(pid: Pid, sig: Signal) -> Result<(), Errno> {
    match signal::kill(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Cloneable stop flag shared between a runtime and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    observe_signals: bool,
}

impl Shutdown {
    /// A flag that only flips when [`Shutdown::request`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that also flips when the process receives a termination signal.
    pub fn from_signals() -> Self {
        Self {
            requested: Arc::default(),
            observe_signals: true,
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
            || (self.observe_signals && termination_requested())
    }

    /// Sleeps for `duration` in short slices. Returns `true` if woken by shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
