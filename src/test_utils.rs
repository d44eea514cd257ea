//! Helpers shared by unit and integration tests.
use std::sync::{Mutex, MutexGuard, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static FORK_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn acquire(lock: &'static OnceLock<Mutex<()>>) -> MutexGuard<'static, ()> {
    lock.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serialises tests that touch process environment or runtime directories.
pub fn env_lock() -> MutexGuard<'static, ()> {
    acquire(&ENV_LOCK)
}

/// Serialises tests that fork. A fork taken while another test thread holds a
/// lock would leave the child deadlocked on it.
pub fn fork_lock() -> MutexGuard<'static, ()> {
    acquire(&FORK_LOCK)
}
