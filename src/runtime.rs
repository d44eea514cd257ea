//! Runtime directories for user and system installs.
#[cfg(test)]
use std::path::Path;
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock, RwLockReadGuard},
};

/// Where forkq keeps its store and looks for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Home scoped (`~/.local/share/forkq`, `~/.config/forkq`).
    User,
    /// Machine wide (`/var/lib/forkq`, `/etc/forkq`).
    System,
}

#[derive(Debug, Clone)]
struct RuntimeDirs {
    mode: RuntimeMode,
    state_dir: PathBuf,
    config_dirs: Vec<PathBuf>,
}

static DIRS: OnceLock<RwLock<RuntimeDirs>> = OnceLock::new();

fn dirs_lock() -> &'static RwLock<RuntimeDirs> {
    DIRS.get_or_init(|| RwLock::new(RuntimeDirs::for_mode(RuntimeMode::User)))
}

fn read() -> RwLockReadGuard<'static, RuntimeDirs> {
    dirs_lock()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RuntimeDirs {
    fn for_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => {
                let home = env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/"));
                Self::under_home(home)
            }
            RuntimeMode::System => Self {
                mode,
                state_dir: PathBuf::from("/var/lib/forkq"),
                config_dirs: vec![PathBuf::from("/etc/forkq")],
            },
        }
    }

    fn under_home(home: PathBuf) -> Self {
        Self {
            mode: RuntimeMode::User,
            state_dir: home.join(".local/share/forkq"),
            config_dirs: vec![home.join(".config/forkq")],
        }
    }
}

/// Selects the runtime mode. Re-reads `HOME` in user mode.
pub fn init(mode: RuntimeMode) {
    let dirs = RuntimeDirs::for_mode(mode);
    *dirs_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = dirs;
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    *dirs_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) =
        RuntimeDirs::under_home(home.to_path_buf());
}

pub fn mode() -> RuntimeMode {
    read().mode
}

/// Default store directory.
pub fn state_dir() -> PathBuf {
    read().state_dir.clone()
}

/// Directories searched for `forkq.yaml`, after the working directory.
pub fn config_dirs() -> Vec<PathBuf> {
    read().config_dirs.clone()
}
