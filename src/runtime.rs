//! Runtime paths and privilege modes.
#[cfg(test)]
use std::path::Path;
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

/// Where to store state, logs and device credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// User home dir (~/.local/share/tandem).
    User,
    /// System dirs (/var/lib/tandem).
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    state_dir: PathBuf,
    log_dir: PathBuf,
    credential_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        let state_dir = home.join(".local/share/tandem");
        let log_dir = state_dir.join("logs");

        Self {
            mode: RuntimeMode::User,
            state_dir,
            log_dir,
            credential_dir: home.join(".tandem"),
        }
    }

    fn system_directories() -> Self {
        Self {
            mode: RuntimeMode::System,
            state_dir: PathBuf::from("/var/lib/tandem"),
            log_dir: PathBuf::from("/var/log/tandem"),
            credential_dir: PathBuf::from("/etc/tandem"),
        }
    }
}

/// Sets runtime mode. Can be called multiple times (e.g. after forking).
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_mode(mode);
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_user_home(home.to_path_buf());
}

/// Returns the current runtime mode (User or System).
pub fn mode() -> RuntimeMode {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .mode
}

/// State dir (PIDs, sockets).
pub fn state_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .state_dir
        .clone()
}

/// Log directory.
pub fn log_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .log_dir
        .clone()
}

/// Device credential file written by the registration flow.
pub fn credential_path() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .credential_dir
        .join("tandem.conf")
}

/// PID file of the supervising process.
pub fn supervisor_pid_path() -> PathBuf {
    state_dir().join("supervisor.pid")
}

/// PID file of the config sync daemon.
pub fn sync_pid_path() -> PathBuf {
    state_dir().join("sync.pid")
}

/// Default Unix socket location when a manifest asks for one without a path.
pub fn control_socket_path() -> PathBuf {
    state_dir().join("control.sock")
}
