#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use nix::{sys::signal, unistd::Pid};

/// A project directory plus a private HOME, so runtime state never leaks between tests.
pub struct Project {
    _temp: tempfile::TempDir,
    pub dir: PathBuf,
    pub home: PathBuf,
}

impl Project {
    pub fn new(config: &str) -> Self {
        let temp = tempfile::tempdir().expect("failed to create tempdir");
        let dir = temp.path().join("demo");
        let home = temp.path().join("home");
        fs::create_dir_all(&dir).expect("failed to create project dir");
        fs::create_dir_all(&home).expect("failed to create home dir");
        fs::write(dir.join("tandem.yml"), config).expect("failed to write config");
        Self {
            _temp: temp,
            dir,
            home,
        }
    }

    /// The binary, run from the project directory with the private HOME.
    pub fn tandem(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tandem"));
        cmd.current_dir(&self.dir)
            .env("HOME", &self.home)
            .env_remove("TANDEM_PROJECT_NAME")
            .env_remove("RUST_LOG");
        cmd
    }

    pub fn state_dir(&self) -> PathBuf {
        self.home.join(".local/share/tandem")
    }

    pub fn supervisor_pid_path(&self) -> PathBuf {
        self.state_dir().join("supervisor.pid")
    }

    pub fn program_log(&self, name: &str) -> PathBuf {
        self.state_dir().join("logs/demo").join(format!("{name}.log"))
    }
}

pub fn wait_for_path(path: &Path) -> bool {
    wait_until(Duration::from_secs(5), || path.exists())
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    check()
}

pub fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn is_process_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}
