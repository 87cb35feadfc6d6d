//! PID-file state of the two daemons and the program table the supervising process
//! drives.
use chrono::Utc;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    os::unix::{io::AsRawFd, process::CommandExt},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    constants::STOP_POLL_INTERVAL,
    error::PidFileError,
    ipc::Target,
    manifest::ProgramSpec,
    status::{ProgramState, ProgramStatus},
};

/// A file holding the decimal PID of one daemon.
///
/// The file on disk is the only record of whether the daemon runs: a PID that accepts
/// signal 0 means running, anything else means stopped and the file is cleaned up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the recorded PID, `None` when the file does not exist.
    pub fn read(&self) -> Result<Option<i32>, PidFileError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => Err(PidFileError::Malformed {
                path: self.path.display().to_string(),
                contents: contents.trim().to_string(),
            }),
        }
    }

    /// Records `pid`, creating parent directories as needed.
    pub fn write(&self, pid: i32) -> Result<(), PidFileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{pid}\n"))?;
        Ok(())
    }

    /// Records the calling process, refusing when another live process owns the file.
    pub fn claim(&self) -> Result<(), PidFileError> {
        let own = std::process::id() as i32;
        if let Some(pid) = self.running_pid()?
            && pid != own
        {
            return Err(PidFileError::AlreadyRunning(pid));
        }
        self.write(own)
    }

    /// Deletes the file; a missing file is not an error.
    pub fn remove(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// PID of the live daemon. A stale or unreadable file is removed and reported as
    /// `None`; a live PID never touches the file.
    pub fn running_pid(&self) -> Result<Option<i32>, PidFileError> {
        let pid = match self.read() {
            Ok(Some(pid)) => pid,
            Ok(None) => return Ok(None),
            Err(PidFileError::Malformed { path, contents }) => {
                warn!("Removing malformed PID file {path} (contents '{contents}')");
                self.remove()?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) => Ok(Some(pid)),
            // The process exists but belongs to someone else.
            Err(Errno::EPERM) => Ok(Some(pid)),
            Err(Errno::ESRCH) => {
                debug!("PID {pid} in {} is gone; removing stale file", self.path.display());
                self.remove()?;
                Ok(None)
            }
            Err(err) => Err(PidFileError::Io(io::Error::from_raw_os_error(err as i32))),
        }
    }

    pub fn is_running(&self) -> Result<bool, PidFileError> {
        Ok(self.running_pid()?.is_some())
    }

    /// Sends SIGTERM to the recorded daemon and waits up to `timeout` for it to go away.
    ///
    /// Returns `true` once the process is gone or the file no longer names it. No
    /// SIGKILL follows: a daemon that ignores the request keeps running.
    pub fn terminate(&self, timeout: Duration) -> Result<bool, PidFileError> {
        let Some(pid) = self.running_pid()? else {
            return Ok(true);
        };

        debug!("Sending SIGTERM to PID {pid} from {}", self.path.display());
        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => return Err(PidFileError::Io(io::Error::from_raw_os_error(err as i32))),
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if matches!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH)) {
                self.remove()?;
                return Ok(true);
            }
            // A daemon removes its own file as its last step.
            if self.read().ok().flatten() != Some(pid) {
                return Ok(true);
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }

        warn!("PID {pid} did not exit within {timeout:?}");
        Ok(false)
    }
}

/// Failure of a program-table operation.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("no such process: {0}")]
    UnknownProgram(String),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal '{program}': {source}")]
    Signal {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("process '{0}' is not running")]
    NotRunning(String),

    #[error("invalid signal '{0}'")]
    InvalidSignal(String),
}

struct Program {
    spec: ProgramSpec,
    child: Option<Child>,
    state: ProgramState,
    started_at: Option<chrono::DateTime<Utc>>,
    exit_code: Option<i32>,
    detail: Option<String>,
}

impl Program {
    fn new(spec: ProgramSpec) -> Self {
        Self {
            spec,
            child: None,
            state: ProgramState::Stopped,
            started_at: None,
            exit_code: None,
            detail: None,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn status(&self) -> ProgramStatus {
        ProgramStatus {
            name: self.spec.name.clone(),
            state: self.state,
            pid: self.pid(),
            started_at: self.started_at,
            exit_code: self.exit_code,
            detail: self.detail.clone(),
        }
    }
}

/// Every program of one manifest, in manifest (dependency) order.
pub struct ProgramTable {
    programs: Vec<Program>,
    log_dir: PathBuf,
    working_dir: PathBuf,
}

impl ProgramTable {
    /// Builds the table; programs start in `working_dir` unless they set `directory`.
    pub fn new(specs: Vec<ProgramSpec>, log_dir: PathBuf, working_dir: PathBuf) -> Self {
        Self {
            programs: specs.into_iter().map(Program::new).collect(),
            log_dir,
            working_dir,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.programs.iter().map(|p| p.spec.name.clone()).collect()
    }

    /// Path of the program's stdout log.
    pub fn log_path(&self, name: &str) -> Result<PathBuf, ProgramError> {
        self.index_of(name)?;
        Ok(self.log_dir.join(format!("{name}.log")))
    }

    fn err_log_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}.err.log"))
    }

    fn index_of(&self, name: &str) -> Result<usize, ProgramError> {
        self.programs
            .iter()
            .position(|p| p.spec.name == name)
            .ok_or_else(|| ProgramError::UnknownProgram(name.to_string()))
    }

    fn indices(&self, target: &Target) -> Result<Vec<usize>, ProgramError> {
        match target {
            Target::All => Ok((0..self.programs.len()).collect()),
            Target::Program(name) => Ok(vec![self.index_of(name)?]),
        }
    }

    /// Starts every program flagged `autostart`, in order.
    pub fn start_autostart(&mut self) {
        for index in 0..self.programs.len() {
            if self.programs[index].spec.autostart
                && let Err(err) = self.start_index(index)
            {
                error!("{err}");
            }
        }
    }

    /// Starts the target; programs already running are left alone.
    pub fn start(&mut self, target: &Target) -> Result<Vec<String>, ProgramError> {
        self.reap();
        let mut started = Vec::new();
        for index in self.indices(target)? {
            if self.programs[index].state == ProgramState::Running {
                continue;
            }
            self.start_index(index)?;
            started.push(self.programs[index].spec.name.clone());
        }
        Ok(started)
    }

    /// Stops the target, last program first.
    pub fn stop(&mut self, target: &Target) -> Result<Vec<String>, ProgramError> {
        self.reap();
        let mut stopped = Vec::new();
        for index in self.indices(target)?.into_iter().rev() {
            if self.programs[index].state != ProgramState::Running {
                continue;
            }
            self.stop_index(index)?;
            stopped.push(self.programs[index].spec.name.clone());
        }
        Ok(stopped)
    }

    pub fn restart(&mut self, target: &Target) -> Result<Vec<String>, ProgramError> {
        self.stop(target)?;
        self.start(target)
    }

    /// Delivers `signal` to the process group of each running program in the target.
    pub fn signal(&mut self, target: &Target, signal: &str) -> Result<Vec<String>, ProgramError> {
        let sig = crate::manifest::parse_signal(signal)
            .ok_or_else(|| ProgramError::InvalidSignal(signal.to_string()))?;
        self.reap();

        let indices = self.indices(target)?;
        if let Target::Program(name) = target
            && self.programs[indices[0]].state != ProgramState::Running
        {
            return Err(ProgramError::NotRunning(name.clone()));
        }

        let mut signalled = Vec::new();
        for index in indices {
            let program = &self.programs[index];
            let Some(pid) = program.pid() else {
                continue;
            };
            signal_group(pid, sig).map_err(|source| ProgramError::Signal {
                program: program.spec.name.clone(),
                source,
            })?;
            signalled.push(program.spec.name.clone());
        }
        // Let fatal signals land before the next status query.
        thread::sleep(STOP_POLL_INTERVAL);
        self.reap();
        Ok(signalled)
    }

    /// Status rows for `names`, or for every program when `names` is empty.
    pub fn status(&mut self, names: &[String]) -> Result<Vec<ProgramStatus>, ProgramError> {
        self.reap();
        if names.is_empty() {
            return Ok(self.programs.iter().map(Program::status).collect());
        }
        names
            .iter()
            .map(|name| Ok(self.programs[self.index_of(name)?].status()))
            .collect()
    }

    /// Collects programs that exited on their own.
    pub fn reap(&mut self) {
        for program in &mut self.programs {
            let Some(child) = program.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("Process '{}' exited with {status}", program.spec.name);
                    program.child = None;
                    program.state = ProgramState::Exited;
                    program.exit_code = status.code();
                }
                Ok(None) => {}
                Err(err) => warn!("Failed to poll '{}': {err}", program.spec.name),
            }
        }
    }

    /// Stops everything in reverse order, logging failures.
    pub fn stop_all(&mut self) {
        if let Err(err) = self.stop(&Target::All) {
            error!("Failed to stop processes: {err}");
        }
    }

    fn start_index(&mut self, index: usize) -> Result<(), ProgramError> {
        let name = self.programs[index].spec.name.clone();
        match self.spawn(&self.programs[index].spec) {
            Ok(child) => {
                info!("Started '{name}' with PID {}", child.id());
                let program = &mut self.programs[index];
                program.child = Some(child);
                program.state = ProgramState::Running;
                program.started_at = Some(Utc::now());
                program.exit_code = None;
                program.detail = None;
                Ok(())
            }
            Err(source) => {
                let program = &mut self.programs[index];
                program.state = ProgramState::Fatal;
                program.detail = Some(source.to_string());
                Err(ProgramError::Spawn {
                    program: name,
                    source,
                })
            }
        }
    }

    fn spawn(&self, spec: &ProgramSpec) -> io::Result<Child> {
        fs::create_dir_all(&self.log_dir)?;
        let stdout = append(&self.log_path_unchecked(&spec.name))?;
        let stderr = if spec.redirect_stderr {
            stdout.try_clone()?
        } else {
            append(&self.err_log_path(&spec.name))?
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&spec.command);
        cmd.current_dir(spec.directory.as_deref().unwrap_or(&self.working_dir));
        cmd.envs(spec.environment.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        debug!("Executing command: {cmd:?}");

        unsafe {
            cmd.pre_exec(|| {
                // Own process group, so signals reach the whole tree of the program.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                #[cfg(target_os = "linux")]
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
    }

    fn log_path_unchecked(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}.log"))
    }

    fn stop_index(&mut self, index: usize) -> Result<(), ProgramError> {
        let program = &mut self.programs[index];
        let name = program.spec.name.clone();
        let Some(mut child) = program.child.take() else {
            program.state = ProgramState::Stopped;
            return Ok(());
        };
        let pid = child.id();

        debug!("Stopping '{name}' (PID {pid}) with {}", program.spec.stop_signal);
        if let Err(source) = signal_group(pid, program.spec.stop_signal) {
            program.child = Some(child);
            return Err(ProgramError::Signal {
                program: name,
                source,
            });
        }

        let deadline = Instant::now() + program.spec.stop_wait;
        let exited = loop {
            match child.try_wait() {
                Ok(Some(_)) => break true,
                Ok(None) if Instant::now() >= deadline => break false,
                Ok(None) => thread::sleep(STOP_POLL_INTERVAL),
                Err(err) => {
                    warn!("Failed to poll '{name}': {err}");
                    break false;
                }
            }
        };

        if !exited {
            warn!("'{name}' did not exit after {}; sending SIGKILL", program.spec.stop_signal);
            if let Err(err) = signal_group(pid, Signal::SIGKILL) {
                warn!("Failed to kill '{name}': {err}");
            }
            let _ = child.wait();
        }

        info!("Stopped '{name}'");
        program.state = ProgramState::Stopped;
        program.exit_code = None;
        Ok(())
    }
}

/// Which side of [`daemonize`] the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// The original process; the daemon is detached and running.
    Parent,
    /// The detached daemon. It must finish with `std::process::exit`.
    Daemon,
}

/// Detaches a daemon with the double-fork mechanism.
///
/// The parent reaps the intermediate child and returns. The daemon runs in a new
/// session with `/` as working directory, stdin and stdout on `/dev/null` and stderr
/// appended to `log_file`, where its tracing output ends up.
pub fn daemonize(log_file: &Path) -> io::Result<Fork> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let log = append(log_file)?;
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;

    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        child => {
            let mut status = 0;
            unsafe {
                libc::waitpid(child, &mut status, 0);
            }
            return Ok(Fork::Parent);
        }
    }

    unsafe {
        libc::setsid();
    }

    match unsafe { libc::fork() } {
        -1 => unsafe { libc::_exit(1) },
        0 => {}
        _ => unsafe { libc::_exit(0) },
    }

    std::env::set_current_dir("/")?;
    unsafe {
        libc::umask(0o022);
        let _ = libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
        let _ = libc::dup2(devnull.as_raw_fd(), libc::STDOUT_FILENO);
        let _ = libc::dup2(log.as_raw_fd(), libc::STDERR_FILENO);
    }

    Ok(Fork::Daemon)
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Signals the process group led by `pid`, falling back to the process alone.
fn signal_group(pid: u32, sig: Signal) -> io::Result<()> {
    let pid = Pid::from_raw(pid as i32);
    match signal::killpg(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) => {
            warn!("Insufficient permissions to signal process group {pid}; signalling the process");
            match signal::kill(pid, sig) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
            }
        }
        Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn program(name: &str, command: &str) -> ProgramSpec {
        ProgramSpec {
            name: name.into(),
            command: command.into(),
            autostart: true,
            redirect_stderr: true,
            directory: None,
            environment: Vec::new(),
            stop_wait: Duration::from_secs(2),
            stop_signal: Signal::SIGTERM,
        }
    }

    fn dead_pid() -> i32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    #[test]
    fn missing_pidfile_is_not_running() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("none.pid"));
        assert!(!pidfile.is_running().unwrap());
    }

    #[test]
    fn stale_pidfile_is_removed() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("stale.pid"));
        pidfile.write(dead_pid()).unwrap();

        assert!(!pidfile.is_running().unwrap());
        assert!(!pidfile.path().exists());
    }

    #[test]
    fn live_pidfile_is_kept() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("live.pid"));
        pidfile.write(std::process::id() as i32).unwrap();

        assert!(pidfile.is_running().unwrap());
        assert!(pidfile.path().exists());
    }

    #[test]
    fn malformed_pidfile_is_removed() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("bad.pid"));
        fs::write(pidfile.path(), "not-a-pid").unwrap();

        assert!(!pidfile.is_running().unwrap());
        assert!(!pidfile.path().exists());
    }

    #[test]
    fn claim_refuses_a_live_owner() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("owned.pid"));
        let mut other = Command::new("sleep").arg("5").spawn().unwrap();
        pidfile.write(other.id() as i32).unwrap();

        assert!(matches!(pidfile.claim(), Err(PidFileError::AlreadyRunning(_))));

        other.kill().unwrap();
        other.wait().unwrap();
        pidfile.claim().unwrap();
        assert_eq!(pidfile.read().unwrap(), Some(std::process::id() as i32));
    }

    #[test]
    fn terminate_stops_the_recorded_process() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("term.pid"));
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        pidfile.write(child.id() as i32).unwrap();
        let reaper = thread::spawn(move || child.wait().unwrap());

        assert!(pidfile.terminate(Duration::from_secs(5)).unwrap());
        assert!(!pidfile.path().exists());
        assert!(!reaper.join().unwrap().success());
    }

    #[test]
    fn terminate_counts_a_removed_pidfile_as_exited() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("term.pid"));
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; echo ready; sleep 30"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut ready = String::new();
        io::BufRead::read_line(
            &mut io::BufReader::new(child.stdout.take().unwrap()),
            &mut ready,
        )
        .unwrap();
        pidfile.write(child.id() as i32).unwrap();

        // What a daemon does last on its way out, while its PID is still visible.
        let path = pidfile.path().to_path_buf();
        let remover = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            fs::remove_file(path).unwrap();
        });

        assert!(pidfile.terminate(Duration::from_secs(10)).unwrap());
        remover.join().unwrap();
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn programs_start_stop_and_log() {
        let dir = tempdir().unwrap();
        let mut table = ProgramTable::new(
            vec![
                program("echoer", "echo hello; sleep 30"),
                program("idle", "sleep 30"),
            ],
            dir.path().join("logs"),
            dir.path().to_path_buf(),
        );

        table.start_autostart();
        let rows = table.status(&[]).unwrap();
        assert!(rows.iter().all(|r| r.state == ProgramState::Running));

        let stopped = table.stop(&Target::All).unwrap();
        assert_eq!(stopped, vec!["idle", "echoer"]);

        let log = fs::read_to_string(table.log_path("echoer").unwrap()).unwrap();
        assert!(log.contains("hello"));
        assert!(
            table
                .status(&[])
                .unwrap()
                .iter()
                .all(|r| r.state == ProgramState::Stopped)
        );
    }

    #[test]
    fn stubborn_program_is_killed_after_stop_wait() {
        let dir = tempdir().unwrap();
        let mut spec = program("stubborn", "trap '' TERM; while true; do sleep 0.1; done");
        spec.stop_wait = Duration::from_millis(300);
        let mut table = ProgramTable::new(
            vec![spec],
            dir.path().join("logs"),
            dir.path().to_path_buf(),
        );

        table.start(&Target::All).unwrap();
        thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        table.stop(&Target::Program("stubborn".into())).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(table.status(&[]).unwrap()[0].state, ProgramState::Stopped);
    }

    #[test]
    fn exited_program_reports_exit_code() {
        let dir = tempdir().unwrap();
        let mut table = ProgramTable::new(
            vec![program("short", "exit 3")],
            dir.path().join("logs"),
            dir.path().to_path_buf(),
        );

        table.start(&Target::All).unwrap();
        thread::sleep(Duration::from_millis(300));
        let row = &table.status(&["short".into()]).unwrap()[0];
        assert_eq!(row.state, ProgramState::Exited);
        assert_eq!(row.exit_code, Some(3));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let dir = tempdir().unwrap();
        let mut table = ProgramTable::new(
            vec![program("a", "sleep 1")],
            dir.path().join("logs"),
            dir.path().to_path_buf(),
        );
        assert!(matches!(
            table.start(&Target::Program("ghost".into())),
            Err(ProgramError::UnknownProgram(name)) if name == "ghost"
        ));
        assert!(table.status(&["ghost".into()]).is_err());
    }

    #[test]
    fn signal_kills_running_program() {
        let dir = tempdir().unwrap();
        let mut table = ProgramTable::new(
            vec![program("victim", "sleep 30")],
            dir.path().join("logs"),
            dir.path().to_path_buf(),
        );

        table.start(&Target::All).unwrap();
        assert_eq!(table.signal(&Target::All, "KILL").unwrap(), vec!["victim"]);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(table.status(&[]).unwrap()[0].state, ProgramState::Exited);
        assert!(matches!(
            table.signal(&Target::Program("victim".into()), "TERM"),
            Err(ProgramError::NotRunning(_))
        ));
    }
}
