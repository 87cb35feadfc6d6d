//! Client side of the supervising process: launching it, and every lifecycle request
//! addressed to it through the control channel.
//!
//! Each request regenerates the manifest from the current services, so the endpoint
//! and credentials always match what the configuration says right now.
use std::{
    io::Write,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    config::ServiceSpec,
    constants::{CONTROL_IO_TIMEOUT, LAUNCH_TIMEOUT, RELOAD_GRACE_PERIOD, STOP_POLL_INTERVAL},
    daemon::{Fork, PidFile, daemonize},
    error::{ConfigError, OperationError},
    ipc::{self, ControlCommand, ControlResponse, Target},
    logs,
    manifest::{self, Manifest, MergeOptions},
    runtime,
    supervisor::{Supervisor, SupervisorError},
};

/// Result of a request that reached, or tried to reach, the supervising process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The supervising process answered.
    Done(ControlResponse),
    /// The control channel failed; the failure has been logged.
    Failed(String),
}

/// Handle on the supervising process of one project.
pub struct ControlPlane {
    project: String,
    project_dir: PathBuf,
    services: Vec<ServiceSpec>,
    options: MergeOptions,
    pidfile: PidFile,
}

impl ControlPlane {
    /// `services` must already be in dependency order.
    pub fn new(
        project: &str,
        project_dir: PathBuf,
        services: Vec<ServiceSpec>,
        mut options: MergeOptions,
    ) -> Self {
        let pid_path = options
            .pidfile
            .get_or_insert_with(runtime::supervisor_pid_path)
            .clone();
        options
            .logfile
            .get_or_insert_with(|| runtime::log_dir().join("supervisor.log"));

        Self {
            project: project.to_string(),
            project_dir,
            services,
            options,
            pidfile: PidFile::new(pid_path),
        }
    }

    pub fn pidfile(&self) -> &PidFile {
        &self.pidfile
    }

    /// Merges the current manifest.
    pub fn manifest(&self) -> Result<Manifest, ConfigError> {
        manifest::merge(&self.project, &self.services, &self.options)
    }

    /// True iff the PID file names a live process. A stale file is removed.
    pub fn is_running(&self) -> Result<bool, OperationError> {
        Ok(self.pidfile.is_running()?)
    }

    fn ensure_running(&self) -> Result<(), OperationError> {
        if self.is_running()? {
            Ok(())
        } else {
            Err(OperationError::NotRunning)
        }
    }

    /// Launches the supervising process in the background unless it already runs.
    ///
    /// Returns `false` when it was already running. An invalid manifest is logged and
    /// returned before anything is launched.
    pub fn run(&self) -> Result<bool, OperationError> {
        if self.is_running()? {
            debug!("Supervising process already running");
            return Ok(false);
        }

        let manifest = self.manifest().inspect_err(|err| {
            error!("Refusing to launch the supervising process: {err}");
        })?;
        let log_file = manifest
            .supervisord()
            .logfile
            .unwrap_or_else(|| runtime::log_dir().join("supervisor.log"));

        match daemonize(&log_file)? {
            Fork::Parent => {}
            Fork::Daemon => {
                let code = match self.supervise(&manifest) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!("Supervising process exited: {err}");
                        1
                    }
                };
                std::process::exit(code);
            }
        }

        let deadline = Instant::now() + LAUNCH_TIMEOUT;
        while Instant::now() < deadline {
            if self.is_running()? {
                info!("Supervising process for '{}' started", self.project);
                return Ok(true);
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }

        Err(OperationError::Launch(format!(
            "no PID in {} after {LAUNCH_TIMEOUT:?}; see {}",
            self.pidfile.path().display(),
            log_file.display()
        )))
    }

    fn supervise(&self, manifest: &Manifest) -> Result<(), SupervisorError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let shutdown = Arc::clone(&shutdown);
            ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
                .map_err(std::io::Error::other)?;
        }

        Supervisor::new(&self.project, manifest, self.project_dir.clone())?.run(&shutdown)
    }

    /// Sends `command` with a fresh manifest. Channel failures become
    /// [`ControlOutcome::Failed`] after being logged.
    ///
    /// The reply may take as long as stopping every program, so the wait covers the
    /// manifest's stop budget on top of the usual channel timeout.
    fn request(&self, command: ControlCommand) -> Result<ControlOutcome, OperationError> {
        self.ensure_running()?;
        let manifest = self.manifest()?;
        let settings = manifest.control_settings()?;
        let timeout = CONTROL_IO_TIMEOUT + manifest.stop_budget()?;

        match ipc::send_command_within(&settings, command, timeout) {
            Ok(response) => Ok(ControlOutcome::Done(response)),
            Err(err) => {
                warn!("Control request to the supervising process failed: {err}");
                Ok(ControlOutcome::Failed(err.to_string()))
            }
        }
    }

    pub fn start(&self, target: &str) -> Result<ControlOutcome, OperationError> {
        self.request(ControlCommand::Start {
            target: Target::parse(target),
        })
    }

    pub fn stop(&self, target: &str) -> Result<ControlOutcome, OperationError> {
        self.request(ControlCommand::Stop {
            target: Target::parse(target),
        })
    }

    pub fn restart(&self, target: &str) -> Result<ControlOutcome, OperationError> {
        self.request(ControlCommand::Restart {
            target: Target::parse(target),
        })
    }

    pub fn signal(&self, target: &str, signal: &str) -> Result<ControlOutcome, OperationError> {
        self.request(ControlCommand::Signal {
            target: Target::parse(target),
            signal: signal.to_string(),
        })
    }

    /// Status rows for `names`, or every program when empty.
    pub fn status(&self, names: &[String]) -> Result<ControlOutcome, OperationError> {
        self.request(ControlCommand::Status {
            names: names.to_vec(),
        })
    }

    /// Writes the last `tail` lines of the program log to `out`, then keeps copying
    /// new output while `follow` and `running` hold.
    pub fn logs(
        &self,
        name: &str,
        follow: bool,
        tail: Option<usize>,
        out: &mut impl Write,
        running: &AtomicBool,
    ) -> Result<ControlOutcome, OperationError> {
        let outcome = self.request(ControlCommand::Tail {
            name: name.to_string(),
            lines: tail,
        })?;

        if let ControlOutcome::Done(ControlResponse::Log { path, lines }) = &outcome {
            for line in lines {
                writeln!(out, "{line}")?;
            }
            out.flush()?;
            if follow {
                logs::follow(path, out, running)?;
            }
        }
        Ok(outcome)
    }

    /// Asks the supervising process to stop its programs and exit, then waits for it.
    pub fn shutdown(&self) -> Result<ControlOutcome, OperationError> {
        let outcome = self.request(ControlCommand::Shutdown)?;
        if matches!(outcome, ControlOutcome::Done(_)) {
            self.wait_until_stopped(LAUNCH_TIMEOUT + self.manifest()?.stop_budget()?);
        }
        Ok(outcome)
    }

    /// Terminates the supervising process, waits until it has stopped its programs and
    /// exited, then launches it again from a fresh manifest.
    ///
    /// The wait is bounded by the grace period plus the stop budget of the manifest. A
    /// process still alive after that is an error and nothing new is launched.
    pub fn reload(&self) -> Result<(), OperationError> {
        let manifest = self.manifest().inspect_err(|err| {
            error!("Refusing to reload the supervising process: {err}");
        })?;

        if let Some(pid) = self.pidfile.running_pid()? {
            let waited = RELOAD_GRACE_PERIOD + manifest.stop_budget()?;
            info!(
                "Reloading supervising process for '{}' (PID {pid}, waiting up to {waited:?})",
                self.project
            );
            if !self.pidfile.terminate(waited)? {
                return Err(OperationError::StillRunning { pid, waited });
            }
        }

        if self.run()? {
            Ok(())
        } else {
            Err(OperationError::Launch(
                "another supervising process took over during reload".into(),
            ))
        }
    }

    fn wait_until_stopped(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.pidfile.is_running() {
                Ok(false) => return,
                Ok(true) => thread::sleep(STOP_POLL_INTERVAL),
                Err(err) => {
                    warn!("Failed to check supervising process: {err}");
                    return;
                }
            }
        }
        warn!("Supervising process still running after {timeout:?}");
    }
}
