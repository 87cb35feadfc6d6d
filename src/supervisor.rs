use std::{
    fs, io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    constants::ACCEPT_POLL_INTERVAL,
    daemon::{PidFile, ProgramError, ProgramTable},
    error::{ConfigError, PidFileError},
    ipc::{self, ControlCommand, ControlListener, ControlRequest, ControlResponse, ControlStream},
    logs,
    manifest::{ControlSettings, Manifest},
    runtime,
};

/// Errors emitted by the resident supervising process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Control(#[from] ipc::ControlError),
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Long-lived process that runs the programs of one manifest and answers control
/// requests for them.
pub struct Supervisor {
    programs: ProgramTable,
    settings: ControlSettings,
    pidfile: PidFile,
}

impl Supervisor {
    /// Prepares a supervisor for `manifest`. Program logs go to `<log_dir>/<project>/`.
    pub fn new(
        project: &str,
        manifest: &Manifest,
        working_dir: PathBuf,
    ) -> Result<Self, SupervisorError> {
        let programs = manifest.programs()?;
        let settings = manifest.control_settings()?;
        let pidfile = PidFile::new(
            manifest
                .supervisord()
                .pidfile
                .unwrap_or_else(runtime::supervisor_pid_path),
        );

        Ok(Self {
            programs: ProgramTable::new(programs, runtime::log_dir().join(project), working_dir),
            settings,
            pidfile,
        })
    }

    /// Binds the control endpoint, records the PID, starts the autostart programs and
    /// serves requests until `shutdown` is set or a `Shutdown` request arrives.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), SupervisorError> {
        let listener = ControlListener::bind(&self.settings.endpoint)?;
        self.pidfile.claim()?;
        info!("Supervisor listening on {}", self.settings.endpoint);

        self.programs.start_autostart();

        while !shutdown.load(Ordering::SeqCst) {
            match listener.try_accept() {
                Ok(Some(mut stream)) => {
                    if self.serve(&mut stream) {
                        break;
                    }
                }
                Ok(None) => {
                    self.programs.reap();
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => {
                    error!("Supervisor listener error: {err}");
                    break;
                }
            }
        }

        info!("Supervisor shutting down");
        self.programs.stop_all();
        if let Some(path) = listener.socket_path()
            && let Err(err) = fs::remove_file(path)
        {
            warn!("Failed to remove control socket {}: {err}", path.display());
        }
        // The endpoint is free before the PID file says we are gone.
        drop(listener);
        self.pidfile.remove()?;
        Ok(())
    }

    /// Answers one request. Returns `true` when the supervisor should exit.
    fn serve(&mut self, stream: &mut ControlStream) -> bool {
        let request = match ipc::read_request(stream) {
            Ok(request) => request,
            Err(err) => {
                warn!("Invalid control request: {err}");
                let _ = ipc::write_response(stream, &ControlResponse::Error(err.to_string()));
                return false;
            }
        };

        let (response, shutdown) = self.handle_request(request);
        if let Err(err) = ipc::write_response(stream, &response) {
            warn!("Failed to answer control request: {err}");
        }
        shutdown
    }

    fn handle_request(&mut self, request: ControlRequest) -> (ControlResponse, bool) {
        if !request.is_authorized(&self.settings.credentials) {
            warn!("Rejected control request with wrong credentials");
            return (ControlResponse::Error("authentication failed".into()), false);
        }

        debug!("Supervisor received command: {:?}", request.command);
        let shutdown = matches!(request.command, ControlCommand::Shutdown);
        let response = match self.handle_command(request.command) {
            Ok(response) => response,
            Err(err) => {
                error!("Control command failed: {err}");
                ControlResponse::Error(err.to_string())
            }
        };
        (response, shutdown)
    }

    fn handle_command(&mut self, command: ControlCommand) -> Result<ControlResponse, ProgramError> {
        match command {
            ControlCommand::Start { target } => {
                let started = self.programs.start(&target)?;
                Ok(summary("started", &started))
            }
            ControlCommand::Stop { target } => {
                let stopped = self.programs.stop(&target)?;
                Ok(summary("stopped", &stopped))
            }
            ControlCommand::Restart { target } => {
                let restarted = self.programs.restart(&target)?;
                Ok(summary("restarted", &restarted))
            }
            ControlCommand::Signal { target, signal } => {
                let signalled = self.programs.signal(&target, &signal)?;
                Ok(summary(&format!("signalled with {signal}"), &signalled))
            }
            ControlCommand::Status { names } => Ok(ControlResponse::Status(self.programs.status(&names)?)),
            ControlCommand::Tail { name, lines } => {
                let path = self.programs.log_path(&name)?;
                match logs::tail_lines(&path, lines) {
                    Ok(lines) => Ok(ControlResponse::Log { path, lines }),
                    Err(err) => Ok(ControlResponse::Error(format!(
                        "failed to read {}: {err}",
                        path.display()
                    ))),
                }
            }
            ControlCommand::Shutdown => Ok(ControlResponse::Message("Supervisor shutting down".into())),
        }
    }
}

fn summary(verb: &str, names: &[String]) -> ControlResponse {
    if names.is_empty() {
        ControlResponse::Ok
    } else {
        ControlResponse::Message(
            names
                .iter()
                .map(|name| format!("{name}: {verb}"))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}
