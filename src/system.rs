//! The project as the command line sees it: ordered services plus the handles on the
//! supervising process and the sync daemon.
//!
//! A `System` is rebuilt for every command; whether anything runs is only ever read
//! from the two PID files.
use std::{
    collections::HashSet,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use tracing::{info, warn};

use crate::{
    config::{self, Config, ServiceSpec},
    constants::DEFAULT_KILL_SIGNAL,
    control::{ControlOutcome, ControlPlane},
    error::{ConfigError, OperationError},
    manifest::{Manifest, MergeOptions},
    resolver,
    sync::{SyncDaemon, SyncError},
};

/// Where a system comes from, as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct SystemOptions {
    /// Explicit project name; falls back to the environment and the directory name.
    pub project: Option<String>,
    /// Credential file section used by the sync daemon.
    pub context: String,
    /// Extra merge layers for the manifest.
    pub merge: MergeOptions,
}

pub struct System {
    pub name: String,
    pub config_version: String,
    /// Services in dependency order.
    services: Vec<ServiceSpec>,
    config_path: PathBuf,
    control: ControlPlane,
    sync: SyncDaemon,
}

impl System {
    /// Loads the configuration file and builds the system.
    pub fn load(config_path: &Path, options: SystemOptions) -> Result<Self, OperationError> {
        let config = config::load_config(config_path)?;
        let name = config::project_name(options.project.as_deref(), &config.project_dir);
        Self::from_config(&name, config, config_path, options)
    }

    /// Orders the services of `config` and wires up both daemons.
    pub fn from_config(
        name: &str,
        config: Config,
        config_path: &Path,
        options: SystemOptions,
    ) -> Result<Self, OperationError> {
        let services = resolver::sort_services(&config.services)?;
        let project_dir = std::path::absolute(&config.project_dir)?;
        let control = ControlPlane::new(name, project_dir, services.clone(), options.merge);
        let sync = SyncDaemon::new(config_path, &options.context)?;

        Ok(Self {
            name: name.to_string(),
            config_version: config.version,
            services,
            config_path: config_path.to_path_buf(),
            control,
            sync,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn sync_daemon(&self) -> &SyncDaemon {
        &self.sync
    }

    /// Services in dependency order.
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    pub fn get_service(&self, name: &str) -> Result<&ServiceSpec, ConfigError> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::NoSuchService(name.to_string()))
    }

    pub fn validate_service_names(&self, names: &[String]) -> Result<(), ConfigError> {
        names.iter().try_for_each(|name| self.get_service(name).map(|_| ()))
    }

    /// The named services in dependency order without duplicates; all of them for an
    /// empty list.
    pub fn get_services(&self, names: &[String]) -> Result<Vec<&ServiceSpec>, ConfigError> {
        self.validate_service_names(names)?;
        if names.is_empty() {
            return Ok(self.services.iter().collect());
        }
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        Ok(self
            .services
            .iter()
            .filter(|s| wanted.contains(s.name.as_str()))
            .collect())
    }

    /// The merged manifest for the current configuration.
    pub fn manifest(&self) -> Result<Manifest, ConfigError> {
        self.control.manifest()
    }

    fn targets(&self, names: &[String]) -> Result<Vec<String>, ConfigError> {
        if names.is_empty() {
            return Ok(vec!["all".to_string()]);
        }
        Ok(self
            .get_services(names)?
            .into_iter()
            .map(|s| s.name.clone())
            .collect())
    }

    /// Launches everything when nothing runs yet, otherwise starts the named services.
    pub fn up(&self, names: &[String]) -> Result<Vec<ControlOutcome>, OperationError> {
        self.validate_service_names(names)?;
        if names.is_empty() && !self.control.is_running()? {
            self.start_sync_daemon()?;
            self.control.run()?;
            return Ok(Vec::new());
        }
        self.start(names)
    }

    fn start_sync_daemon(&self) -> Result<(), OperationError> {
        match self.sync.start() {
            Ok(true) => info!("Config sync daemon started"),
            Ok(false) => {}
            Err(
                err @ (SyncError::CredentialFileMissing(_)
                | SyncError::UnknownContext(_)
                | SyncError::NotRegistered
                | SyncError::MissingCredential(_)),
            ) => warn!("Config sync disabled: {err}"),
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Stops the named services; with none, also shuts down the supervising process and
    /// the sync daemon.
    pub fn down(&self, names: &[String]) -> Result<Vec<ControlOutcome>, OperationError> {
        if !names.is_empty() {
            return self.stop(names);
        }

        let mut outcomes = Vec::new();
        if self.control.is_running()? {
            outcomes.push(self.control.shutdown()?);
        }
        if !self.sync.stop()? {
            warn!("Config sync daemon did not stop");
        }
        Ok(outcomes)
    }

    pub fn start(&self, names: &[String]) -> Result<Vec<ControlOutcome>, OperationError> {
        self.targets(names)?
            .iter()
            .map(|target| self.control.start(target))
            .collect()
    }

    /// Stops dependents before their dependencies.
    pub fn stop(&self, names: &[String]) -> Result<Vec<ControlOutcome>, OperationError> {
        self.targets(names)?
            .iter()
            .rev()
            .map(|target| self.control.stop(target))
            .collect()
    }

    pub fn restart(&self, names: &[String]) -> Result<Vec<ControlOutcome>, OperationError> {
        self.targets(names)?
            .iter()
            .map(|target| self.control.restart(target))
            .collect()
    }

    /// Sends `signal` (SIGKILL by default) to the named services.
    pub fn kill(
        &self,
        names: &[String],
        signal: Option<&str>,
    ) -> Result<Vec<ControlOutcome>, OperationError> {
        let signal = signal.unwrap_or(DEFAULT_KILL_SIGNAL);
        self.targets(names)?
            .iter()
            .map(|target| self.control.signal(target, signal))
            .collect()
    }

    pub fn top(&self, names: &[String]) -> Result<ControlOutcome, OperationError> {
        let names: Vec<String> = self
            .get_services(names)?
            .into_iter()
            .map(|s| s.name.clone())
            .collect();
        self.control.status(&names)
    }

    /// Prints the log tail of each service; `follow` needs exactly one service.
    pub fn logs(
        &self,
        names: &[String],
        follow: bool,
        tail: Option<usize>,
        out: &mut impl Write,
        running: &AtomicBool,
    ) -> Result<Vec<ControlOutcome>, OperationError> {
        let services = self.get_services(names)?;
        if follow && services.len() != 1 {
            return Err(OperationError::FollowNeedsOneService);
        }

        let mut outcomes = Vec::new();
        for service in &services {
            if services.len() > 1 {
                writeln!(out, "==> {} <==", service.name)?;
            }
            outcomes.push(self.control.logs(&service.name, follow, tail, out, running)?);
        }
        Ok(outcomes)
    }

    pub fn reload(&self) -> Result<(), OperationError> {
        self.control.reload()
    }
}
