//! Error handling for tandem.
use thiserror::Error;

use crate::{ipc::ControlError, sync::SyncError};

/// Errors raised while loading or merging configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A `${VAR}` reference has no value in the environment.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    /// A service entry has no usable name.
    #[error("Service entry #{0} has no name")]
    UnnamedService(usize),

    /// Two service entries share one name.
    #[error("Service '{0}' is defined more than once")]
    DuplicateService(String),

    /// A program section reached the final manifest without a command.
    #[error("Process name '{program}' has no command configured")]
    MissingCommand {
        /// The program whose section lacks `command`.
        program: String,
    },

    /// Lookup of a service name that the configuration does not define.
    #[error("No such service: {0}")]
    NoSuchService(String),

    /// Manifest text could not be interpreted.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

/// Errors raised while ordering services by their references.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DependencyError {
    /// A service lists itself in `links`.
    #[error("A service can not link to itself: {0}")]
    SelfLink(String),

    /// A service lists itself in `volumes_from`.
    #[error("A service can not mount itself as volume: {0}")]
    SelfVolume(String),

    /// A service lists itself in `depends_on`.
    #[error("A service can not depend on itself: {0}")]
    SelfDependsOn(String),

    /// Any other cycle; `ancestors` are the in-progress services, in visit order.
    #[error("Circular dependency between {}", ancestors.join(" and "))]
    Circular {
        /// Services on the path that closed the cycle.
        ancestors: Vec<String>,
    },

    /// A reference names a service that is not defined.
    #[error("Service '{service}' references undefined service '{dependency}'")]
    UnknownService {
        /// The referencing service.
        service: String,
        /// The missing name.
        dependency: String,
    },
}

/// Error type for single-PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing a PID file.
    #[error("Failed to access PID file: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but does not hold a decimal PID.
    #[error("PID file {path} holds '{contents}', not a process id")]
    Malformed {
        /// Location of the offending file.
        path: String,
        /// What was found instead.
        contents: String,
    },

    /// The PID file names a process that is still alive.
    #[error("Daemon already running with PID {0}")]
    AlreadyRunning(i32),
}

/// Errors surfaced by the orchestration facade to the command dispatcher.
#[derive(Debug, Error)]
pub enum OperationError {
    /// A control operation was requested before `up`.
    #[error("Services must first be started with 'up'")]
    NotRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Failed to launch supervising process: {0}")]
    Launch(String),

    /// The supervising process outlived its stop budget during a reload.
    #[error("Supervising process {pid} still running after {waited:?}; nothing relaunched")]
    StillRunning { pid: i32, waited: std::time::Duration },

    /// `logs --follow` was asked for more than one service.
    #[error("Only a single service can be followed")]
    FollowNeedsOneService,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
