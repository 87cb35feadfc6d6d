//! Tandem is a local device agent. It supervises a project's services in dependency
//! order through a detached supervising process, and keeps the project configuration
//! in sync with the other devices of a fleet over MQTT.

/// CLI interface.
pub mod cli;

/// Project configuration loading.
pub mod config;

/// Fixed intervals and defaults.
pub mod constants;

/// Client side of the supervising process.
pub mod control;

/// PID files, the program table and detaching.
pub mod daemon;

/// Error handling.
pub mod error;

/// Control-channel protocol.
pub mod ipc;

/// Log tail and follow.
pub mod logs;

/// Manifest text model and merge engine.
pub mod manifest;

/// Host metrics snapshots.
pub mod metrics;

/// Service ordering.
pub mod resolver;

/// Runtime paths.
pub mod runtime;

/// Program status rows.
pub mod status;

/// The supervising process.
pub mod supervisor;

/// Fleet configuration sync.
pub mod sync;

/// Orchestration facade.
pub mod system;

#[doc(hidden)]
pub mod test_utils;
