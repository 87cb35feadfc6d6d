//! Constants shared by the supervising process, the control plane and the sync daemon.
//!
//! Keeping the intervals and defaults in one place makes the timing contract of the
//! agent visible at a glance.

use std::time::Duration;

// ============================================================================
// Project configuration
// ============================================================================

/// Configuration file names tried when `--file` is not given, in order.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["tandem.yml", "tandem.yaml"];

/// Environment variable consulted for the project name.
pub const PROJECT_NAME_ENV: &str = "TANDEM_PROJECT_NAME";

/// Project name used when nothing else yields a non-empty one.
pub const DEFAULT_PROJECT_NAME: &str = "default";

// ============================================================================
// Manifest
// ============================================================================

/// Prefix of every process section in the manifest.
pub const PROGRAM_PREFIX: &str = "program:";

/// Weak defaults copied into program sections that lack an option.
pub const DEFAULTS_SECTION: &str = "program:__defaults__";

/// Strong overrides force-written onto every program section.
pub const OVERRIDES_SECTION: &str = "program:__overrides__";

/// Global options of the supervising process.
pub const SUPERVISORD_SECTION: &str = "supervisord";

/// Client side of the control channel.
pub const SUPERVISORCTL_SECTION: &str = "supervisorctl";

/// TCP control server section.
pub const INET_SERVER_SECTION: &str = "inet_http_server";

/// Unix-domain control server section.
pub const UNIX_SERVER_SECTION: &str = "unix_http_server";

/// Built-in manifest text every merge starts from.
pub const DEFAULT_MANIFEST: &str = "
; All programs share these defaults unless they set their own.
[program:__defaults__]
redirect_stderr=true

[supervisord]
loglevel=warn

[supervisorctl]
";

/// Base of the synthesized control port range (9000-9999).
pub const CONTROL_PORT_BASE: u16 = 9000;

// ============================================================================
// Supervising process
// ============================================================================

/// How long a stopping program gets before SIGKILL, unless `stopwaitsecs` says otherwise.
pub const DEFAULT_STOP_WAIT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a program to exit.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval of the control listener when no client is connected.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between terminating the supervising process and relaunching it.
pub const RELOAD_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// How long `run()` waits for the freshly launched supervising process to write its PID.
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Read/write timeout on a single control-channel round trip.
pub const CONTROL_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of log lines `logs` shows when `--tail` is not given.
pub const DEFAULT_TAIL_LINES: usize = 1600;

/// Poll interval while following a log file.
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Signal sent by `kill` when none is named.
pub const DEFAULT_KILL_SIGNAL: &str = "SIGKILL";

// ============================================================================
// Config sync daemon
// ============================================================================

/// Credential section used when `--context` is not given.
pub const DEFAULT_CONTEXT: &str = "fleet";

/// Interval between two presence heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A metrics snapshot is published every this many heartbeats.
pub const METRICS_EVERY_HEARTBEATS: u64 = 12;

/// Sleep slice of the cooperative loop between scheduler checks.
pub const SYNC_TICK: Duration = Duration::from_millis(100);

/// MQTT keep-alive.
pub const BROKER_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Capacity of the MQTT request channel.
pub const BROKER_CHANNEL_CAPACITY: usize = 10;

/// Port assumed when the broker URL omits one.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// How long `SyncDaemon::stop` waits for the daemon to exit.
pub const SYNC_STOP_TIMEOUT: Duration = Duration::from_secs(5);
