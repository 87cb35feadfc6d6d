//! Supervision manifest: the INI text the supervising process runs from, and the
//! merge engine that derives it from the service definitions.
//!
//! A manifest is built in layers. The built-in defaults come first, then any extra
//! manifest text from the project, one `[program:<name>]` section per service, the
//! option layer (pidfile, launch/exclude lists), and finally the two pseudo-sections:
//! `[program:__defaults__]` fills options a program lacks, `[program:__overrides__]`
//! replaces them on every program. Excluded programs are dropped, a control channel
//! with deterministic credentials is ensured, and every remaining program must have a
//! command.
use nix::sys::signal::Signal;
use sha2::{Digest, Sha256};
use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{
    config::ServiceSpec,
    constants::{
        CONTROL_PORT_BASE, DEFAULT_MANIFEST, DEFAULT_STOP_WAIT, DEFAULTS_SECTION,
        INET_SERVER_SECTION, OVERRIDES_SECTION, PROGRAM_PREFIX, SUPERVISORCTL_SECTION,
        SUPERVISORD_SECTION, UNIX_SERVER_SECTION,
    },
    error::ConfigError,
    ipc::ControlEndpoint,
    runtime,
};

/// One `[name]` block with its options in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    /// The section header without brackets.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Program name for `program:<name>` sections.
    pub fn program_name(&self) -> Option<&str> {
        self.name.strip_prefix(PROGRAM_PREFIX)
    }

    /// Value of an option, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the option is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets an option, replacing any previous value in place.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = key.to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Options in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn append_to_last(&mut self, continuation: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, value)) => {
                value.push('\n');
                value.push_str(continuation);
                true
            }
            None => false,
        }
    }
}

/// Ordered collection of sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    sections: Vec<Section>,
}

impl Manifest {
    /// Parses manifest text into a fresh manifest.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut manifest = Self::default();
        manifest.read_str(text)?;
        Ok(manifest)
    }

    /// Reads more manifest text on top of this one. Sections seen before are merged and
    /// later values win.
    pub fn read_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let mut current: Option<usize> = None;

        for (number, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if raw_line.starts_with(char::is_whitespace) {
                if let Some(index) = current
                    && self.sections[index].append_to_last(line)
                {
                    continue;
                }
            }

            if let Some(header) = line.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or_else(|| {
                    ConfigError::InvalidManifest(format!(
                        "line {}: unterminated section header '{line}'",
                        number + 1
                    ))
                })?;
                current = Some(self.ensure_section(name.trim()));
                continue;
            }

            let Some(index) = current else {
                return Err(ConfigError::InvalidManifest(format!(
                    "line {}: option outside of any section",
                    number + 1
                )));
            };

            let delimiter = line.find(['=', ':']).ok_or_else(|| {
                ConfigError::InvalidManifest(format!(
                    "line {}: expected 'key = value', found '{line}'",
                    number + 1
                ))
            })?;
            let (key, value) = line.split_at(delimiter);
            self.sections[index].set(key.trim(), value[1..].trim());
        }

        Ok(())
    }

    /// Renders the manifest as INI text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in &section.entries {
                let value = value.replace('\n', "\n\t");
                let _ = writeln!(out, "{key} = {value}");
            }
            out.push('\n');
        }
        out
    }

    /// All sections in order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    fn ensure_section(&mut self, name: &str) -> usize {
        match self.sections.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        }
    }

    /// Mutable access to a section, creating it at the end when missing.
    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        let index = self.ensure_section(name);
        &mut self.sections[index]
    }

    /// Removes a section and returns it.
    pub fn remove_section(&mut self, name: &str) -> Option<Section> {
        let index = self.sections.iter().position(|s| s.name == name)?;
        Some(self.sections.remove(index))
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.section_mut(section).set(key, value);
    }

    /// Sets the option only when it is absent, creating the section if needed.
    pub fn set_if_missing(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let section = self.section_mut(section);
        if !section.contains(key) {
            section.set(key, value);
        }
    }

    fn is_pseudo_program(name: &str) -> bool {
        name == DEFAULTS_SECTION || name == OVERRIDES_SECTION
    }

    /// Concrete `program:*` sections, pseudo-sections excluded.
    pub fn program_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections
            .iter()
            .filter(|s| s.name.starts_with(PROGRAM_PREFIX) && !Self::is_pseudo_program(&s.name))
    }

    /// Names of the concrete programs in manifest order.
    pub fn program_names(&self) -> Vec<String> {
        self.program_sections()
            .filter_map(|s| s.program_name().map(str::to_string))
            .collect()
    }

    fn apply_defaults(&mut self) {
        let Some(defaults) = self.remove_section(DEFAULTS_SECTION) else {
            return;
        };
        for section in self.sections.iter_mut().filter(|s| {
            s.name.starts_with(PROGRAM_PREFIX) && !Self::is_pseudo_program(&s.name)
        }) {
            for (key, value) in defaults.entries() {
                if !section.contains(key) {
                    section.set(key, value);
                }
            }
        }
    }

    fn apply_overrides(&mut self) {
        let Some(overrides) = self.remove_section(OVERRIDES_SECTION) else {
            return;
        };
        for section in self.sections.iter_mut().filter(|s| {
            s.name.starts_with(PROGRAM_PREFIX) && !Self::is_pseudo_program(&s.name)
        }) {
            for (key, value) in overrides.entries() {
                section.set(key, value);
            }
        }
    }

    fn remove_excluded(&mut self) -> Result<(), ConfigError> {
        let mut kept = Vec::with_capacity(self.sections.len());
        for section in self.sections.drain(..) {
            let excluded = match section.get("exclude") {
                Some(raw) => parse_bool(raw).ok_or_else(|| {
                    ConfigError::InvalidManifest(format!(
                        "section '{}' has non-boolean exclude '{raw}'",
                        section.name
                    ))
                })?,
                None => false,
            };
            if !excluded {
                kept.push(section);
            }
        }
        self.sections = kept;
        Ok(())
    }

    /// Fails when any program section lacks a non-empty `command`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for section in self.program_sections() {
            let has_command = section.get("command").is_some_and(|c| !c.trim().is_empty());
            if !has_command {
                return Err(ConfigError::MissingCommand {
                    program: section.program_name().unwrap_or_default().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Typed view of every program, in manifest order.
    pub fn programs(&self) -> Result<Vec<ProgramSpec>, ConfigError> {
        self.validate()?;
        self.program_sections().map(ProgramSpec::from_section).collect()
    }

    /// Time the supervising process may spend stopping every program, one after another.
    pub fn stop_budget(&self) -> Result<Duration, ConfigError> {
        Ok(self.programs()?.iter().map(|p| p.stop_wait).sum())
    }

    /// Control endpoint and credentials clients should use.
    pub fn control_settings(&self) -> Result<ControlSettings, ConfigError> {
        let missing = |key: &str| {
            ConfigError::InvalidManifest(format!("[{SUPERVISORCTL_SECTION}] has no {key}"))
        };
        let serverurl = self
            .get(SUPERVISORCTL_SECTION, "serverurl")
            .ok_or_else(|| missing("serverurl"))?;
        let endpoint = ControlEndpoint::from_url(serverurl)
            .map_err(|err| ConfigError::InvalidManifest(err.to_string()))?;

        Ok(ControlSettings {
            endpoint,
            credentials: ControlCredentials {
                username: self
                    .get(SUPERVISORCTL_SECTION, "username")
                    .ok_or_else(|| missing("username"))?
                    .to_string(),
                password: self
                    .get(SUPERVISORCTL_SECTION, "password")
                    .ok_or_else(|| missing("password"))?
                    .to_string(),
            },
        })
    }

    /// Global options of the supervising process.
    pub fn supervisord(&self) -> SupervisordSettings {
        let section = self.section(SUPERVISORD_SECTION);
        let get = |key: &str| section.and_then(|s| s.get(key));
        SupervisordSettings {
            pidfile: get("pidfile").map(PathBuf::from),
            logfile: get("logfile").map(PathBuf::from),
            loglevel: get("loglevel").unwrap_or("info").to_string(),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parses `TERM`, `SIGTERM` or `15` into a signal.
pub fn parse_signal(raw: &str) -> Option<Signal> {
    let trimmed = raw.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number).ok();
    }
    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).ok()
}

/// Username/password pair guarding the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCredentials {
    pub username: String,
    pub password: String,
}

/// Where and how to reach the supervising process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSettings {
    pub endpoint: ControlEndpoint,
    pub credentials: ControlCredentials,
}

/// Options of the `[supervisord]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisordSettings {
    pub pidfile: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub loglevel: String,
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Derives the control credentials from a project-identifying string.
///
/// The same project always yields the same pair, so nothing secret has to be stored.
pub fn derive_credentials(project: &str) -> ControlCredentials {
    let username = sha256_hex(project)[..7].to_string();
    let password = sha256_hex(&username);
    ControlCredentials { username, password }
}

/// Stable port in the 9000-9999 range derived from the control password.
pub fn derive_port(credentials: &ControlCredentials) -> u16 {
    let digest = sha256_hex(&credentials.password);
    let bucket = u16::from_str_radix(&digest[..3], 16).unwrap_or(0) % 1000;
    CONTROL_PORT_BASE + bucket
}

/// A program as the supervising process runs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub name: String,
    pub command: String,
    pub autostart: bool,
    pub redirect_stderr: bool,
    pub directory: Option<PathBuf>,
    pub environment: Vec<(String, String)>,
    pub stop_wait: Duration,
    pub stop_signal: Signal,
}

impl ProgramSpec {
    fn from_section(section: &Section) -> Result<Self, ConfigError> {
        let name = section.program_name().unwrap_or_default().to_string();
        let invalid = |key: &str, raw: &str| {
            ConfigError::InvalidManifest(format!("program '{name}' has invalid {key} '{raw}'"))
        };
        let flag = |key: &str, default: bool| match section.get(key) {
            Some(raw) => parse_bool(raw).ok_or_else(|| invalid(key, raw)),
            None => Ok(default),
        };

        let stop_wait = match section.get("stopwaitsecs") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse()
                    .map_err(|_| invalid("stopwaitsecs", raw))?,
            ),
            None => DEFAULT_STOP_WAIT,
        };
        let stop_signal = match section.get("stopsignal") {
            Some(raw) => parse_signal(raw).ok_or_else(|| invalid("stopsignal", raw))?,
            None => Signal::SIGTERM,
        };

        let autostart = flag("autostart", true)?;
        let redirect_stderr = flag("redirect_stderr", false)?;

        Ok(Self {
            command: section.get("command").unwrap_or_default().to_string(),
            autostart,
            redirect_stderr,
            directory: section.get("directory").map(PathBuf::from),
            environment: section
                .get("environment")
                .map(parse_environment)
                .unwrap_or_default(),
            stop_wait,
            stop_signal,
            name,
        })
    }
}

/// Parses `KEY="value",OTHER=value` into pairs.
fn parse_environment(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Caller-supplied layers of a merge.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Extra manifest text read after the built-in defaults.
    pub extra: Option<String>,
    /// `[supervisord] pidfile`.
    pub pidfile: Option<PathBuf>,
    /// `[supervisord] logfile`.
    pub logfile: Option<PathBuf>,
    /// Programs forced to start automatically.
    pub launch: Vec<String>,
    /// Programs that only start on request.
    pub nolaunch: Vec<String>,
    /// Programs re-included after an exclusion elsewhere.
    pub include: Vec<String>,
    /// Programs removed from the manifest.
    pub exclude: Vec<String>,
    /// Weak defaults for every program.
    pub defaults: Vec<(String, String)>,
    /// Strong overrides for every program.
    pub overrides: Vec<(String, String)>,
    /// Control over a Unix socket instead of TCP.
    pub unix_socket: Option<PathBuf>,
}

fn program_section(name: &str) -> String {
    format!("{PROGRAM_PREFIX}{name}")
}

/// Builds the manifest for `project` from services already in dependency order.
pub fn merge(
    project: &str,
    services: &[ServiceSpec],
    options: &MergeOptions,
) -> Result<Manifest, ConfigError> {
    let mut manifest = Manifest::parse(DEFAULT_MANIFEST)?;

    if let Some(extra) = &options.extra {
        manifest.read_str(extra)?;
    }

    for service in services {
        let section = manifest.section_mut(&program_section(&service.name));
        for (key, value) in service.supervisor_options() {
            section.set(&key, value);
        }
        if let Some(command) = service.command.as_deref().filter(|c| !c.trim().is_empty()) {
            section.set("command", command);
        }
    }

    apply_option_layer(&mut manifest, options);
    manifest.apply_defaults();
    manifest.apply_overrides();
    ensure_control_channel(&mut manifest, project);
    manifest.remove_excluded()?;
    manifest.validate()?;

    Ok(manifest)
}

fn apply_option_layer(manifest: &mut Manifest, options: &MergeOptions) {
    if let Some(pidfile) = &options.pidfile {
        manifest.set(SUPERVISORD_SECTION, "pidfile", display(pidfile));
    }
    if let Some(logfile) = &options.logfile {
        manifest.set(SUPERVISORD_SECTION, "logfile", display(logfile));
    }
    for name in &options.launch {
        manifest.set(&program_section(name), "autostart", "true");
    }
    for name in &options.nolaunch {
        manifest.set(&program_section(name), "autostart", "false");
    }
    for name in &options.exclude {
        manifest.set(&program_section(name), "exclude", "true");
    }
    for name in &options.include {
        manifest.set(&program_section(name), "exclude", "false");
    }
    for (key, value) in &options.defaults {
        manifest.set(DEFAULTS_SECTION, key, value.clone());
    }
    for (key, value) in &options.overrides {
        manifest.set(OVERRIDES_SECTION, key, value.clone());
    }
    if let Some(socket) = &options.unix_socket {
        manifest.set_if_missing(UNIX_SERVER_SECTION, "file", display(socket));
    }
}

fn ensure_control_channel(manifest: &mut Manifest, project: &str) {
    let credentials = derive_credentials(project);

    let serverurl = if manifest.has_section(UNIX_SERVER_SECTION) {
        manifest.set_if_missing(
            UNIX_SERVER_SECTION,
            "file",
            display(&runtime::control_socket_path()),
        );
        manifest.set_if_missing(UNIX_SERVER_SECTION, "username", credentials.username.clone());
        manifest.set_if_missing(UNIX_SERVER_SECTION, "password", credentials.password.clone());
        format!(
            "unix://{}",
            manifest.get(UNIX_SERVER_SECTION, "file").unwrap_or_default()
        )
    } else {
        let address = format!("127.0.0.1:{}", derive_port(&credentials));
        manifest.set_if_missing(INET_SERVER_SECTION, "port", address);
        manifest.set_if_missing(INET_SERVER_SECTION, "username", credentials.username.clone());
        manifest.set_if_missing(INET_SERVER_SECTION, "password", credentials.password.clone());
        format!(
            "http://{}",
            manifest.get(INET_SERVER_SECTION, "port").unwrap_or_default()
        )
    };

    manifest.set_if_missing(SUPERVISORCTL_SECTION, "serverurl", serverurl);
    manifest.set_if_missing(SUPERVISORCTL_SECTION, "username", credentials.username);
    manifest.set_if_missing(SUPERVISORCTL_SECTION, "password", credentials.password);
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
