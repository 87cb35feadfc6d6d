//! Configuration management for tandem.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use crate::{
    constants::{DEFAULT_CONFIG_FILES, DEFAULT_PROJECT_NAME, PROJECT_NAME_ENV},
    error::ConfigError,
};

/// Represents the structure of the configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Service definitions in document order.
    pub services: Vec<ServiceSpec>,
    /// Directory the configuration file lives in.
    pub project_dir: PathBuf,
}

/// One named process definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique key within a system. Filled from the mapping key when services are a map.
    #[serde(default)]
    pub name: String,
    /// Command used to start the process.
    #[serde(default)]
    pub command: Option<String>,
    /// Linked services, `name` or `name:alias`.
    #[serde(default)]
    pub links: Vec<String>,
    /// Services that must start before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Volume sources, `name`, `name:mode`, `service:name` or `container:name`.
    #[serde(default)]
    pub volumes_from: Vec<String>,
    /// PID namespace reference, e.g. `service:db`.
    #[serde(default)]
    pub pid: Option<String>,
    /// Target platform hint.
    #[serde(default)]
    pub platform: Option<String>,
    /// Extra options copied verbatim into this service's manifest section.
    #[serde(default)]
    pub supervisor: serde_yaml::Mapping,
    /// Every other key of the entry.
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_yaml::Value>,
}

impl ServiceSpec {
    /// Creates a service with just a name and a command.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            ..Self::default()
        }
    }

    /// Names referenced through `links`, stripped of their alias.
    pub fn link_targets(&self) -> Vec<&str> {
        self.links
            .iter()
            .filter_map(|link| link.split(':').next())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Service names referenced through `volumes_from`. Container sources are not services.
    pub fn volume_sources(&self) -> Vec<&str> {
        self.volumes_from
            .iter()
            .filter(|entry| !entry.starts_with("container:"))
            .filter_map(|entry| {
                let entry = entry.strip_prefix("service:").unwrap_or(entry);
                entry.split(':').next()
            })
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Service named by a `pid: service:<name>` reference.
    pub fn pid_service(&self) -> Option<&str> {
        self.pid
            .as_deref()
            .and_then(|mode| mode.strip_prefix("service:"))
            .filter(|name| !name.is_empty())
    }

    /// Every service this one depends on, in declaration order, duplicates included.
    pub fn dependency_names(&self) -> Vec<&str> {
        let mut names = self.link_targets();
        names.extend(self.pid_service());
        names.extend(self.depends_on.iter().map(String::as_str));
        names.extend(self.volume_sources());
        names
    }

    /// The `supervisor:` options rendered as manifest `key=value` pairs.
    pub fn supervisor_options(&self) -> Vec<(String, String)> {
        self.supervisor
            .iter()
            .filter_map(|(key, value)| Some((scalar_to_string(key)?, scalar_to_string(value)?)))
            .collect()
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    services: Option<RawServices>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawServices {
    List(Vec<ServiceSpec>),
    Map(serde_yaml::Mapping),
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("static pattern")
    })
}

/// Expands `${VAR}` and `$VAR` references; `$$` yields a literal `$`.
pub fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for caps in env_pattern().captures_iter(input) {
        let whole = caps.get(0).expect("group 0 always matches");
        output.push_str(&input[last..whole.start()]);
        last = whole.end();

        match caps.get(1).or_else(|| caps.get(2)) {
            Some(var) => {
                let value = env::var(var.as_str())
                    .map_err(|_| ConfigError::MissingVariable(var.as_str().to_string()))?;
                output.push_str(&value);
            }
            None => output.push('$'),
        }
    }

    output.push_str(&input[last..]);
    Ok(output)
}

/// Parses configuration text, interpolating environment variables first.
pub fn parse_config(content: &str, project_dir: &Path) -> Result<Config, ConfigError> {
    let expanded = expand_env_vars(content)?;
    let raw: RawConfig = serde_yaml::from_str(&expanded)?;

    let version = match raw.version {
        Some(serde_yaml::Value::String(s)) => s,
        Some(serde_yaml::Value::Number(n)) => n.to_string(),
        _ => "1".to_string(),
    };

    let services = match raw.services {
        None => Vec::new(),
        Some(RawServices::List(list)) => list,
        Some(RawServices::Map(mapping)) => {
            let mut services = Vec::with_capacity(mapping.len());
            for (index, (key, value)) in mapping.into_iter().enumerate() {
                let name = scalar_to_string(&key).ok_or(ConfigError::UnnamedService(index))?;
                let value = if value.is_null() {
                    serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
                } else {
                    value
                };
                let mut spec: ServiceSpec = serde_yaml::from_value(value)?;
                spec.name = name;
                services.push(spec);
            }
            services
        }
    };

    let mut seen = HashSet::new();
    for (index, service) in services.iter().enumerate() {
        if service.name.trim().is_empty() {
            return Err(ConfigError::UnnamedService(index));
        }
        if !seen.insert(service.name.as_str()) {
            return Err(ConfigError::DuplicateService(service.name.clone()));
        }
    }

    Ok(Config {
        version,
        services,
        project_dir: project_dir.to_path_buf(),
    })
}

/// Picks the configuration file: the explicit one, else the first default name in `base_dir`.
pub fn find_config_path(explicit: Option<&Path>, base_dir: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        };
    }

    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| base_dir.join(name))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| base_dir.join(DEFAULT_CONFIG_FILES[0]))
}

/// Loads and parses the configuration file.
pub fn load_config(config_path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::ReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let project_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    parse_config(&content, &project_dir)
}

/// Lowercases a name and drops everything outside `[-_a-z0-9]`.
pub fn normalize_project_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_')
        .collect()
}

/// Resolves the project name from an explicit value, the environment or the project directory.
pub fn project_name(explicit: Option<&str>, project_dir: &Path) -> String {
    let from_env = env::var(PROJECT_NAME_ENV).ok();
    if let Some(name) = explicit
        .map(str::to_string)
        .or(from_env)
        .filter(|n| !n.is_empty())
    {
        let normalized = normalize_project_name(&name);
        if !normalized.is_empty() {
            return normalized;
        }
    }

    let absolute = project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf());
    absolute
        .file_name()
        .map(|n| normalize_project_name(&n.to_string_lossy()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string())
}
