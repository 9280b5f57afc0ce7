//! The data model (`spec.md` §3) and the config loader port (`spec.md`
//! §6, §4.7 of SPEC_FULL.md).

pub mod error;

use error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/procd/config.yaml";

fn default_stability_window() -> Duration {
    Duration::from_secs(300)
}

fn deser_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    duration_str::parse(&s).map_err(serde::de::Error::custom)
}

fn deser_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    s.map(|s| duration_str::parse(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// What to run: an immutable value describing a single child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            user: None,
            group: None,
            stdout: None,
            stderr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicyKind {
    Always,
    OnFailure,
    Never,
    UnlessStopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    pub policy: RestartPolicyKind,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(deserialize_with = "deser_duration")]
    pub delay: Duration,
    #[serde(default, deserialize_with = "deser_duration_opt")]
    pub delay_max: Option<Duration>,
    #[serde(default = "default_stability_window", deserialize_with = "deser_duration")]
    pub stability_window: Duration,
}

impl RestartConfig {
    /// `delay_max` defaults to `10 * delay` when absent, per `spec.md` §3.
    pub fn effective_delay_max(&self) -> Duration {
        self.delay_max.unwrap_or(self.delay * 10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthProbeKind {
    Http,
    Tcp,
    Exec,
}

/// Metadata describing a health probe. The concrete check is a narrow
/// port (see `health` module); this struct is just configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthProbeConfig {
    pub kind: HealthProbeKind,
    pub target: String,
    #[serde(default = "default_probe_interval", deserialize_with = "deser_duration")]
    pub interval: Duration,
    #[serde(default = "default_probe_timeout", deserialize_with = "deser_duration")]
    pub timeout: Duration,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Declared listener metadata — informational only, per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub process: ProcessSpec,
    pub restart: RestartConfig,
    #[serde(default)]
    pub health_probes: Vec<HealthProbeConfig>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(5)
}

/// The top-level deserialized document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default = "default_metrics_interval", deserialize_with = "deser_duration")]
    pub metrics_interval: Duration,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

impl Config {
    /// Structural + referential validation beyond what serde already
    /// enforces: nonempty, unique names and a positive backoff base delay.
    /// See `spec.md` §3 ("A name... nonempty") and §4.3 ("delay (base
    /// backoff, positive duration)").
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ConfigError::InvalidService {
                    name: service.name.clone(),
                    reason: "service name must be nonempty".to_string(),
                });
            }
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::InvalidService {
                    name: service.name.clone(),
                    reason: "duplicate service name".to_string(),
                });
            }
            if service.restart.delay.is_zero() {
                return Err(ConfigError::InvalidService {
                    name: service.name.clone(),
                    reason: "restart.delay must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// The config loader port. `load` must be idempotent and free of side
/// effects — `spec.md` §6.
pub trait ConfigLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Config, ConfigError>;
}

/// YAML-backed implementation, using `serde_yaml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlConfigLoader;

impl ConfigLoader for YamlConfigLoader {
    fn load(&self, path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Malformed(err.to_string())
            }
        })?;
        let config: Config =
            serde_yaml::from_str(&contents).map_err(|err| ConfigError::Malformed(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
