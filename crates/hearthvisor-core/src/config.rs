use crate::error::OrchestratorError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Placeholder substituted with the resolved port in health URLs and arguments
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Environment variable selecting the port profile
pub const PORT_PROFILE_ENV: &str = "HEARTHVISOR_PORT_PROFILE";

/// Restart backoff and ceiling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestartConfig {
    /// Delay before the first automatic restart (in milliseconds)
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound for the doubling backoff (in milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Automatic restarts allowed before the service is marked failed
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl RestartConfig {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.base_backoff_ms == 0 {
            return Err(OrchestratorError::configuration(
                "restart.baseBackoffMs must be greater than zero",
            ));
        }

        if self.base_backoff_ms % 1_000 != 0 || self.max_backoff_ms % 1_000 != 0 {
            return Err(OrchestratorError::configuration(
                "restart backoff values must be whole seconds",
            ));
        }

        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(OrchestratorError::configuration(
                "restart.baseBackoffMs cannot be greater than restart.maxBackoffMs",
            ));
        }

        if self.max_restarts == 0 || self.max_restarts > 10 {
            return Err(OrchestratorError::configuration(
                "restart.maxRestarts must be between 1 and 10",
            ));
        }

        Ok(())
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Probe cadence for the two monitoring phases
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    /// Probe interval while a service is inside its fast phase
    #[serde(default = "default_fast_probe_interval_ms")]
    pub fast_probe_interval_ms: u64,

    /// Length of the fast phase, measured from the last start attempt
    #[serde(default = "default_fast_phase_ms")]
    pub fast_phase_ms: u64,

    /// Probe interval once the fast phase is over
    #[serde(default = "default_steady_probe_interval_ms")]
    pub steady_probe_interval_ms: u64,

    /// Timeout for a single health request
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            fast_probe_interval_ms: default_fast_probe_interval_ms(),
            fast_phase_ms: default_fast_phase_ms(),
            steady_probe_interval_ms: default_steady_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.fast_probe_interval_ms == 0 || self.steady_probe_interval_ms == 0 {
            return Err(OrchestratorError::configuration(
                "health probe intervals must be greater than zero",
            ));
        }

        if self.probe_timeout_ms == 0 {
            return Err(OrchestratorError::configuration(
                "health.probeTimeoutMs must be greater than zero",
            ));
        }

        if self.fast_probe_interval_ms > self.steady_probe_interval_ms {
            return Err(OrchestratorError::configuration(
                "health.fastProbeIntervalMs cannot exceed health.steadyProbeIntervalMs",
            ));
        }

        Ok(())
    }

    pub fn fast_probe_interval(&self) -> Duration {
        Duration::from_millis(self.fast_probe_interval_ms)
    }

    pub fn fast_phase(&self) -> Duration {
        Duration::from_millis(self.fast_phase_ms)
    }

    pub fn steady_probe_interval(&self) -> Duration {
        Duration::from_millis(self.steady_probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Named port layouts so several installations can coexist on one machine
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProfile {
    #[default]
    Default,
    Qa,
    Dev,
}

impl PortProfile {
    /// Offset added to every configured port
    pub fn offset(&self) -> u16 {
        match self {
            PortProfile::Default => 0,
            PortProfile::Qa => 10,
            PortProfile::Dev => 20,
        }
    }

    /// Reads `HEARTHVISOR_PORT_PROFILE`; unknown or missing values select the default profile
    pub fn from_env() -> Self {
        std::env::var(PORT_PROFILE_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for PortProfile {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" | "" => Ok(PortProfile::Default),
            "qa" => Ok(PortProfile::Qa),
            "dev" => Ok(PortProfile::Dev),
            other => Err(OrchestratorError::configuration(format!(
                "unknown port profile '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for PortProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortProfile::Default => write!(f, "default"),
            PortProfile::Qa => write!(f, "qa"),
            PortProfile::Dev => write!(f, "dev"),
        }
    }
}

/// Immutable description of one supervised service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into, strip_option))]
pub struct ServiceDescriptor {
    pub name: String,
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub port: u16,
    /// May contain `{port}`, replaced by the resolved port
    #[builder(default = "default_health_check_url()")]
    #[serde(default = "default_health_check_url")]
    pub health_check_url: String,
    #[builder(default = "default_startup_grace_period_ms()")]
    #[serde(default = "default_startup_grace_period_ms")]
    pub startup_grace_period_ms: u64,
}

impl ServiceDescriptor {
    pub fn builder() -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder::default()
    }

    /// Health URL with the port placeholder resolved
    pub fn health_url(&self) -> String {
        self.health_check_url
            .replace(PORT_PLACEHOLDER, &self.port.to_string())
    }

    /// Launch arguments with the port placeholder resolved
    pub fn resolved_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }

    pub fn startup_grace_period(&self) -> Duration {
        Duration::from_millis(self.startup_grace_period_ms)
    }

    /// Shift the port (and any literal occurrence of it in the health URL) by `offset`
    pub fn with_port_offset(mut self, offset: u16) -> Result<Self, OrchestratorError> {
        if offset == 0 {
            return Ok(self);
        }

        let shifted = self.port.checked_add(offset).ok_or_else(|| {
            OrchestratorError::configuration(format!(
                "port {} of service '{}' overflows with offset {offset}",
                self.port, self.name
            ))
        })?;

        let literal = format!(":{}", self.port);
        if self.health_check_url.contains(&literal) {
            self.health_check_url = self
                .health_check_url
                .replace(&literal, &format!(":{shifted}"));
        }
        self.port = shifted;
        Ok(self)
    }
}

impl ServiceDescriptorBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

/// Top-level orchestrator configuration, usually loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    pub services: Vec<ServiceDescriptor>,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Time a service gets to exit after the graceful signal
    #[serde(default = "default_stop_grace_period_ms")]
    pub stop_grace_period_ms: u64,

    /// Captured output lines kept per service
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Environment variables every service needs; missing ones are generated once
    #[serde(default)]
    pub required_secrets: Vec<String>,

    /// Directory for the instance lock and secret store
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub port_profile: PortProfile,
}

impl OrchestratorConfig {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        Self {
            services,
            restart: RestartConfig::default(),
            health: HealthConfig::default(),
            stop_grace_period_ms: default_stop_grace_period_ms(),
            log_capacity: default_log_capacity(),
            required_secrets: Vec::new(),
            data_dir: None,
            port_profile: PortProfile::default(),
        }
    }

    /// Load and validate a JSON configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: OrchestratorConfig = serde_json::from_str(&raw).map_err(|e| {
            OrchestratorError::configuration(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a port profile to every service. The profile is recorded so it is applied only once.
    pub fn with_port_profile(mut self, profile: PortProfile) -> Result<Self, OrchestratorError> {
        let offset = profile.offset().checked_sub(self.port_profile.offset());
        let Some(offset) = offset else {
            return Err(OrchestratorError::configuration(format!(
                "cannot switch from port profile '{}' to '{profile}'",
                self.port_profile
            )));
        };

        self.services = self
            .services
            .into_iter()
            .map(|service| service.with_port_offset(offset))
            .collect::<Result<_, _>>()?;
        self.port_profile = profile;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.services.is_empty() {
            return Err(OrchestratorError::configuration(
                "at least one service must be configured",
            ));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(OrchestratorError::configuration("service names cannot be empty"));
            }
            if !names.insert(service.name.as_str()) {
                return Err(OrchestratorError::configuration(format!(
                    "duplicate service name '{}'",
                    service.name
                )));
            }
            if service.command.trim().is_empty() {
                return Err(OrchestratorError::configuration(format!(
                    "service '{}' has an empty command",
                    service.name
                )));
            }
            if service.port == 0 {
                return Err(OrchestratorError::configuration(format!(
                    "service '{}' must declare a fixed port",
                    service.name
                )));
            }
            if !ports.insert(service.port) {
                return Err(OrchestratorError::configuration(format!(
                    "port {} is declared by more than one service",
                    service.port
                )));
            }
        }

        if self.stop_grace_period_ms == 0 {
            return Err(OrchestratorError::configuration(
                "stopGracePeriodMs must be greater than zero",
            ));
        }

        if self.log_capacity == 0 {
            return Err(OrchestratorError::configuration(
                "logCapacity must be greater than zero",
            ));
        }

        self.restart.validate()?;
        self.health.validate()
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}

// Default value functions for serde
fn default_base_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_max_restarts() -> u32 {
    5
}
fn default_fast_probe_interval_ms() -> u64 {
    5_000
}
fn default_fast_phase_ms() -> u64 {
    60_000
}
fn default_steady_probe_interval_ms() -> u64 {
    30_000
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_health_check_url() -> String {
    format!("http://127.0.0.1:{PORT_PLACEHOLDER}/health")
}
fn default_startup_grace_period_ms() -> u64 {
    60_000
}
fn default_stop_grace_period_ms() -> u64 {
    10_000
}
fn default_log_capacity() -> usize {
    1_000
}
