use crate::config::HealthConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Body a managed service returns from its health endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

/// Result of a single liveness probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Healthy(HealthReport),
    Unhealthy(String),
}

impl ProbeOutcome {
    /// Healthy outcome carrying only a status string
    pub fn healthy(status: impl Into<String>) -> Self {
        ProbeOutcome::Healthy(HealthReport {
            status: status.into(),
            name: None,
            version: None,
            timestamp: None,
        })
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        ProbeOutcome::Unhealthy(reason.into())
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy(_))
    }
}

/// Classify an HTTP response. Only a 200 whose JSON body carries a non-empty string
/// `status` counts as healthy.
pub fn classify_response(status_code: u16, body: &[u8]) -> ProbeOutcome {
    if status_code != 200 {
        return ProbeOutcome::unhealthy(format!("HTTP {status_code}"));
    }

    match serde_json::from_slice::<HealthReport>(body) {
        Ok(report) if report.status.trim().is_empty() => {
            ProbeOutcome::unhealthy("health body has an empty status field")
        }
        Ok(report) => ProbeOutcome::Healthy(report),
        Err(e) => ProbeOutcome::unhealthy(format!("malformed health body: {e}")),
    }
}

/// Issues one liveness probe against a health URL
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeOutcome;
}

/// Two-phase probe cadence: frequent right after a start attempt, relaxed afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSchedule {
    fast_interval: Duration,
    fast_phase: Duration,
    steady_interval: Duration,
}

impl ProbeSchedule {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            fast_interval: config.fast_probe_interval(),
            fast_phase: config.fast_phase(),
            steady_interval: config.steady_probe_interval(),
        }
    }

    /// Interval before the next probe, given the time since the last start attempt
    pub fn interval_after(&self, since_start: Duration) -> Duration {
        if since_start <= self.fast_phase {
            self.fast_interval
        } else {
            self.steady_interval
        }
    }
}

impl Default for ProbeSchedule {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}
