use crate::process::ProcessId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle phase of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Running,
    Degraded,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// States in which the service owns a live process
    pub fn has_process(self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Degraded
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub lifecycle_state: LifecycleState,
    pub port: u16,
    pub process_id: Option<ProcessId>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub current_backoff_seconds: u64,
}

impl ServiceStatus {
    /// Initial record for a registered service that has not been spawned yet
    pub fn new(name: impl Into<String>, port: u16, base_backoff: Duration) -> Self {
        Self {
            name: name.into(),
            lifecycle_state: LifecycleState::Stopped,
            port,
            process_id: None,
            started_at: None,
            last_health_check: None,
            last_error: None,
            restart_count: 0,
            last_restart_at: None,
            current_backoff_seconds: base_backoff.as_secs(),
        }
    }

    pub fn current_backoff(&self) -> Duration {
        Duration::from_secs(self.current_backoff_seconds)
    }

    /// A process was spawned for this service
    pub fn mark_started(&mut self, pid: Option<ProcessId>, at: DateTime<Utc>) {
        self.lifecycle_state = LifecycleState::Starting;
        self.process_id = pid;
        self.started_at = Some(at);
    }

    /// The service no longer owns a process; `state` must be Stopped or Failed
    pub fn mark_without_process(&mut self, state: LifecycleState, error: Option<String>) {
        debug_assert!(!state.has_process());
        self.lifecycle_state = state;
        self.process_id = None;
        if error.is_some() {
            self.last_error = error;
        }
    }
}

/// Aggregate health of all services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Critical,
}

impl SystemHealth {
    /// Healthy when every service runs, Critical when any failed, Degraded otherwise
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a ServiceStatus>) -> Self {
        let mut all_running = true;
        for status in statuses {
            match status.lifecycle_state {
                LifecycleState::Failed => return SystemHealth::Critical,
                LifecycleState::Running => {}
                _ => all_running = false,
            }
        }

        if all_running {
            SystemHealth::Healthy
        } else {
            SystemHealth::Degraded
        }
    }
}

impl std::fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SystemHealth::Healthy => "healthy",
            SystemHealth::Degraded => "degraded",
            SystemHealth::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Aggregate health plus every service snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthReport {
    pub overall: SystemHealth,
    pub services: Vec<ServiceStatus>,
    pub startup_time: DateTime<Utc>,
}
