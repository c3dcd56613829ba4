use crate::process::ProcessId;
use crate::restart::RestartRejection;
use serde::Serialize;
use thiserror::Error;

/// Core error types for orchestrator operations
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    PortConflict(#[from] PortConflictError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Restart of service '{service}' rejected: {reason}")]
    RestartRejected {
        service: String,
        reason: RestartRejection,
    },

    #[error("Service '{service}' failed: {reason}")]
    ServiceFailed { service: String, reason: String },

    #[error("Another orchestrator instance is already running (PID: {pid})")]
    InstanceLocked { pid: ProcessId },

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        OrchestratorError::Configuration(message.into())
    }

    /// Errors that abort the whole orchestrator rather than a single service
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::PortConflict(_)
                | OrchestratorError::Configuration(_)
                | OrchestratorError::InstanceLocked { .. }
        )
    }
}

/// One port that could not be reserved during the pre-flight check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConflict {
    pub service: String,
    pub port: u16,
    pub reason: String,
}

impl std::fmt::Display for PortConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on port {} ({})", self.service, self.port, self.reason)
    }
}

/// Every conflict found by the pre-flight check, reported together
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} required port(s) unavailable: {}", .conflicts.len(), format_conflicts(.conflicts))]
pub struct PortConflictError {
    pub conflicts: Vec<PortConflict>,
}

fn format_conflicts(conflicts: &[PortConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The OS refused to create a service process
#[derive(Error, Debug)]
#[error("Failed to spawn service '{service}' with command '{command}': {source}")]
pub struct SpawnError {
    pub service: String,
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

/// Errors while terminating a service process
#[derive(Error, Debug)]
pub enum StopError {
    #[error("Permission denied while stopping service '{service}' (PID: {pid})")]
    PermissionDenied { service: String, pid: ProcessId },

    #[error("Failed to signal service '{service}' (PID: {pid}): {message}")]
    Signal {
        service: String,
        pid: ProcessId,
        message: String,
    },

    #[error("Process for service '{service}' did not exit after force kill")]
    StillAlive { service: String },

    #[error("IO error while stopping service '{service}': {source}")]
    Io {
        service: String,
        #[source]
        source: anyhow::Error,
    },
}
