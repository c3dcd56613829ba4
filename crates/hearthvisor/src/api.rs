use crate::monitor::WorkerCommand;
use chrono::{DateTime, Utc};
use hearthvisor_core::{
    LogBuffer, LogLine, OrchestratorError, RestartPolicy, RestartRejection, ServiceStatus,
    SystemHealth, SystemHealthReport,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// An operator restart that was queued for the service's monitor.
///
/// Acceptance is best-effort: the monitor checks the restart policy again when it picks
/// the request up, and drops it with a warning if the service failed in the meantime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartAccepted {
    pub service: String,
    /// The restart counter and backoff start over
    pub reset: bool,
}

pub(crate) struct ServiceEntry {
    pub name: String,
    pub status: watch::Receiver<ServiceStatus>,
    pub commands: mpsc::Sender<WorkerCommand>,
    pub logs: Arc<LogBuffer>,
}

struct StatusApiInner {
    services: Vec<ServiceEntry>,
    policy: RestartPolicy,
    shutdown: CancellationToken,
    startup_time: DateTime<Utc>,
}

/// Read-only query surface plus manual restarts. Cheap to clone; every read is a
/// snapshot of the latest published status and never waits on a probe.
#[derive(Clone)]
pub struct StatusApi {
    inner: Arc<StatusApiInner>,
}

impl StatusApi {
    pub(crate) fn new(
        services: Vec<ServiceEntry>,
        policy: RestartPolicy,
        shutdown: CancellationToken,
        startup_time: DateTime<Utc>,
    ) -> Self {
        Self {
            inner: Arc::new(StatusApiInner {
                services,
                policy,
                shutdown,
                startup_time,
            }),
        }
    }

    fn entry(&self, name: &str) -> Result<&ServiceEntry, OrchestratorError> {
        self.inner
            .services
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(name.to_string()))
    }

    /// Service names in registry order
    pub fn list_services(&self) -> Vec<String> {
        self.inner
            .services
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    pub fn get_service_status(&self, name: &str) -> Result<ServiceStatus, OrchestratorError> {
        Ok(self.entry(name)?.status.borrow().clone())
    }

    fn snapshots(&self) -> Vec<ServiceStatus> {
        self.inner
            .services
            .iter()
            .map(|entry| entry.status.borrow().clone())
            .collect()
    }

    pub fn get_system_health(&self) -> SystemHealth {
        SystemHealth::from_statuses(&self.snapshots())
    }

    /// Aggregate health with every snapshot, sorted by service name
    pub fn get_system_health_report(&self) -> SystemHealthReport {
        let mut services = self.snapshots();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        SystemHealthReport {
            overall: SystemHealth::from_statuses(&services),
            services,
            startup_time: self.inner.startup_time,
        }
    }

    /// Most recent captured output lines, oldest first
    pub fn get_service_logs(
        &self,
        name: &str,
        tail_lines: usize,
    ) -> Result<Vec<LogLine>, OrchestratorError> {
        Ok(self.entry(name)?.logs.tail(tail_lines))
    }

    /// Ask the service's monitor for an immediate restart. Returns without waiting for it.
    ///
    /// At most one request is queued per service; a second one before the monitor picks
    /// up the first is rejected as pending. See [`RestartAccepted`] for what acceptance means.
    pub fn restart_service(
        &self,
        name: &str,
        override_ceiling: bool,
    ) -> Result<RestartAccepted, OrchestratorError> {
        let entry = self.entry(name)?;
        let rejected = |reason| OrchestratorError::RestartRejected {
            service: name.to_string(),
            reason,
        };

        if self.inner.shutdown.is_cancelled() {
            return Err(rejected(RestartRejection::ShuttingDown));
        }

        let snapshot = entry.status.borrow().clone();
        let manual = self
            .inner
            .policy
            .evaluate_manual(&snapshot, override_ceiling)
            .map_err(rejected)?;

        entry
            .commands
            .try_send(WorkerCommand::Restart { override_ceiling })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => rejected(RestartRejection::Pending),
                mpsc::error::TrySendError::Closed(_) => rejected(RestartRejection::ShuttingDown),
            })?;

        info!(service = name, override_ceiling, "Manual restart accepted");
        Ok(RestartAccepted {
            service: name.to_string(),
            reset: manual.reset,
        })
    }
}
