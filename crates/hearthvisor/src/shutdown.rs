use crate::lock::InstanceLock;
use crate::supervisor::StopOutcome;
use futures::future::join_all;
use hearthvisor_core::StopError;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) type WorkerTask = (String, JoinHandle<Result<StopOutcome, StopError>>);

/// Final state of one service after shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceShutdown {
    pub name: String,
    pub outcome: Option<StopOutcome>,
    pub error: Option<String>,
}

/// Result of the one and only shutdown run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub services: Vec<ServiceShutdown>,
    pub elapsed_ms: u64,
    /// Every service stopped without an error; force-kills are warnings only
    pub success: bool,
    pub force_killed: Vec<String>,
}

impl ShutdownReport {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Cancels every monitor, waits for all services to stop in parallel and releases the
/// instance lock. Runs exactly once; later calls get the first report.
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    workers: Mutex<Vec<WorkerTask>>,
    lock: Mutex<Option<InstanceLock>>,
    report: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub(crate) fn new(
        cancel: CancellationToken,
        workers: Vec<WorkerTask>,
        lock: Option<InstanceLock>,
    ) -> Self {
        Self {
            cancel,
            workers: Mutex::new(workers),
            lock: Mutex::new(lock),
            report: OnceCell::new(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.report.get_or_init(|| self.run()).await.clone()
    }

    async fn run(&self) -> ShutdownReport {
        let started = Instant::now();
        info!(event = "shutdown-started", "Shutting down all services");

        // Pending backoff timers die with the monitors; each monitor stops its own process
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let results = join_all(
            workers
                .into_iter()
                .map(|(name, task)| async move { (name, task.await) }),
        )
        .await;

        let services: Vec<_> = results
            .into_iter()
            .map(|(name, joined)| match joined {
                Ok(Ok(outcome)) => ServiceShutdown {
                    name,
                    outcome: Some(outcome),
                    error: None,
                },
                Ok(Err(e)) => ServiceShutdown {
                    name,
                    outcome: None,
                    error: Some(e.to_string()),
                },
                Err(e) => ServiceShutdown {
                    name,
                    outcome: None,
                    error: Some(format!("monitor task failed: {e}")),
                },
            })
            .collect();

        let force_killed: Vec<_> = services
            .iter()
            .filter(|service| service.outcome == Some(StopOutcome::ForceKilled))
            .map(|service| service.name.clone())
            .collect();
        let success = services.iter().all(|service| service.error.is_none());

        if let Some(lock) = self.lock.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if let Err(e) = lock.release() {
                warn!(error = %e, "Failed to release instance lock");
            }
        }

        let report = ShutdownReport {
            services,
            elapsed_ms: started.elapsed().as_millis() as u64,
            success,
            force_killed,
        };

        if report.force_killed.is_empty() {
            info!(event = "shutdown-complete", elapsed_ms = report.elapsed_ms, success, "Shutdown complete");
        } else {
            warn!(
                event = "shutdown-complete",
                elapsed_ms = report.elapsed_ms,
                success,
                force_killed = ?report.force_killed,
                "Shutdown complete; some services had to be force-killed"
            );
        }
        report
    }
}
