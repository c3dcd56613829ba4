//! Per-service health monitoring.
//!
//! Every service gets one [`ServiceWorker`] task. The worker is the only writer of that
//! service's [`ServiceStatus`]: it spawns the process, probes it on the two-phase
//! schedule, applies the restart policy and finally stops the process on shutdown.

use crate::supervisor::{ProcessSupervisor, StopOutcome};
use chrono::Utc;
use hearthvisor_core::{
    HealthProbe, HealthReport, LifecycleState, ManualRestart, ProbeOutcome, ProbeSchedule,
    ProcessManager, RestartDecision, RestartPolicy, ServiceDescriptor, ServiceStatus, StopError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Requests delivered to a running worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerCommand {
    Restart { override_ceiling: bool },
}

/// Timing knobs shared by every worker
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub policy: RestartPolicy,
    pub schedule: ProbeSchedule,
    pub probe_timeout: Duration,
    pub stop_grace_period: Duration,
}

pub(crate) struct ServiceWorker<M: ProcessManager> {
    descriptor: ServiceDescriptor,
    health_url: String,
    supervisor: Arc<ProcessSupervisor<M>>,
    probe: Arc<dyn HealthProbe>,
    settings: WorkerSettings,
    status: watch::Sender<ServiceStatus>,
    commands: mpsc::Receiver<WorkerCommand>,
    cancel: CancellationToken,
    last_start: Instant,
}

impl<M: ProcessManager> ServiceWorker<M> {
    pub fn new(
        descriptor: ServiceDescriptor,
        supervisor: Arc<ProcessSupervisor<M>>,
        probe: Arc<dyn HealthProbe>,
        settings: WorkerSettings,
        status: watch::Sender<ServiceStatus>,
        commands: mpsc::Receiver<WorkerCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            health_url: descriptor.health_url(),
            descriptor,
            supervisor,
            probe,
            settings,
            status,
            commands,
            cancel,
            last_start: Instant::now(),
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn state(&self) -> LifecycleState {
        self.status.borrow().lifecycle_state
    }

    /// Spawn, monitor until cancelled, then stop the process and retire the status
    pub async fn run(mut self) -> Result<StopOutcome, StopError> {
        self.spawn().await;

        while self.step().await {}

        let result = self
            .supervisor
            .stop(&self.descriptor.name, self.settings.stop_grace_period)
            .await;
        let error = result.as_ref().err().map(ToString::to_string);
        self.status
            .send_modify(|status| status.mark_without_process(LifecycleState::Stopped, error));
        match &result {
            Ok(outcome) => info!(service = self.name(), ?outcome, "Service retired"),
            Err(e) => error!(service = self.name(), error = %e, "Failed to stop service"),
        }
        result
    }

    /// Wait for the next probe slot and run one probe cycle. Returns false once cancelled.
    async fn step(&mut self) -> bool {
        let interval = self.settings.schedule.interval_after(self.last_start.elapsed());

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            Some(command) = self.commands.recv() => return self.handle_command(command).await,
            _ = tokio::time::sleep(interval) => {}
        }

        self.probe_cycle().await
    }

    async fn probe_cycle(&mut self) -> bool {
        if self.state().has_process() {
            if let Some(exit) = self.supervisor.exit_status(&self.descriptor.name).await {
                return self
                    .on_failure(format!("process exited unexpectedly ({exit})"))
                    .await;
            }
        }

        let Some(outcome) = self.run_probe().await else {
            return false;
        };

        if !self.state().has_process() {
            // Failed services are only observed
            let now = Utc::now();
            self.status.send_modify(|status| match &outcome {
                ProbeOutcome::Healthy(_) => status.last_health_check = Some(now),
                ProbeOutcome::Unhealthy(reason) => status.last_error = Some(reason.clone()),
            });
            return true;
        }

        match outcome {
            ProbeOutcome::Healthy(report) => {
                self.on_healthy(&report);
                true
            }
            ProbeOutcome::Unhealthy(reason) => self.on_failure(reason).await,
        }
    }

    /// Run one probe on its own task. On cancellation the probe is detached and left to
    /// finish or time out by itself.
    async fn run_probe(&mut self) -> Option<ProbeOutcome> {
        let probe = self.probe.clone();
        let url = self.health_url.clone();
        let timeout = self.settings.probe_timeout;
        let task = tokio::spawn(async move {
            match tokio::time::timeout(timeout, probe.probe(&url)).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::unhealthy(format!(
                    "health probe timed out after {}s",
                    timeout.as_secs_f32()
                )),
            }
        });

        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(service = self.name(), "Detaching in-flight health probe");
                None
            }
            joined = task => Some(joined.unwrap_or_else(|e| {
                ProbeOutcome::unhealthy(format!("health probe task failed: {e}"))
            })),
        }
    }

    fn on_healthy(&mut self, report: &HealthReport) {
        let was = self.state();
        let policy = &self.settings.policy;
        let now = Utc::now();
        self.status.send_modify(|status| {
            status.lifecycle_state = LifecycleState::Running;
            status.last_health_check = Some(now);
            status.last_error = None;
            policy.record_healthy(status);
        });

        if was != LifecycleState::Running {
            info!(
                service = self.name(),
                event = "healthy",
                status = %report.status,
                version = ?report.version,
                "Service is healthy"
            );
        } else {
            debug!(service = self.name(), status = %report.status, "Health probe passed");
        }
    }

    /// Record the failure and either restart after the backoff or give up
    async fn on_failure(&mut self, reason: String) -> bool {
        warn!(service = self.name(), event = "unhealthy", error = %reason, "Health check failed");
        self.status.send_modify(|status| {
            status.lifecycle_state = LifecycleState::Degraded;
            status.last_error = Some(reason.clone());
        });

        let decision = self.settings.policy.evaluate(&self.status.borrow());
        match decision {
            RestartDecision::RestartAfter(delay) => {
                info!(
                    service = self.name(),
                    event = "restarting",
                    delay_seconds = delay.as_secs(),
                    restart_count = self.status.borrow().restart_count,
                    "Restarting service after backoff"
                );

                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return false,
                    // An operator restart bypasses the remaining wait
                    Some(command) = self.commands.recv() => return self.handle_command(command).await,
                    _ = tokio::time::sleep(delay) => {}
                }

                self.restart(false).await
            }
            RestartDecision::GiveUp => {
                self.give_up(reason).await;
                !self.cancel.is_cancelled()
            }
        }
    }

    async fn give_up(&mut self, reason: String) {
        if let Err(e) = self
            .supervisor
            .stop(&self.descriptor.name, self.settings.stop_grace_period)
            .await
        {
            warn!(service = self.name(), error = %e, "Failed to stop service after giving up");
        }

        let restart_count = self.status.borrow().restart_count;
        self.status.send_modify(|status| {
            status.mark_without_process(
                LifecycleState::Failed,
                Some(format!(
                    "restart limit reached after {restart_count} attempts: {reason}"
                )),
            );
        });
        error!(
            service = self.name(),
            event = "failed",
            restart_count,
            "Restart limit reached; service marked failed"
        );
    }

    async fn handle_command(&mut self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::Restart { override_ceiling } => {
                let decision = self
                    .settings
                    .policy
                    .evaluate_manual(&self.status.borrow(), override_ceiling);

                match decision {
                    Ok(ManualRestart { reset }) => {
                        info!(
                            service = self.name(),
                            event = "restarting",
                            manual = true,
                            reset,
                            "Manual restart requested"
                        );
                        self.restart(reset).await
                    }
                    Err(rejection) => {
                        warn!(
                            service = self.name(),
                            event = "restart-dropped",
                            %rejection,
                            "Dropping manual restart accepted before the service changed state"
                        );
                        true
                    }
                }
            }
        }
    }

    /// Stop whatever runs, update the counters and spawn again
    async fn restart(&mut self, reset: bool) -> bool {
        match self
            .supervisor
            .stop(&self.descriptor.name, self.settings.stop_grace_period)
            .await
        {
            Ok(outcome) => debug!(service = self.name(), ?outcome, "Stopped for restart"),
            Err(e) => warn!(service = self.name(), error = %e, "Failed to stop service for restart"),
        }

        if self.cancel.is_cancelled() {
            return false;
        }

        let policy = &self.settings.policy;
        let now = Utc::now();
        self.status.send_modify(|status| {
            if reset {
                policy.record_override(status, now);
            } else {
                policy.record_restart(status, now);
            }
        });

        self.spawn().await;
        true
    }

    async fn spawn(&mut self) -> bool {
        self.last_start = Instant::now();

        match self.supervisor.spawn(&self.descriptor).await {
            Ok(handle) => {
                self.status
                    .send_modify(|status| status.mark_started(handle.pid, handle.started_at));
                info!(
                    service = self.name(),
                    event = "started",
                    pid = ?handle.pid,
                    port = self.descriptor.port,
                    "Service started"
                );
                true
            }
            Err(e) => {
                error!(service = self.name(), event = "spawn-failed", error = %e, "Failed to spawn service");
                self.status.send_modify(|status| {
                    status.mark_without_process(LifecycleState::Failed, Some(e.to_string()))
                });
                false
            }
        }
    }
}
