use crate::api::{ServiceEntry, StatusApi};
use crate::factory::{PlatformProcessManager, PlatformProcessManagerFactory};
use crate::lock::InstanceLock;
use crate::monitor::{ServiceWorker, WorkerSettings};
use crate::probe::HttpHealthProbe;
use crate::secrets::SecretStore;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::supervisor::ProcessSupervisor;
use backon::{ConstantBuilder, Retryable};
use chrono::Utc;
use hearthvisor_core::{
    HealthProbe, LifecycleState, LogBuffer, OrchestratorConfig, OrchestratorError,
    PortAvailabilityChecker, ProbeSchedule, ProcessManager, ProcessManagerFactory, RestartPolicy,
    ServiceDescriptor, ServiceStatus,
};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// Polling interval of [`Orchestrator::wait_until_running`]
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A running set of supervised services
pub struct Orchestrator<M: ProcessManager = PlatformProcessManager> {
    services: Vec<ServiceDescriptor>,
    status: StatusApi,
    coordinator: Arc<ShutdownCoordinator>,
    cancel: CancellationToken,
    _manager: PhantomData<fn() -> M>,
}

impl Orchestrator<PlatformProcessManager> {
    /// Start every configured service with the platform process manager and HTTP probes
    pub async fn start(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let probe = HttpHealthProbe::new(config.health.probe_timeout())?;
        Self::start_with(
            config,
            PlatformProcessManagerFactory::create_process_manager(),
            Arc::new(probe),
        )
        .await
    }
}

impl<M: ProcessManager> Orchestrator<M> {
    /// Validate, take the instance lock, run the port pre-flight gate and spawn one
    /// monitor per service. Nothing is spawned when any step before the monitors fails.
    pub async fn start_with(
        config: OrchestratorConfig,
        manager: M,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let startup_time = Utc::now();
        info!(
            event = "orchestrator-starting",
            services = config.services.len(),
            profile = %config.port_profile,
            platform = manager.platform_name(),
            "Starting orchestrator"
        );

        let lock = config
            .data_dir
            .as_deref()
            .map(|dir| InstanceLock::acquire(dir, &manager))
            .transpose()?;

        PortAvailabilityChecker::default().check_all(&config.services)?;

        let secrets = resolve_secrets(&config)?;
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::new(manager),
            &config.services,
            secrets,
            config.log_capacity,
        ));

        let policy = RestartPolicy::new(&config.restart);
        let settings = WorkerSettings {
            policy: policy.clone(),
            schedule: ProbeSchedule::new(&config.health),
            probe_timeout: config.health.probe_timeout(),
            stop_grace_period: config.stop_grace_period(),
        };

        let cancel = CancellationToken::new();
        let mut entries = Vec::with_capacity(config.services.len());
        let mut workers = Vec::with_capacity(config.services.len());

        for descriptor in &config.services {
            let (status_tx, status_rx) = watch::channel(ServiceStatus::new(
                &descriptor.name,
                descriptor.port,
                policy.base_backoff(),
            ));
            let (command_tx, command_rx) = mpsc::channel(1);
            let logs = supervisor
                .logs(&descriptor.name)
                .unwrap_or_else(|| Arc::new(LogBuffer::new(config.log_capacity)));

            let worker = ServiceWorker::new(
                descriptor.clone(),
                supervisor.clone(),
                probe.clone(),
                settings.clone(),
                status_tx,
                command_rx,
                cancel.clone(),
            );
            let task = tokio::spawn(
                worker
                    .run()
                    .instrument(info_span!("service", service = %descriptor.name)),
            );

            entries.push(ServiceEntry {
                name: descriptor.name.clone(),
                status: status_rx,
                commands: command_tx,
                logs,
            });
            workers.push((descriptor.name.clone(), task));
        }

        let status = StatusApi::new(entries, policy, cancel.clone(), startup_time);
        let coordinator = Arc::new(ShutdownCoordinator::new(cancel.clone(), workers, lock));

        info!(event = "orchestrator-started", "All service monitors started");
        Ok(Self {
            services: config.services,
            status,
            coordinator,
            cancel,
            _manager: PhantomData,
        })
    }

    /// Cloneable query surface
    pub fn status_api(&self) -> StatusApi {
        self.status.clone()
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Longest startup grace period of all services
    pub fn startup_timeout(&self) -> Duration {
        self.services
            .iter()
            .map(ServiceDescriptor::startup_grace_period)
            .max()
            .unwrap_or_default()
    }

    /// Wait until every service is Running. Fails early when a service is Failed.
    pub async fn wait_until_running(&self, timeout: Duration) -> Result<(), OrchestratorError> {
        let attempts = (timeout.as_millis() / READY_POLL_INTERVAL.as_millis()).max(1) as usize;
        let status = &self.status;

        (move || async move { check_running(status) })
            .retry(
                ConstantBuilder::default()
                    .with_delay(READY_POLL_INTERVAL)
                    .with_max_times(attempts),
            )
            .when(|e| matches!(e, OrchestratorError::Timeout(_)))
            .await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.coordinator.is_shutting_down()
    }

    /// Stop everything. Idempotent; every call returns the report of the first run.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.coordinator.shutdown().await
    }
}

impl<M: ProcessManager> Drop for Orchestrator<M> {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            warn!("Orchestrator dropped without shutdown; cancelling service monitors");
            self.cancel.cancel();
        }
    }
}

fn check_running(status: &StatusApi) -> Result<(), OrchestratorError> {
    let report = status.get_system_health_report();

    if let Some(failed) = report
        .services
        .iter()
        .find(|service| service.lifecycle_state == LifecycleState::Failed)
    {
        return Err(OrchestratorError::ServiceFailed {
            service: failed.name.clone(),
            reason: failed.last_error.clone().unwrap_or_default(),
        });
    }

    let pending: Vec<_> = report
        .services
        .iter()
        .filter(|service| service.lifecycle_state != LifecycleState::Running)
        .map(|service| service.name.as_str())
        .collect();
    if pending.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::Timeout(format!(
            "services not running yet: {}",
            pending.join(", ")
        )))
    }
}

fn resolve_secrets(config: &OrchestratorConfig) -> Result<HashMap<String, String>, OrchestratorError> {
    if config.required_secrets.is_empty() {
        return Ok(HashMap::new());
    }

    let data_dir = config.data_dir.as_deref().ok_or_else(|| {
        OrchestratorError::configuration("requiredSecrets needs a dataDir to persist them in")
    })?;
    SecretStore::open(data_dir)?.ensure(&config.required_secrets)
}
