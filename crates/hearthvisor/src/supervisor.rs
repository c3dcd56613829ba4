use chrono::{DateTime, Utc};
use hearthvisor_core::{
    LaunchSpec, LogBuffer, OutputKind, ProcessExit, ProcessHandle, ProcessId, ProcessManager,
    ServiceDescriptor, SpawnError, StopError, TerminationResult, capture,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often a stopping process is polled for exit
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a force-killed process gets to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopOutcome {
    /// Exited within the grace period
    Graceful,
    /// Ignored the graceful signal and was killed
    ForceKilled,
    /// No live process to stop
    NotRunning,
}

/// A freshly spawned service process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandle {
    pub pid: Option<ProcessId>,
    pub started_at: DateTime<Utc>,
}

/// Spawns and stops service processes and owns their handles and output buffers
pub struct ProcessSupervisor<M: ProcessManager> {
    manager: Arc<M>,
    handles: Mutex<HashMap<String, M::Handle>>,
    logs: HashMap<String, Arc<LogBuffer>>,
    injected_env: HashMap<String, String>,
}

impl<M: ProcessManager> ProcessSupervisor<M> {
    pub fn new(
        manager: Arc<M>,
        services: &[ServiceDescriptor],
        injected_env: HashMap<String, String>,
        log_capacity: usize,
    ) -> Self {
        let logs = services
            .iter()
            .map(|service| (service.name.clone(), Arc::new(LogBuffer::new(log_capacity))))
            .collect();

        debug!(
            "Created ProcessSupervisor with platform: {}",
            manager.platform_name()
        );

        Self {
            manager,
            handles: Mutex::new(HashMap::new()),
            logs,
            injected_env,
        }
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    /// Captured output buffer of a service
    pub fn logs(&self, name: &str) -> Option<Arc<LogBuffer>> {
        self.logs.get(name).cloned()
    }

    /// Launch a service process with closed stdin and captured output
    pub async fn spawn(&self, descriptor: &ServiceDescriptor) -> Result<ServiceHandle, SpawnError> {
        let spec = LaunchSpec::from_descriptor(descriptor, &self.injected_env);
        let launched = self.manager.launch(&spec).await?;
        let pid = launched.handle.pid();

        let buffer = self
            .logs
            .get(&descriptor.name)
            .cloned()
            .unwrap_or_else(|| Arc::new(LogBuffer::new(1)));
        for (stream, kind) in [
            (launched.stdout, OutputKind::Stdout),
            (launched.stderr, OutputKind::Stderr),
        ] {
            if let Some(stream) = stream {
                let buffer = buffer.clone();
                let service = descriptor.name.clone();
                tokio::spawn(async move { capture(stream, kind, service, &buffer).await });
            }
        }

        let previous = self
            .handles
            .lock()
            .await
            .insert(descriptor.name.clone(), launched.handle);
        if let Some(pid) = previous.and_then(|handle| handle.pid()) {
            warn!(service = %descriptor.name, pid, "Replacing a live handle; killing the old process");
            self.manager.force_kill(pid).await;
        }

        Ok(ServiceHandle {
            pid,
            started_at: Utc::now(),
        })
    }

    /// Non-blocking check whether the service process exited on its own. An exited
    /// process is reaped and its handle released.
    pub async fn exit_status(&self, name: &str) -> Option<ProcessExit> {
        let mut handles = self.handles.lock().await;
        let handle = handles.get_mut(name)?;
        match handle.try_wait().await {
            Ok(Some(exit)) => {
                handles.remove(name);
                Some(exit)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(service = name, error = %e, "Failed to poll process status");
                None
            }
        }
    }

    /// Graceful signal, wait up to `grace_period`, then force-kill and reap.
    /// Stopping a service without a live process is a no-op.
    pub async fn stop(&self, name: &str, grace_period: Duration) -> Result<StopOutcome, StopError> {
        let Some(mut handle) = self.handles.lock().await.remove(name) else {
            return Ok(StopOutcome::NotRunning);
        };

        if let Some(exit) = Self::poll_exit(name, &mut handle).await? {
            debug!(service = name, %exit, "Process had already exited");
            return Ok(StopOutcome::NotRunning);
        }
        let Some(pid) = handle.pid() else {
            return Ok(StopOutcome::NotRunning);
        };

        match self.manager.send_graceful_stop(pid).await {
            TerminationResult::Success => {}
            TerminationResult::ProcessNotFound => {
                Self::poll_exit(name, &mut handle).await?;
                return Ok(StopOutcome::NotRunning);
            }
            TerminationResult::AccessDenied => {
                return Err(StopError::PermissionDenied {
                    service: name.to_string(),
                    pid,
                });
            }
            TerminationResult::Failed(message) => {
                warn!(service = name, pid, %message, "Graceful stop signal failed");
            }
        }

        let deadline = Instant::now() + grace_period;
        loop {
            if let Some(exit) = Self::poll_exit(name, &mut handle).await? {
                info!(service = name, event = "stopped", pid, %exit, "Service stopped");
                return Ok(StopOutcome::Graceful);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
        }

        warn!(
            service = name,
            event = "force-killed",
            pid,
            grace_period_ms = grace_period.as_millis() as u64,
            "Service ignored the graceful stop signal; killing it"
        );
        match self.manager.force_kill(pid).await {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
            TerminationResult::AccessDenied => {
                return Err(StopError::PermissionDenied {
                    service: name.to_string(),
                    pid,
                });
            }
            TerminationResult::Failed(message) => {
                return Err(StopError::Signal {
                    service: name.to_string(),
                    pid,
                    message,
                });
            }
        }

        let reap_deadline = Instant::now() + REAP_TIMEOUT;
        while Instant::now() < reap_deadline {
            if Self::poll_exit(name, &mut handle).await?.is_some() {
                return Ok(StopOutcome::ForceKilled);
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        Err(StopError::StillAlive {
            service: name.to_string(),
        })
    }

    async fn poll_exit(name: &str, handle: &mut M::Handle) -> Result<Option<ProcessExit>, StopError> {
        handle.try_wait().await.map_err(|source| StopError::Io {
            service: name.to_string(),
            source,
        })
    }
}

impl<M: ProcessManager> Drop for ProcessSupervisor<M> {
    fn drop(&mut self) {
        let handles = self.handles.get_mut();
        if handles.is_empty() {
            return;
        }

        warn!(
            "ProcessSupervisor dropped with {} live processes - attempting emergency cleanup",
            handles.len()
        );
        // Dropping a handle kills the direct child; the kill below reaches its descendants
        let targets: Vec<_> = handles
            .drain()
            .filter_map(|(name, handle)| handle.pid().map(|pid| (name, pid)))
            .collect();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime left for emergency cleanup of {:?}", targets);
            return;
        };
        let manager = self.manager.clone();
        runtime.spawn(async move {
            for (name, pid) in targets {
                match manager.force_kill(pid).await {
                    TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                    result => warn!(service = %name, pid, "Emergency cleanup failed: {:?}", result),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearthvisor_core::mock::MockProcessManager;

    fn descriptor(name: &str, command: &str) -> ServiceDescriptor {
        ServiceDescriptor::builder()
            .name(name)
            .command(command)
            .args(["--port", "{port}"])
            .port(8000u16)
            .build()
            .unwrap()
    }

    fn supervisor(manager: &MockProcessManager) -> ProcessSupervisor<MockProcessManager> {
        let services = [descriptor("core", "python3"), descriptor("vault", "stubborn")];
        let secrets = HashMap::from([("HEARTHLINK_VAULT_KEY".to_string(), "k".repeat(64))]);
        ProcessSupervisor::new(Arc::new(manager.clone()), &services, secrets, 100)
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_injects_secrets_and_captures_output() {
        let manager = MockProcessManager::default();
        manager.emit_output("python3", ["booting", "listening"]);
        let supervisor = supervisor(&manager);

        let handle = supervisor.spawn(&descriptor("core", "python3")).await.unwrap();
        assert!(handle.pid.is_some());

        let launch = &manager.launches_of("core")[0];
        assert_eq!(launch.env["HEARTHLINK_VAULT_KEY"].len(), 64);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let lines: Vec<_> = supervisor
            .logs("core")
            .unwrap()
            .tail(10)
            .into_iter()
            .map(|line| line.text)
            .collect();
        assert_eq!(lines, vec!["booting", "listening"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_outcomes() {
        let manager = MockProcessManager::default();
        manager.ignore_graceful_stop("stubborn");
        let supervisor = supervisor(&manager);
        let grace = Duration::from_secs(10);

        supervisor.spawn(&descriptor("core", "python3")).await.unwrap();
        let stubborn = supervisor.spawn(&descriptor("vault", "stubborn")).await.unwrap();

        assert_eq!(supervisor.stop("core", grace).await.unwrap(), StopOutcome::Graceful);
        assert_eq!(supervisor.stop("core", grace).await.unwrap(), StopOutcome::NotRunning);

        let started = Instant::now();
        assert_eq!(
            supervisor.stop("vault", grace).await.unwrap(),
            StopOutcome::ForceKilled
        );
        assert!(started.elapsed() >= grace);
        assert!(started.elapsed() < grace + Duration::from_secs(1));
        assert!(manager.was_force_killed(stubborn.pid.unwrap()));
        assert!(manager.live_processes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_status_detects_crash() {
        let manager = MockProcessManager::default();
        let supervisor = supervisor(&manager);

        let handle = supervisor.spawn(&descriptor("core", "python3")).await.unwrap();
        assert!(supervisor.exit_status("core").await.is_none());

        manager.crash(handle.pid.unwrap(), 3);
        assert_eq!(
            supervisor.exit_status("core").await,
            Some(ProcessExit { code: Some(3) })
        );
        assert_eq!(
            supervisor.stop("core", Duration::from_secs(10)).await.unwrap(),
            StopOutcome::NotRunning
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_kills_live_processes() {
        let manager = MockProcessManager::default();
        let supervisor = supervisor(&manager);
        supervisor.spawn(&descriptor("core", "python3")).await.unwrap();
        assert_eq!(manager.live_processes().len(), 1);

        drop(supervisor);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.live_processes().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_stop_keeps_other_tasks_running() {
        let manager = MockProcessManager::default();
        manager.ignore_graceful_stop("stubborn");
        let supervisor = supervisor(&manager);
        supervisor.spawn(&descriptor("vault", "stubborn")).await.unwrap();

        let ticks = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = ticks.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let outcome = supervisor.stop("vault", Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, StopOutcome::ForceKilled);
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }
}
