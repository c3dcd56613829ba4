use hearthvisor::mock::{MockProcessManager, ScriptedHealthProbe};
use hearthvisor::{
    LifecycleState, Orchestrator, OrchestratorConfig, OrchestratorError, ProbeOutcome,
    RestartRejection, ServiceDescriptor, ServiceStatus, StatusApi, StopOutcome, SystemHealth,
};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Distinct ports that were free a moment ago
fn free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<_> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap().port())
        .collect()
}

fn services(specs: &[(&str, &str)]) -> Vec<ServiceDescriptor> {
    specs
        .iter()
        .zip(free_ports(specs.len()))
        .map(|((name, command), port)| {
            ServiceDescriptor::builder()
                .name(*name)
                .command(*command)
                .args(["--port", "{port}"])
                .port(port)
                .build()
                .unwrap()
        })
        .collect()
}

async fn start(
    services: Vec<ServiceDescriptor>,
    manager: &MockProcessManager,
    probe: &ScriptedHealthProbe,
) -> Orchestrator<MockProcessManager> {
    match Orchestrator::start_with(
        OrchestratorConfig::new(services),
        manager.clone(),
        Arc::new(probe.clone()),
    )
    .await
    {
        Ok(orchestrator) => orchestrator,
        Err(e) => panic!("failed to start orchestrator: {e}"),
    }
}

/// Poll a service status until `condition` holds
async fn wait_for(
    api: &StatusApi,
    name: &str,
    limit: Duration,
    condition: impl Fn(&ServiceStatus) -> bool,
) -> ServiceStatus {
    let deadline = Instant::now() + limit;
    loop {
        let status = api.get_service_status(name).unwrap();
        if condition(&status) {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "condition not reached for {name}: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn healthy_everywhere(probe: &ScriptedHealthProbe, services: &[ServiceDescriptor]) {
    for service in services {
        probe.set_default(&service.health_url(), ProbeOutcome::healthy("ok"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_services_reach_running() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3"), ("vault", "python3"), ("synapse", "node")]);
    healthy_everywhere(&probe, &services);

    let orchestrator = start(services.clone(), &manager, &probe).await;
    orchestrator
        .wait_until_running(Duration::from_secs(60))
        .await
        .unwrap();

    let api = orchestrator.status_api();
    assert_eq!(api.get_system_health(), SystemHealth::Healthy);
    assert_eq!(api.list_services(), vec!["core", "vault", "synapse"]);
    for service in &services {
        let status = api.get_service_status(&service.name).unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Running);
        assert_eq!(status.restart_count, 0);
        assert!(status.process_id.is_some());
        assert!(status.started_at.is_some());
        assert!(status.last_health_check.is_some());
        assert_eq!(status.port, service.port);
    }

    let launch = &manager.launches_of("core")[0];
    assert_eq!(launch.command, "python3");

    let report = api.get_system_health_report();
    let names: Vec<_> = report.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["core", "synapse", "vault"]);
    assert_eq!(report.overall, SystemHealth::Healthy);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_occupied_port_spawns_nothing() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut services = services(&[("core", "python3"), ("vault", "python3")]);
    services[1].port = occupied.local_addr().unwrap().port();

    let result = Orchestrator::start_with(
        OrchestratorConfig::new(services),
        manager.clone(),
        Arc::new(probe.clone()),
    )
    .await;

    match result {
        Err(OrchestratorError::PortConflict(error)) => {
            assert_eq!(error.conflicts.len(), 1);
            assert_eq!(error.conflicts[0].service, "vault");
        }
        Err(other) => panic!("expected a port conflict, got {other}"),
        Ok(_) => panic!("expected a port conflict"),
    }
    assert!(manager.launches().is_empty());
    assert!(manager.live_processes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_service_gives_up_after_five_restarts() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3")]);
    probe.set_default(&services[0].health_url(), ProbeOutcome::unhealthy("HTTP 500"));

    let orchestrator = start(services, &manager, &probe).await;
    let api = orchestrator.status_api();

    let status = wait_for(&api, "core", Duration::from_secs(120), |s| {
        s.lifecycle_state == LifecycleState::Failed
    })
    .await;
    assert_eq!(status.restart_count, 5);
    assert!(status.process_id.is_none());
    assert!(status.last_error.unwrap().contains("HTTP 500"));
    assert_eq!(api.get_system_health(), SystemHealth::Critical);

    // Each gap is one 5s fast-phase probe interval plus the backoff delay
    let launches = manager.launches_of("core");
    let gaps: Vec<_> = launches
        .windows(2)
        .map(|pair| (pair[1].at - pair[0].at).as_secs())
        .collect();
    assert_eq!(gaps, vec![6, 7, 9, 13, 21]);
    assert!(manager.live_processes().is_empty());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(manager.launches_of("core").len(), 6);
    assert_eq!(
        api.get_service_status("core").unwrap().lifecycle_state,
        LifecycleState::Failed
    );

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_resets_restart_count() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3")]);
    let url = services[0].health_url();
    probe.push(
        &url,
        [
            ProbeOutcome::unhealthy("HTTP 503"),
            ProbeOutcome::unhealthy("HTTP 503"),
        ],
    );
    probe.set_default(&url, ProbeOutcome::healthy("ok"));

    let orchestrator = start(services, &manager, &probe).await;
    let api = orchestrator.status_api();

    wait_for(&api, "core", Duration::from_secs(30), |s| s.restart_count == 2).await;
    orchestrator
        .wait_until_running(Duration::from_secs(60))
        .await
        .unwrap();

    let status = api.get_service_status("core").unwrap();
    assert_eq!(status.restart_count, 0);
    assert_eq!(status.current_backoff_seconds, 1);
    assert!(status.last_error.is_none());
    assert!(status.last_restart_at.is_some());
    assert_eq!(manager.launches_of("core").len(), 3);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_parallel_and_force_kills_stubborn_service() {
    let manager = MockProcessManager::default();
    manager.ignore_graceful_stop("stubborn");
    let probe = ScriptedHealthProbe::default();
    let services = services(&[
        ("core", "python3"),
        ("vault", "stubborn"),
        ("synapse", "node"),
        ("alden", "python3"),
    ]);
    healthy_everywhere(&probe, &services);

    let orchestrator = start(services, &manager, &probe).await;
    orchestrator
        .wait_until_running(Duration::from_secs(60))
        .await
        .unwrap();
    let api = orchestrator.status_api();
    let stubborn_pid = api.get_service_status("vault").unwrap().process_id.unwrap();

    let started = Instant::now();
    let report = orchestrator.shutdown().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(11), "shutdown took {elapsed:?}");
    assert!(report.success);
    assert_eq!(report.force_killed, vec!["vault"]);
    assert_eq!(report.services.len(), 4);
    for service in &report.services {
        let expected = if service.name == "vault" {
            StopOutcome::ForceKilled
        } else {
            StopOutcome::Graceful
        };
        assert_eq!(service.outcome, Some(expected));
    }

    assert!(manager.was_force_killed(stubborn_pid));
    assert!(manager.live_processes().is_empty());
    for name in api.list_services() {
        let status = api.get_service_status(&name).unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Stopped);
        assert!(status.process_id.is_none());
    }

    // Later calls return the first report without stopping anything again
    assert_eq!(orchestrator.shutdown().await, report);
    assert!(orchestrator.is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_backoff() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3")]);
    probe.set_default(&services[0].health_url(), ProbeOutcome::unhealthy("HTTP 503"));

    let mut config = OrchestratorConfig::new(services);
    config.restart.base_backoff_ms = 30_000;
    config.restart.max_backoff_ms = 30_000;
    let orchestrator = match Orchestrator::start_with(
        config,
        manager.clone(),
        Arc::new(probe.clone()),
    )
    .await
    {
        Ok(orchestrator) => orchestrator,
        Err(e) => panic!("failed to start orchestrator: {e}"),
    };
    let api = orchestrator.status_api();

    // First failed check lands at 5s; the restart would follow 30s later
    wait_for(&api, "core", Duration::from_secs(10), |s| {
        s.lifecycle_state == LifecycleState::Degraded
    })
    .await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(manager.launches_of("core").len(), 1);

    let started = Instant::now();
    let report = orchestrator.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert!(report.success);
    assert_eq!(report.services[0].outcome, Some(StopOutcome::Graceful));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(manager.launches_of("core").len(), 1);
    assert!(manager.live_processes().is_empty());
    let status = api.get_service_status("core").unwrap();
    assert_eq!(status.lifecycle_state, LifecycleState::Stopped);
    assert_eq!(status.restart_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_restart_of_failed_service_needs_override() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3")]);
    let url = services[0].health_url();
    probe.set_default(&url, ProbeOutcome::unhealthy("connection refused"));

    let orchestrator = start(services, &manager, &probe).await;
    let api = orchestrator.status_api();
    wait_for(&api, "core", Duration::from_secs(120), |s| {
        s.lifecycle_state == LifecycleState::Failed
    })
    .await;
    assert_eq!(manager.launches_of("core").len(), 6);

    match api.restart_service("core", false) {
        Err(OrchestratorError::RestartRejected { service, reason }) => {
            assert_eq!(service, "core");
            assert_eq!(reason, RestartRejection::Failed);
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    probe.set_default(&url, ProbeOutcome::healthy("ok"));
    let requested = Instant::now();
    let accepted = api.restart_service("core", true).unwrap();
    assert!(accepted.reset);

    let status = wait_for(&api, "core", Duration::from_secs(1), |s| {
        s.lifecycle_state == LifecycleState::Starting
    })
    .await;
    assert_eq!(status.restart_count, 0);
    assert_eq!(status.current_backoff_seconds, 1);

    let launches = manager.launches_of("core");
    assert_eq!(launches.len(), 7);
    assert!(launches[6].at - requested < Duration::from_secs(1));

    orchestrator
        .wait_until_running(Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(api.get_service_status("core").unwrap().restart_count, 0);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_restart_of_running_service_counts() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3")]);
    healthy_everywhere(&probe, &services);

    let orchestrator = start(services, &manager, &probe).await;
    orchestrator
        .wait_until_running(Duration::from_secs(60))
        .await
        .unwrap();
    let api = orchestrator.status_api();

    let accepted = api.restart_service("core", false).unwrap();
    assert!(!accepted.reset);

    let status = wait_for(&api, "core", Duration::from_secs(1), |s| {
        s.lifecycle_state == LifecycleState::Starting
    })
    .await;
    assert_eq!(status.restart_count, 1);
    assert_eq!(status.current_backoff_seconds, 2);
    assert_eq!(manager.launches_of("core").len(), 2);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_manual_restart_is_pending_until_first_is_picked_up() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3")]);
    healthy_everywhere(&probe, &services);

    let orchestrator = start(services, &manager, &probe).await;
    orchestrator
        .wait_until_running(Duration::from_secs(60))
        .await
        .unwrap();
    let api = orchestrator.status_api();

    // The check starting at 10s runs until 13s; requests made meanwhile wait in the queue
    probe.set_latency(Duration::from_secs(3));
    tokio::time::sleep(Duration::from_millis(6_500)).await;

    assert!(api.restart_service("core", false).is_ok());
    match api.restart_service("core", false) {
        Err(OrchestratorError::RestartRejected { service, reason }) => {
            assert_eq!(service, "core");
            assert_eq!(reason, RestartRejection::Pending);
        }
        other => panic!("expected a pending rejection, got {other:?}"),
    }
    assert_eq!(manager.launches_of("core").len(), 1);

    let status = wait_for(&api, "core", Duration::from_secs(5), |s| s.restart_count == 1).await;
    assert!(status.last_restart_at.is_some());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.launches_of("core").len(), 2);
    assert_eq!(api.get_service_status("core").unwrap().restart_count, 1);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_service_does_not_affect_neighbour() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3"), ("vault", "python3")]);
    probe.set_default(&services[0].health_url(), ProbeOutcome::unhealthy("HTTP 500"));
    probe.set_default(&services[1].health_url(), ProbeOutcome::healthy("ok"));

    let orchestrator = start(services, &manager, &probe).await;
    let api = orchestrator.status_api();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(15)).await;
        let vault = api.get_service_status("vault").unwrap();
        assert_eq!(vault.lifecycle_state, LifecycleState::Running);
        assert_eq!(vault.restart_count, 0);
        assert_eq!(manager.launches_of("vault").len(), 1);
    }
    assert!(api.get_service_status("core").unwrap().restart_count > 0);
    assert_ne!(api.get_system_health(), SystemHealth::Healthy);

    // Restarting both at once keeps their counters apart
    api.restart_service("vault", false).unwrap();
    api.restart_service("core", true).unwrap();
    wait_for(&api, "vault", Duration::from_secs(1), |s| s.restart_count == 1).await;
    wait_for(&api, "core", Duration::from_secs(1), |s| {
        s.lifecycle_state == LifecycleState::Starting && s.restart_count == 0
    })
    .await;
    assert_eq!(manager.launches_of("vault").len(), 2);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_spawn_failure_isolated() {
    let manager = MockProcessManager::default();
    manager.fail_command("missing-binary");
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("alden", "missing-binary"), ("core", "python3")]);
    healthy_everywhere(&probe, &services);

    let orchestrator = start(services, &manager, &probe).await;
    let api = orchestrator.status_api();

    let alden = wait_for(&api, "alden", Duration::from_secs(1), |s| {
        s.lifecycle_state == LifecycleState::Failed
    })
    .await;
    assert_eq!(alden.restart_count, 0);
    assert!(alden.process_id.is_none());
    assert!(alden.last_error.unwrap().contains("missing-binary"));

    match orchestrator.wait_until_running(Duration::from_secs(60)).await {
        Err(OrchestratorError::ServiceFailed { service, .. }) => assert_eq!(service, "alden"),
        other => panic!("expected a failed service, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(
        api.get_service_status("core").unwrap().lifecycle_state,
        LifecycleState::Running
    );
    assert_eq!(
        api.get_service_status("alden").unwrap().lifecycle_state,
        LifecycleState::Failed
    );
    assert_eq!(api.get_system_health(), SystemHealth::Critical);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_crashed_process_is_restarted() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3")]);
    healthy_everywhere(&probe, &services);

    let orchestrator = start(services, &manager, &probe).await;
    orchestrator
        .wait_until_running(Duration::from_secs(60))
        .await
        .unwrap();
    let api = orchestrator.status_api();
    let pid = api.get_service_status("core").unwrap().process_id.unwrap();

    manager.crash(pid, 1);
    let degraded = wait_for(&api, "core", Duration::from_secs(10), |s| {
        s.lifecycle_state == LifecycleState::Degraded
    })
    .await;
    assert!(degraded.last_error.unwrap().contains("exited unexpectedly"));

    let recovered = wait_for(&api, "core", Duration::from_secs(30), |s| {
        s.lifecycle_state == LifecycleState::Running && s.process_id != Some(pid)
    })
    .await;
    assert_eq!(recovered.restart_count, 0);
    assert_eq!(manager.launches_of("core").len(), 2);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_probe_cadence_switches_to_steady_phase() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3")]);
    let url = services[0].health_url();
    healthy_everywhere(&probe, &services);

    let orchestrator = start(services, &manager, &probe).await;

    tokio::time::sleep(Duration::from_millis(60_500)).await;
    assert_eq!(probe.calls(&url), 12);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(probe.calls(&url), 13);
    tokio::time::sleep(Duration::from_secs(28)).await;
    assert_eq!(probe.calls(&url), 13);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(probe.calls(&url), 14);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_probes_never_overlap_and_are_detached_on_shutdown() {
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    probe.set_latency(Duration::from_secs(4));
    let services = services(&[("core", "python3")]);
    let url = services[0].health_url();
    healthy_everywhere(&probe, &services);

    let orchestrator = start(services, &manager, &probe).await;
    orchestrator
        .wait_until_running(Duration::from_secs(60))
        .await
        .unwrap();
    assert!(!probe.overlapped());

    // Probes run 5-9, 14-18 and 23-27; stop while the third is in flight
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(probe.calls(&url), 3);
    let started = Instant::now();
    let report = orchestrator.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(report.success);
    assert!(!probe.overlapped());
}

#[tokio::test(start_paused = true)]
async fn test_status_api_surface() {
    let manager = MockProcessManager::default();
    manager.emit_output("python3", ["booting", "ready on port"]);
    let probe = ScriptedHealthProbe::default();
    let services = services(&[("core", "python3")]);
    healthy_everywhere(&probe, &services);

    let orchestrator = start(services, &manager, &probe).await;
    let api = orchestrator.status_api();

    assert!(matches!(
        api.get_service_status("unknown"),
        Err(OrchestratorError::ServiceNotFound(name)) if name == "unknown"
    ));
    assert!(matches!(
        api.restart_service("unknown", false),
        Err(OrchestratorError::ServiceNotFound(_))
    ));

    orchestrator
        .wait_until_running(Duration::from_secs(60))
        .await
        .unwrap();
    let logs: Vec<_> = api
        .get_service_logs("core", 1)
        .unwrap()
        .into_iter()
        .map(|line| line.text)
        .collect();
    assert_eq!(logs, vec!["ready on port"]);

    let json = serde_json::to_value(api.get_system_health_report()).unwrap();
    assert_eq!(json["overall"], "healthy");
    assert_eq!(json["services"][0]["lifecycleState"], "running");

    orchestrator.shutdown().await;
    assert!(matches!(
        api.restart_service("core", false),
        Err(OrchestratorError::RestartRejected {
            reason: RestartRejection::ShuttingDown,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_required_secrets_are_injected_and_lock_released() {
    let dir = tempfile::tempdir().unwrap();
    let manager = MockProcessManager::default();
    let probe = ScriptedHealthProbe::default();
    let secret = "HEARTHVISOR_TEST_ORCHESTRATOR_SECRET".to_string();

    let mut values = Vec::new();
    for _ in 0..2 {
        let services = services(&[("vault", "python3")]);
        healthy_everywhere(&probe, &services);
        let mut config = OrchestratorConfig::new(services);
        config.required_secrets = vec![secret.clone()];
        config.data_dir = Some(dir.path().to_path_buf());

        let orchestrator = match Orchestrator::start_with(
            config,
            manager.clone(),
            Arc::new(probe.clone()),
        )
        .await
        {
            Ok(orchestrator) => orchestrator,
            Err(e) => panic!("failed to start orchestrator: {e}"),
        };
        assert!(dir.path().join(hearthvisor::LOCK_FILE_NAME).exists());

        let status = wait_for(
            &orchestrator.status_api(),
            "vault",
            Duration::from_secs(1),
            |s| s.process_id.is_some(),
        )
        .await;
        let launch = manager.launches_of("vault").pop().unwrap();
        assert_eq!(Some(launch.pid), status.process_id);
        values.push(launch.env[&secret].clone());

        orchestrator.shutdown().await;
        assert!(!dir.path().join(hearthvisor::LOCK_FILE_NAME).exists());
    }

    assert_eq!(values[0].len(), 64);
    assert_eq!(values[0], values[1]);
}
