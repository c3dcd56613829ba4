//! In-memory process manager and health probe for exercising the orchestrator without
//! real processes or HTTP servers.

use crate::error::SpawnError;
use crate::health::{HealthProbe, ProbeOutcome};
use crate::process::{
    LaunchSpec, Launched, OutputStream, ProcessControl, ProcessExit, ProcessHandle, ProcessId,
    ProcessLifecycle, ProcessManager, TerminationResult,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const FIRST_MOCK_PID: ProcessId = 10_000;

/// A recorded launch
#[derive(Debug, Clone)]
pub struct MockLaunch {
    pub name: String,
    pub command: String,
    pub pid: ProcessId,
    pub env: HashMap<String, String>,
    pub at: Instant,
}

#[derive(Debug)]
struct MockProcess {
    alive: bool,
    ignores_graceful_stop: bool,
    force_killed: bool,
    exit: Option<ProcessExit>,
}

#[derive(Debug, Default)]
struct MockState {
    next_pid: ProcessId,
    processes: HashMap<ProcessId, MockProcess>,
    launches: Vec<MockLaunch>,
    failing_commands: HashSet<String>,
    stubborn_commands: HashSet<String>,
    output: HashMap<String, Vec<String>>,
}

/// Process manager that simulates processes in memory
#[derive(Debug, Clone, Default)]
pub struct MockProcessManager {
    state: Arc<Mutex<MockState>>,
}

impl MockProcessManager {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launching `command` fails as if the executable did not exist
    pub fn fail_command(&self, command: &str) {
        self.lock().failing_commands.insert(command.to_string());
    }

    /// Allow launching `command` again
    pub fn allow_command(&self, command: &str) {
        self.lock().failing_commands.remove(command);
    }

    /// Processes started from `command` ignore the graceful stop signal
    pub fn ignore_graceful_stop(&self, command: &str) {
        self.lock().stubborn_commands.insert(command.to_string());
    }

    /// Lines written to stdout by every process started from `command`
    pub fn emit_output<S: ToString>(&self, command: &str, lines: impl IntoIterator<Item = S>) {
        self.lock().output.insert(
            command.to_string(),
            lines.into_iter().map(|l| l.to_string()).collect(),
        );
    }

    /// Simulate the process exiting on its own
    pub fn crash(&self, pid: ProcessId, code: i32) {
        if let Some(process) = self.lock().processes.get_mut(&pid) {
            process.alive = false;
            process.exit = Some(ProcessExit { code: Some(code) });
        }
    }

    pub fn launches(&self) -> Vec<MockLaunch> {
        self.lock().launches.clone()
    }

    pub fn launches_of(&self, name: &str) -> Vec<MockLaunch> {
        self.lock()
            .launches
            .iter()
            .filter(|launch| launch.name == name)
            .cloned()
            .collect()
    }

    pub fn live_processes(&self) -> Vec<ProcessId> {
        let mut pids: Vec<_> = self
            .lock()
            .processes
            .iter()
            .filter(|(_, process)| process.alive)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    pub fn was_force_killed(&self, pid: ProcessId) -> bool {
        self.lock()
            .processes
            .get(&pid)
            .is_some_and(|process| process.force_killed)
    }
}

/// Handle to a simulated process
pub struct MockProcessHandle {
    pid: ProcessId,
    command: String,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl ProcessHandle for MockProcessHandle {
    fn pid(&self) -> Option<ProcessId> {
        Some(self.pid)
    }

    fn command(&self) -> &str {
        &self.command
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessExit>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.processes.get(&self.pid).and_then(|process| process.exit))
    }
}

#[async_trait]
impl ProcessLifecycle for MockProcessManager {
    type Handle = MockProcessHandle;

    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched<Self::Handle>, SpawnError> {
        let mut state = self.lock();
        if state.failing_commands.contains(&spec.command) {
            return Err(SpawnError {
                service: spec.name.clone(),
                command: spec.command.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{}: command not found", spec.command),
                ),
            });
        }

        let pid = FIRST_MOCK_PID + state.next_pid;
        state.next_pid += 1;
        let ignores_graceful_stop = state.stubborn_commands.contains(&spec.command);
        state.processes.insert(
            pid,
            MockProcess {
                alive: true,
                ignores_graceful_stop,
                force_killed: false,
                exit: None,
            },
        );
        state.launches.push(MockLaunch {
            name: spec.name.clone(),
            command: spec.command.clone(),
            pid,
            env: spec.env.clone(),
            at: Instant::now(),
        });

        let lines = state.output.get(&spec.command).cloned().unwrap_or_default();
        let stdout: OutputStream = Box::pin(tokio_stream::iter(lines));

        Ok(Launched {
            handle: MockProcessHandle {
                pid,
                command: spec.command.clone(),
                state: self.state.clone(),
            },
            stdout: Some(stdout),
            stderr: None,
        })
    }
}

#[async_trait]
impl ProcessControl for MockProcessManager {
    async fn send_graceful_stop(&self, pid: ProcessId) -> TerminationResult {
        let mut state = self.lock();
        match state.processes.get_mut(&pid) {
            Some(process) if process.alive => {
                if !process.ignores_graceful_stop {
                    process.alive = false;
                    process.exit = Some(ProcessExit { code: None });
                }
                TerminationResult::Success
            }
            _ => TerminationResult::ProcessNotFound,
        }
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        let mut state = self.lock();
        match state.processes.get_mut(&pid) {
            Some(process) if process.alive => {
                process.alive = false;
                process.force_killed = true;
                process.exit = Some(ProcessExit { code: None });
                TerminationResult::Success
            }
            _ => TerminationResult::ProcessNotFound,
        }
    }

    fn is_alive(&self, pid: ProcessId) -> bool {
        self.lock()
            .processes
            .get(&pid)
            .is_some_and(|process| process.alive)
    }
}

impl ProcessManager for MockProcessManager {
    fn new() -> Self {
        Self::default()
    }

    fn platform_name(&self) -> &'static str {
        "mock"
    }
}

#[derive(Debug, Default)]
struct ProbeScript {
    queued: HashMap<String, VecDeque<ProbeOutcome>>,
    fallback: HashMap<String, ProbeOutcome>,
    calls: HashMap<String, u32>,
    in_flight: HashMap<String, u32>,
    overlapped: bool,
    latency: Duration,
}

/// Health probe answering from per-URL scripts. Unknown URLs answer "connection refused".
#[derive(Debug, Clone, Default)]
pub struct ScriptedHealthProbe {
    script: Arc<Mutex<ProbeScript>>,
}

impl ScriptedHealthProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Outcome returned once the queued outcomes for `url` are used up
    pub fn set_default(&self, url: &str, outcome: ProbeOutcome) {
        self.lock().fallback.insert(url.to_string(), outcome);
    }

    /// Outcomes returned, in order, by the next probes of `url`
    pub fn push(&self, url: &str, outcomes: impl IntoIterator<Item = ProbeOutcome>) {
        self.lock()
            .queued
            .entry(url.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Every probe takes this long
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.lock().calls.get(url).copied().unwrap_or_default()
    }

    /// Whether two probes of the same URL ever ran at the same time
    pub fn overlapped(&self) -> bool {
        self.lock().overlapped
    }
}

#[async_trait]
impl HealthProbe for ScriptedHealthProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        let latency = {
            let mut script = self.lock();
            *script.calls.entry(url.to_string()).or_default() += 1;
            let in_flight = script.in_flight.entry(url.to_string()).or_default();
            *in_flight += 1;
            if *in_flight > 1 {
                script.overlapped = true;
            }
            script.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut script = self.lock();
        if let Some(in_flight) = script.in_flight.get_mut(url) {
            *in_flight -= 1;
        }
        if let Some(outcome) = script.queued.get_mut(url).and_then(VecDeque::pop_front) {
            return outcome;
        }
        script
            .fallback
            .get(url)
            .cloned()
            .unwrap_or_else(|| ProbeOutcome::unhealthy("connection refused"))
    }
}
