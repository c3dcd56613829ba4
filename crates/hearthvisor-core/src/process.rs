use crate::config::ServiceDescriptor;
use crate::error::SpawnError;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use tokio_stream::Stream;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Line-oriented captured output of a child process
pub type OutputStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when the process was ended by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Result of a process signaling operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Everything needed to start one service process
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    /// Build a launch spec; `injected` values are only used where the descriptor sets nothing
    pub fn from_descriptor(
        descriptor: &ServiceDescriptor,
        injected: &HashMap<String, String>,
    ) -> Self {
        let mut env = injected.clone();
        env.extend(
            descriptor
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        Self {
            name: descriptor.name.clone(),
            command: descriptor.command.clone(),
            args: descriptor.resolved_args(),
            working_directory: descriptor.working_directory.clone(),
            env,
        }
    }
}

/// A freshly launched process and its captured output
pub struct Launched<H> {
    pub handle: H,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has exited)
    fn pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn command(&self) -> &str;

    /// Try to get exit status without blocking; reaps the process once it has exited
    async fn try_wait(&mut self) -> Result<Option<ProcessExit>>;
}

/// Spawning side of a platform process manager
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle + 'static;

    /// Launch a process with closed stdin and captured stdout/stderr
    async fn launch(&self, spec: &LaunchSpec) -> Result<Launched<Self::Handle>, SpawnError>;
}

/// Minimal OS signaling surface, implemented once per platform
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Ask the process (and its group) to exit
    async fn send_graceful_stop(&self, pid: ProcessId) -> TerminationResult;

    /// Terminate the process and its descendants immediately
    async fn force_kill(&self, pid: ProcessId) -> TerminationResult;

    /// Whether a process with this PID still exists
    fn is_alive(&self, pid: ProcessId) -> bool;
}

/// High-level process manager trait that combines lifecycle and signaling
pub trait ProcessManager: ProcessLifecycle + ProcessControl + 'static {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;

    /// Platform name for logging and debugging
    fn platform_name(&self) -> &'static str;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;
}
