//! Hearthvisor - supervises a fixed set of local backend services.
//!
//! [`Orchestrator`] runs the port pre-flight check, spawns every service, monitors it
//! with health probes, restarts it with exponential backoff and shuts everything down
//! exactly once. [`StatusApi`] is the read surface handed to the host application.

mod api;
mod factory;
mod lock;
mod monitor;
mod orchestrator;
mod probe;
mod secrets;
mod shutdown;
mod supervisor;
pub mod telemetry;

pub use api::{RestartAccepted, StatusApi};
pub use factory::{PlatformProcessManager, PlatformProcessManagerFactory};
pub use lock::{InstanceLock, LOCK_FILE_NAME};
pub use orchestrator::Orchestrator;
pub use probe::HttpHealthProbe;
pub use secrets::{SECRETS_FILE_NAME, SecretStore};
pub use shutdown::{ServiceShutdown, ShutdownCoordinator, ShutdownReport};
pub use supervisor::{ProcessSupervisor, ServiceHandle, StopOutcome};

// Re-export core functionality
pub use hearthvisor_core::*;

/// Default data directory for the lock file and persisted secrets
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hearthvisor")
}
