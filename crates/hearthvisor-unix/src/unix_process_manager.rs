#[cfg(unix)]
mod unix_impl {
    use async_trait::async_trait;
    use hearthvisor_core::{
        ChildProcessHandle, LaunchSpec, Launched, ProcessControl, ProcessHandle, ProcessId,
        ProcessLifecycle, ProcessManager, SpawnError, TerminationResult, launch_command,
    };
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::sync::{Mutex, PoisonError};
    use sysinfo::System;
    use tokio::process::Command;
    use tracing::{debug, info, warn};

    /// Unix process manager; every service runs as the leader of its own process group
    pub struct UnixProcessManager {
        system: Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        type Handle = ChildProcessHandle;

        async fn launch(&self, spec: &LaunchSpec) -> Result<Launched<Self::Handle>, SpawnError> {
            let mut cmd = Command::new(&spec.command);

            // New process group so signals reach the whole service tree
            cmd.process_group(0);

            let launched = launch_command(cmd, spec)?;
            info!(
                service = %spec.name,
                pid = ?launched.handle.pid(),
                "Spawned Unix process: {} with args: {:?}",
                spec.command,
                spec.args
            );
            Ok(launched)
        }
    }

    #[async_trait]
    impl ProcessControl for UnixProcessManager {
        async fn send_graceful_stop(&self, pid: ProcessId) -> TerminationResult {
            let Some(nix_pid) = to_nix_pid(pid) else {
                return TerminationResult::ProcessNotFound;
            };

            match signal::killpg(nix_pid, Signal::SIGTERM) {
                Ok(()) => {
                    debug!("Sent SIGTERM to process group {}", pid);
                    TerminationResult::Success
                }
                // The process may have left its group; signal it directly
                Err(Errno::ESRCH) => Self::signal_single(pid, Signal::SIGTERM),
                Err(Errno::EPERM) => {
                    warn!("Permission denied to terminate process group {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGTERM to process group failed: {e}"))
                }
            }
        }

        async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
            let Some(nix_pid) = to_nix_pid(pid) else {
                return TerminationResult::ProcessNotFound;
            };
            let descendants = self.find_descendants(pid);

            let result = match signal::killpg(nix_pid, Signal::SIGKILL) {
                Ok(()) => {
                    info!("Sent SIGKILL to process group {}", pid);
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => Self::signal_single(pid, Signal::SIGKILL),
                Err(Errno::EPERM) => {
                    warn!("Permission denied to kill process group {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGKILL to process group failed: {e}"))
                }
            };

            // Descendants that moved to another group survive killpg
            for child_pid in descendants {
                match Self::signal_single(child_pid, Signal::SIGKILL) {
                    TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                    other => warn!("Failed to kill descendant {} of {}: {:?}", child_pid, pid, other),
                }
            }

            result
        }

        fn is_alive(&self, pid: ProcessId) -> bool {
            let Some(nix_pid) = to_nix_pid(pid) else {
                return false;
            };
            match signal::kill(nix_pid, None) {
                Ok(()) => true,
                Err(Errno::EPERM) => true,
                Err(_) => false,
            }
        }
    }

    impl UnixProcessManager {
        fn signal_single(pid: ProcessId, sig: Signal) -> TerminationResult {
            let Some(nix_pid) = to_nix_pid(pid) else {
                return TerminationResult::ProcessNotFound;
            };
            match signal::kill(nix_pid, sig) {
                Ok(()) => {
                    debug!("Sent {} to process {}", sig, pid);
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => {
                    debug!("Process {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(Errno::EPERM) => {
                    warn!("Permission denied to signal process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => TerminationResult::Failed(format!("{sig} failed: {e}")),
            }
        }

        /// All descendants of `root`, deepest first
        fn find_descendants(&self, root: ProcessId) -> Vec<ProcessId> {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, root, &mut children);
            children
        }

        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                    let child_pid = pid.as_u32();
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    /// PIDs 0 and above `i32::MAX` would address process groups instead of one process
    fn to_nix_pid(pid: ProcessId) -> Option<NixPid> {
        i32::try_from(pid).ok().filter(|raw| *raw > 0).map(NixPid::from_raw)
    }

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            debug!("Initializing Unix process manager");
            Self {
                system: Mutex::new(System::new()),
            }
        }

        fn platform_name(&self) -> &'static str {
            "Unix"
        }
    }

}

#[cfg(unix)]
pub use unix_impl::UnixProcessManager;

#[cfg(not(unix))]
pub struct UnixProcessManager;
