#[cfg(windows)]
mod windows_impl {
    use async_trait::async_trait;
    use hearthvisor_core::{
        ChildProcessHandle, LaunchSpec, Launched, ProcessControl, ProcessHandle, ProcessId,
        ProcessLifecycle, ProcessManager, SpawnError, TerminationResult, launch_command,
    };
    use std::sync::{Mutex, PoisonError};
    use sysinfo::{Pid, System};
    use tokio::process::Command;
    use tracing::{debug, info, warn};

    /// Creates a process without a console window
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    /// Windows process manager; termination goes through `taskkill` on the whole tree
    pub struct WindowsProcessManager {
        system: Mutex<System>,
    }

    impl Default for WindowsProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for WindowsProcessManager {
        type Handle = ChildProcessHandle;

        async fn launch(&self, spec: &LaunchSpec) -> Result<Launched<Self::Handle>, SpawnError> {
            let mut cmd = Command::new(&spec.command);
            cmd.creation_flags(CREATE_NO_WINDOW);

            let launched = launch_command(cmd, spec)?;
            info!(
                service = %spec.name,
                pid = ?launched.handle.pid(),
                "Spawned Windows process: {} with args: {:?}",
                spec.command,
                spec.args
            );
            Ok(launched)
        }
    }

    #[async_trait]
    impl ProcessControl for WindowsProcessManager {
        async fn send_graceful_stop(&self, pid: ProcessId) -> TerminationResult {
            Self::taskkill(pid, false).await
        }

        async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
            Self::taskkill(pid, true).await
        }

        fn is_alive(&self, pid: ProcessId) -> bool {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            let target = Pid::from_u32(pid);
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[target]), true);
            system.process(target).is_some()
        }
    }

    impl WindowsProcessManager {
        /// `taskkill /T` on the process tree, with `/F` when forcing
        async fn taskkill(pid: ProcessId, force: bool) -> TerminationResult {
            let pid_arg = pid.to_string();
            let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
            if force {
                args.push("/F");
            }

            match Command::new("taskkill").args(&args).output().await {
                Ok(output) if output.status.success() => {
                    debug!("taskkill {:?} succeeded", args);
                    TerminationResult::Success
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    // taskkill exits with 128 when the process does not exist
                    if output.status.code() == Some(128) {
                        TerminationResult::ProcessNotFound
                    } else if stderr.contains("Access is denied") {
                        warn!("Permission denied to terminate process {}", pid);
                        TerminationResult::AccessDenied
                    } else {
                        TerminationResult::Failed(stderr.trim().to_string())
                    }
                }
                Err(e) => {
                    warn!("Failed to run taskkill for process {}: {}", pid, e);
                    TerminationResult::Failed(format!("taskkill failed: {e}"))
                }
            }
        }
    }

    impl ProcessManager for WindowsProcessManager {
        fn new() -> Self {
            debug!("Initializing Windows process manager");
            Self {
                system: Mutex::new(System::new()),
            }
        }

        fn platform_name(&self) -> &'static str {
            "Windows"
        }
    }

}

#[cfg(windows)]
pub use windows_impl::WindowsProcessManager;

#[cfg(not(windows))]
pub struct WindowsProcessManager;
