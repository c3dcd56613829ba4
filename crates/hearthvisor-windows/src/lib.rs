//! Windows-specific process management implementation

mod windows_process_manager;

pub use windows_process_manager::WindowsProcessManager;

/// Windows-specific process manager factory
#[cfg(windows)]
pub struct WindowsProcessManagerFactory;

#[cfg(windows)]
impl hearthvisor_core::ProcessManagerFactory for WindowsProcessManagerFactory {
    type Manager = WindowsProcessManager;

    fn create_process_manager() -> Self::Manager {
        <WindowsProcessManager as hearthvisor_core::ProcessManager>::new()
    }
}
