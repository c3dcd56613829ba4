mod unix_process_manager;

pub use unix_process_manager::UnixProcessManager;

#[cfg(unix)]
pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl hearthvisor_core::ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager() -> Self::Manager {
        <UnixProcessManager as hearthvisor_core::ProcessManager>::new()
    }
}
