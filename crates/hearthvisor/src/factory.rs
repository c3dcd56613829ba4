use hearthvisor_core::ProcessManagerFactory;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    #[cfg(unix)]
    type Manager = hearthvisor_unix::UnixProcessManager;

    #[cfg(windows)]
    type Manager = hearthvisor_windows::WindowsProcessManager;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return hearthvisor_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return hearthvisor_windows::WindowsProcessManagerFactory::create_process_manager();
    }
}

/// Process manager of the platform this binary was built for
pub type PlatformProcessManager = <PlatformProcessManagerFactory as ProcessManagerFactory>::Manager;
