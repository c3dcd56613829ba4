use hearthvisor_core::{OrchestratorError, ProcessControl, ProcessId};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOCK_FILE_NAME: &str = "hearthvisor.lock";

const LOCK_ATTEMPTS: usize = 3;

/// Single-instance guard: a lock file in the data directory holding the owner's PID
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    released: bool,
}

impl InstanceLock {
    /// Take the lock, replacing a stale file whose PID no longer exists.
    ///
    /// The lock file appears atomically with its PID already written, so of two
    /// instances starting together exactly one wins.
    pub fn acquire(
        data_dir: &Path,
        control: &impl ProcessControl,
    ) -> Result<Self, OrchestratorError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE_NAME);

        for _ in 0..LOCK_ATTEMPTS {
            match publish_pid(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Acquired instance lock");
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let owner = fs::read_to_string(&path)
                .ok()
                .and_then(|contents| contents.trim().parse::<ProcessId>().ok());
            if let Some(pid) = owner.filter(|pid| control.is_alive(*pid)) {
                return Err(OrchestratorError::InstanceLocked { pid });
            }

            warn!(path = %path.display(), owner = ?owner, "Replacing stale instance lock");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(OrchestratorError::configuration(format!(
            "instance lock {} keeps changing owner",
            path.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        fs::remove_file(&self.path)
    }
}

/// Write our PID to a private file, then hard-link it into place. Linking fails with
/// `AlreadyExists` when another instance holds the lock.
fn publish_pid(path: &Path) -> io::Result<()> {
    let staging = path.with_extension(format!("lock.{}", Uuid::new_v4().simple()));
    fs::write(&staging, std::process::id().to_string())?;
    let linked = fs::hard_link(&staging, path);
    if let Err(e) = fs::remove_file(&staging) {
        debug!(path = %staging.display(), error = %e, "Failed to remove staging lock file");
    }
    linked
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}
