use hearthvisor_core::OrchestratorError;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

pub const SECRETS_FILE_NAME: &str = "secrets.json";

/// Generated secrets persisted in the data directory, created once and reused on every run
#[derive(Debug)]
pub struct SecretStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl SecretStore {
    pub fn open(data_dir: &Path) -> Result<Self, OrchestratorError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(SECRETS_FILE_NAME);

        let values = if path.exists() {
            restrict_to_owner(&path)?;
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| {
                OrchestratorError::configuration(format!(
                    "Invalid secrets file {}: {e}",
                    path.display()
                ))
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, values })
    }

    /// A value for every name, taken from the process environment when set
    pub fn ensure(&mut self, names: &[String]) -> Result<HashMap<String, String>, OrchestratorError> {
        self.ensure_with(names, |name| std::env::var(name).ok())
    }

    /// Like [`SecretStore::ensure`], reading overrides through `lookup`
    pub fn ensure_with(
        &mut self,
        names: &[String],
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<HashMap<String, String>, OrchestratorError> {
        let mut resolved = HashMap::new();
        let mut generated = false;

        for name in names {
            if let Some(value) = lookup(name).filter(|value| !value.is_empty()) {
                resolved.insert(name.clone(), value);
                continue;
            }

            let value = self.values.entry(name.clone()).or_insert_with(|| {
                generated = true;
                info!(secret = %name, "Generated new secret");
                generate_secret()
            });
            resolved.insert(name.clone(), value.clone());
        }

        if generated {
            self.persist()?;
        }
        Ok(resolved)
    }

    fn persist(&self) -> Result<(), OrchestratorError> {
        let contents = serde_json::to_string_pretty(&self.values)
            .map_err(|e| OrchestratorError::Other(e.into()))?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        // The creation mode only applies to new files
        restrict_to_owner(&self.path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// 64 lowercase hex characters from two random UUIDs
fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}
