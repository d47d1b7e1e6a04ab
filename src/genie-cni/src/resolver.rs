//! Backend config resolution
//!
//! Finds the configuration a backend is invoked with. When only the
//! backend's binary is installed, a default config is written for the
//! backends genie knows how to configure. A subnet requested for the
//! workload is applied on top of whatever was found.

use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::info;

use crate::error::GenieError;
use crate::netconf::{default_conf, ConfList};
use crate::registry::BackendRegistry;

/// Lock file serializing config synthesis on one host
pub const LOCK_FILE: &str = ".genie.lock";

/// Mode of synthesized config files
pub const CONF_FILE_MODE: u32 = 0o644;

/// Resolved configuration for one backend invocation
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Name the backend was selected by
    pub backend: String,

    /// File the config was read from or written to
    pub source: PathBuf,

    pub conf: ConfList,
}

impl BackendConfig {
    /// Plugin type of the first fragment
    pub fn backend_type(&self) -> &str {
        self.conf.backend_type()
    }
}

/// Resolves backend names to invocation configs
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    registry: BackendRegistry,
}

impl ConfigResolver {
    pub fn new(registry: BackendRegistry) -> Self {
        Self { registry }
    }

    /// Resolve the config for `backend`, synthesizing one if only its binary exists
    pub fn resolve(&self, backend: &str, subnet: Option<&str>) -> Result<BackendConfig, GenieError> {
        let mut config = match self.find(backend)? {
            Some(config) => config,
            None => self.synthesize(backend)?,
        };
        apply_subnet(&mut config, subnet)?;
        Ok(config)
    }

    /// Resolve the config for `backend` without ever writing one
    pub fn resolve_existing(
        &self,
        backend: &str,
        subnet: Option<&str>,
    ) -> Result<Option<BackendConfig>, GenieError> {
        let Some(mut config) = self.find(backend)? else {
            return Ok(None);
        };
        apply_subnet(&mut config, subnet)?;
        Ok(Some(config))
    }

    fn find(&self, backend: &str) -> Result<Option<BackendConfig>, GenieError> {
        Ok(self
            .registry
            .find_conf(backend)?
            .map(|(source, conf)| BackendConfig {
                backend: backend.to_string(),
                source,
                conf,
            }))
    }

    /// Write and return a default config for a backend with only a binary
    fn synthesize(&self, backend: &str) -> Result<BackendConfig, GenieError> {
        let unsupported = || GenieError::UnsupportedBackend {
            backend: backend.to_string(),
        };

        let binary = self.registry.find_binary(backend).ok_or_else(unsupported)?;
        let template = default_conf(backend).ok_or_else(unsupported)?;

        let conf_dir = self.registry.conf_dir();
        let path = conf_dir.join(format!("10-{}.conf", backend));

        let conf = with_conf_lock(conf_dir, || {
            // Another attachment may have written it while we waited
            if path.exists() {
                return ConfList::from_file(&path);
            }

            let data = serde_json::to_vec_pretty(&template)
                .map_err(|e| GenieError::decode("failed to encode default config", e))?;
            write_conf_file(&path, &data)?;
            ConfList::from_bytes(&path, &data)
        })?;

        info!(
            backend,
            binary = %binary.display(),
            path = %path.display(),
            "placed default config"
        );

        Ok(BackendConfig {
            backend: backend.to_string(),
            source: path,
            conf,
        })
    }
}

fn apply_subnet(config: &mut BackendConfig, subnet: Option<&str>) -> Result<(), GenieError> {
    if let Some(subnet) = subnet {
        config.conf.set_subnet(subnet).map_err(|e| {
            GenieError::InvalidConfig(format!(
                "cannot apply subnet to backend {}: {}",
                config.backend, e
            ))
        })?;
    }
    Ok(())
}

/// Execute a function while holding the config dir lock
fn with_conf_lock<T, F>(conf_dir: &Path, f: F) -> Result<T, GenieError>
where
    F: FnOnce() -> Result<T, GenieError>,
{
    fs::create_dir_all(conf_dir).map_err(|e| {
        GenieError::io(format!("failed to create config dir {}", conf_dir.display()), e)
    })?;

    let lock_path = conf_dir.join(LOCK_FILE);
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| GenieError::io("failed to open config lock file", e))?;

    lock_file
        .lock_exclusive()
        .map_err(|e| GenieError::io("failed to acquire config lock", e))?;

    let result = f();

    lock_file
        .unlock()
        .map_err(|e| GenieError::io("failed to release config lock", e))?;

    result
}

/// Write a config file atomically with fixed permissions
fn write_conf_file(path: &Path, data: &[u8]) -> Result<(), GenieError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("genie.conf");
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(CONF_FILE_MODE)
        .open(&tmp_path)
        .map_err(|e| GenieError::io("failed to create config temp file", e))?;

    file.write_all(data)
        .map_err(|e| GenieError::io("failed to write config temp file", e))?;

    file.sync_all()
        .map_err(|e| GenieError::io("failed to sync config temp file", e))?;

    // umask may have narrowed the mode
    fs::set_permissions(&tmp_path, Permissions::from_mode(CONF_FILE_MODE))
        .map_err(|e| GenieError::io("failed to set config file permissions", e))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        GenieError::io(format!("failed to place config file {}", path.display()), e)
    })
}
