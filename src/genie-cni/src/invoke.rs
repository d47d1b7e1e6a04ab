//! Backend invocation
//!
//! Runs a backend's ADD or DEL through the CNI exec protocol: the plugin
//! binary is found on the search path, the request goes in through `CNI_*`
//! environment variables and the config on stdin, and the result (or a CNI
//! error) comes back on stdout.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::GenieError;
use crate::resolver::BackendConfig;
use crate::result::CniResult;
use crate::workload::WorkloadIdentity;

/// Environment variables of the CNI protocol
///
/// All of them are removed from the inherited environment before a backend
/// runs, so nothing meant for genie (or for an earlier backend) leaks through.
pub const CNI_ENV_VARS: &[&str] = &[
    "CNI_COMMAND",
    "CNI_CONTAINERID",
    "CNI_NETNS",
    "CNI_IFNAME",
    "CNI_ARGS",
    "CNI_PATH",
];

/// Per-invocation runtime parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConf {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    /// Orchestrator key/value pairs, in `CNI_ARGS` order
    pub args: Vec<(String, String)>,
}

impl RuntimeConf {
    /// Build the runtime parameters for attaching `workload` on `ifname`
    pub fn new(workload: &WorkloadIdentity, ifname: &str) -> Self {
        let k8s = &workload.args;
        let mut args = Vec::new();

        if k8s.ignore_unknown {
            args.push(("IgnoreUnknown".to_string(), "1".to_string()));
        }
        let optional = [
            ("K8S_POD_NAMESPACE", &k8s.pod_namespace),
            ("K8S_POD_NAME", &k8s.pod_name),
            ("K8S_POD_INFRA_CONTAINER_ID", &k8s.pod_infra_container_id),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                args.push((key.to_string(), value.clone()));
            }
        }

        Self {
            container_id: workload.container_id.clone(),
            netns: workload.netns.clone(),
            ifname: ifname.to_string(),
            args,
        }
    }

    /// `CNI_ARGS` value
    pub fn cni_args(&self) -> String {
        self.args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Protocol environment for running `command`
    pub fn environment(&self, command: &str, path: &[PathBuf]) -> Vec<(&'static str, String)> {
        let path = path
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        vec![
            ("CNI_COMMAND", command.to_string()),
            ("CNI_CONTAINERID", self.container_id.clone()),
            ("CNI_NETNS", self.netns.clone()),
            ("CNI_IFNAME", self.ifname.clone()),
            ("CNI_ARGS", self.cni_args()),
            ("CNI_PATH", path),
        ]
    }
}

/// Executes backend operations
#[cfg_attr(test, automock)]
pub trait PluginExecutor {
    /// Run ADD for the whole config chain and return the final result
    fn add(&self, config: &BackendConfig, rt: &RuntimeConf) -> Result<CniResult, GenieError>;

    /// Run DEL for the whole config chain, last plugin first
    fn del(&self, config: &BackendConfig, rt: &RuntimeConf) -> Result<(), GenieError>;
}

/// Error object a plugin prints on failure
#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: Option<String>,
}

/// Runs plugin binaries found on a search path
#[derive(Debug, Clone)]
pub struct ExecPlugins {
    path: Vec<PathBuf>,
}

impl ExecPlugins {
    pub fn new(path: Vec<PathBuf>) -> Self {
        Self { path }
    }

    fn find_binary(&self, backend: &str, plugin_type: &str) -> Result<PathBuf, GenieError> {
        self.path
            .iter()
            .map(|dir| dir.join(plugin_type))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                GenieError::InvalidConfig(format!(
                    "backend {}: plugin binary {} not found in {:?}",
                    backend, plugin_type, self.path
                ))
            })
    }

    fn exec(
        &self,
        backend: &str,
        command: &'static str,
        binary: &Path,
        stdin: &[u8],
        rt: &RuntimeConf,
    ) -> Result<Vec<u8>, GenieError> {
        debug!(backend, command, binary = %binary.display(), ifname = %rt.ifname, "executing plugin");

        let mut cmd = Command::new(binary);
        for var in CNI_ENV_VARS {
            cmd.env_remove(var);
        }
        cmd.envs(rt.environment(command, &self.path))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            GenieError::invocation(backend, command, format!("failed to start {}: {}", binary.display(), e))
        })?;

        if let Some(mut input) = child.stdin.take() {
            match input.write_all(stdin) {
                Ok(()) => {}
                // Plugin exited without reading its config
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(backend, command, "plugin closed stdin early");
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GenieError::invocation(
                        backend,
                        command,
                        format!("failed to write config: {}", e),
                    ));
                }
            }
        }

        let output = child.wait_with_output().map_err(|e| {
            GenieError::invocation(backend, command, format!("failed to wait for plugin: {}", e))
        })?;

        if !output.status.success() {
            let reason = match serde_json::from_slice::<PluginError>(&output.stdout) {
                Ok(err) => match err.details {
                    Some(details) => format!("{} (code {}): {}", err.msg, err.code, details),
                    None => format!("{} (code {})", err.msg, err.code),
                },
                Err(_) => format!("{} exited with {}", binary.display(), output.status),
            };
            return Err(GenieError::invocation(backend, command, reason));
        }

        Ok(output.stdout)
    }
}

impl PluginExecutor for ExecPlugins {
    fn add(&self, config: &BackendConfig, rt: &RuntimeConf) -> Result<CniResult, GenieError> {
        let mut prev: Option<CniResult> = None;

        for (index, plugin) in config.conf.plugins.iter().enumerate() {
            let binary = self.find_binary(&config.backend, &plugin.plugin_type)?;
            let stdin = config.conf.plugin_stdin(index, prev.as_ref())?;
            let stdout = self.exec(&config.backend, "ADD", &binary, &stdin, rt)?;

            let result = CniResult::from_slice(&stdout).map_err(|e| {
                GenieError::invocation(&config.backend, "ADD", format!("bad result from {}: {}", plugin.plugin_type, e))
            })?;
            prev = Some(result);
        }

        let result = prev.ok_or_else(|| {
            GenieError::invocation(&config.backend, "ADD", "config chain has no plugins")
        })?;
        info!(
            backend = %config.backend,
            ifname = %rt.ifname,
            interfaces = result.interfaces.len(),
            ips = result.ips.len(),
            "backend ADD complete"
        );
        Ok(result)
    }

    fn del(&self, config: &BackendConfig, rt: &RuntimeConf) -> Result<(), GenieError> {
        for (index, plugin) in config.conf.plugins.iter().enumerate().rev() {
            let binary = self.find_binary(&config.backend, &plugin.plugin_type)?;
            let stdin = config.conf.plugin_stdin(index, None)?;
            self.exec(&config.backend, "DEL", &binary, &stdin, rt)?;
        }

        info!(backend = %config.backend, ifname = %rt.ifname, "backend DEL complete");
        Ok(())
    }
}
