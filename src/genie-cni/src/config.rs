//! Genie network configuration
//!
//! Genie is configured like any other CNI plugin, through the network
//! configuration JSON passed on stdin. Directory layout, the ranking endpoint
//! and the default backend list can be overridden from the environment.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::GenieError;

/// Default directory holding backend configuration files
pub const DEFAULT_CONF_DIR: &str = "/etc/cni/net.d";

/// Default directory holding backend binaries
pub const DEFAULT_BIN_DIR: &str = "/opt/cni/bin";

/// Default cAdvisor endpoint used to rank backends
pub const DEFAULT_CADVISOR_URL: &str = "http://127.0.0.1:4194";

/// Backend used when nothing else selects one
pub const DEFAULT_BACKEND: &str = "weave";

/// Network configuration passed to genie
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#network-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,

    /// Network name
    pub name: String,

    /// CNI plugin type (matches binary name)
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Comma-separated backends used for workloads with no metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_plugin: Option<String>,

    /// Backend configuration directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf_dir: Option<PathBuf>,

    /// Backend binary directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<PathBuf>,

    /// cAdvisor endpoint for bandwidth ranking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadvisor_url: Option<String>,

    /// Explicit backend name to file mapping
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backends: BTreeMap<String, BackendPaths>,

    /// Kubernetes client settings
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// API access overrides
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Where a named backend's config and binary live
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<PathBuf>,
}

/// Kubernetes client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Path to kubeconfig (in-cluster or KUBECONFIG default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// API server URL, takes precedence over the policy block
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub k8s_api_root: String,
}

/// API server access overrides
///
/// Only the API root is honoured; credentials come from the kubeconfig.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub policy_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub k8s_api_root: String,
}

impl NetworkConfig {
    /// Parse the stdin configuration and apply environment overrides
    pub fn load(input: &str) -> Result<Self, GenieError> {
        let mut config = Self::parse(input)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse the stdin configuration
    pub fn parse(input: &str) -> Result<Self, GenieError> {
        serde_json::from_str(input)
            .map_err(|e| GenieError::decode("failed to parse network config", e))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = var("GENIE_CONF_DIR") {
            self.conf_dir = Some(PathBuf::from(dir));
        }

        if let Some(dir) = var("GENIE_BIN_DIR") {
            self.bin_dir = Some(PathBuf::from(dir));
        }

        if let Some(url) = var("GENIE_CADVISOR_URL") {
            self.cadvisor_url = Some(url);
        }

        if let Some(plugins) = var("GENIE_DEFAULT_PLUGIN") {
            self.default_plugin = Some(plugins);
        }

        if let Some(path) = var("GENIE_KUBECONFIG") {
            self.kubernetes.kubeconfig = Some(PathBuf::from(path));
        }
    }

    /// Get the backend configuration directory
    pub fn conf_dir(&self) -> PathBuf {
        self.conf_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_DIR))
    }

    /// Get the primary backend binary directory
    pub fn bin_dir(&self) -> PathBuf {
        self.bin_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BIN_DIR))
    }

    /// Binary search path: `CNI_PATH` entries first, then the bin dir
    pub fn plugin_path(&self, cni_path: Option<&str>) -> Vec<PathBuf> {
        let mut path: Vec<PathBuf> = cni_path
            .unwrap_or_default()
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();

        let bin_dir = self.bin_dir();
        if !path.contains(&bin_dir) {
            path.push(bin_dir);
        }
        path
    }

    /// Get the ranking service endpoint
    pub fn cadvisor_url(&self) -> &str {
        self.cadvisor_url.as_deref().unwrap_or(DEFAULT_CADVISOR_URL)
    }

    /// Backends used when the workload offers nothing to select on
    pub fn default_backends(&self) -> Vec<String> {
        let configured: Vec<String> = self
            .default_plugin
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        if configured.is_empty() {
            vec![DEFAULT_BACKEND.to_string()]
        } else {
            configured
        }
    }

    /// API server URL override, if any
    ///
    /// Older configs carried the full `/api/v1/` suffix on the policy root,
    /// so only the part before `/api/` is kept.
    pub fn api_root(&self) -> Option<String> {
        if !self.kubernetes.k8s_api_root.is_empty() {
            return Some(self.kubernetes.k8s_api_root.clone());
        }

        let root = self
            .policy
            .k8s_api_root
            .split("/api/")
            .next()
            .unwrap_or_default();
        if root.is_empty() {
            None
        } else {
            Some(root.to_string())
        }
    }
}
