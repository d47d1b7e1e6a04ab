//! Cluster state access
//!
//! The narrow slice of the Kubernetes API genie needs: reading a pod's
//! annotations, merge-patching them, and looking up logical networks.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::GenieError;

/// API group of the logical network resource
pub const LOGICAL_NETWORK_GROUP: &str = "alpha.network.k8s.io";
pub const LOGICAL_NETWORK_VERSION: &str = "v1";
pub const LOGICAL_NETWORK_KIND: &str = "LogicalNetwork";
pub const LOGICAL_NETWORK_PLURAL: &str = "logicalnetworks";

/// Spec of a cluster-side logical network
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalNetwork {
    /// Backend serving this network
    pub plugin: String,

    /// Subnet workloads on this network draw from
    #[serde(default)]
    pub subnet: Option<String>,
}

/// Read and update workload metadata
#[cfg_attr(test, automock)]
pub trait ClusterClient {
    /// Annotations of a pod; a pod with none yields an empty map
    fn pod_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, GenieError>;

    /// Apply a JSON merge-patch to a pod
    fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), GenieError>;

    /// Look up a logical network
    fn logical_network(&self, namespace: &str, name: &str) -> Result<LogicalNetwork, GenieError>;
}

/// Build `{"metadata":{"annotations":{key: value}}}`
pub fn annotation_patch(key: &str, value: &str) -> Value {
    let mut annotations = serde_json::Map::new();
    annotations.insert(key.to_string(), Value::String(value.to_string()));
    serde_json::json!({ "metadata": { "annotations": annotations } })
}

/// Cluster client backed by the Kubernetes API
pub struct KubeClusterClient {
    runtime: Runtime,
    client: Client,
}

impl KubeClusterClient {
    /// Connect using the kubeconfig and API root from genie's config
    pub fn from_config(config: &NetworkConfig) -> Result<Self, GenieError> {
        let runtime = Runtime::new()
            .map_err(|e| GenieError::io("failed to create tokio runtime", e))?;

        let client = runtime.block_on(connect(config))?;
        Ok(Self { runtime, client })
    }
}

async fn connect(config: &NetworkConfig) -> Result<Client, GenieError> {
    let mut kube_config = match &config.kubernetes.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                GenieError::Cluster(format!("failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| GenieError::Cluster(format!("invalid kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| GenieError::Cluster(format!("failed to infer kube config: {}", e)))?,
    };

    if let Some(root) = config.api_root() {
        kube_config.cluster_url = root.parse::<http::Uri>().map_err(|e| {
            GenieError::InvalidConfig(format!("invalid API root {}: {}", root, e))
        })?;
    }

    debug!(cluster_url = %kube_config.cluster_url, "connecting to kubernetes");
    Client::try_from(kube_config)
        .map_err(|e| GenieError::Cluster(format!("failed to create kube client: {}", e)))
}

impl ClusterClient for KubeClusterClient {
    fn pod_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, GenieError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = self.runtime.block_on(pods.get(name)).map_err(|e| {
            GenieError::Cluster(format!("failed to get pod {}/{}: {}", namespace, name, e))
        })?;

        Ok(pod.metadata.annotations.unwrap_or_default())
    }

    fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), GenieError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.runtime
            .block_on(pods.patch(name, &PatchParams::default(), &Patch::Merge(patch)))
            .map_err(|e| GenieError::MetadataPatchFailure {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn logical_network(&self, namespace: &str, name: &str) -> Result<LogicalNetwork, GenieError> {
        let gvk = GroupVersionKind::gvk(
            LOGICAL_NETWORK_GROUP,
            LOGICAL_NETWORK_VERSION,
            LOGICAL_NETWORK_KIND,
        );
        let resource = ApiResource::from_gvk_with_plural(&gvk, LOGICAL_NETWORK_PLURAL);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        let object = self.runtime.block_on(api.get(name)).map_err(|e| {
            GenieError::Cluster(format!(
                "failed to get logical network {}/{}: {}",
                namespace, name, e
            ))
        })?;

        parse_logical_network(name, object.data)
    }
}

fn parse_logical_network(name: &str, data: Value) -> Result<LogicalNetwork, GenieError> {
    let spec = data
        .get("spec")
        .cloned()
        .ok_or_else(|| GenieError::Cluster(format!("logical network {} has no spec", name)))?;

    serde_json::from_value(spec)
        .map_err(|e| GenieError::decode(format!("invalid logical network {}", name), e))
}
