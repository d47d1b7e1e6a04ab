//! Workload identity
//!
//! Builds the identity of the pod or container being attached from the CNI
//! environment and the `CNI_ARGS` key/value list.

use std::collections::BTreeMap;

use crate::error::GenieError;

/// Orchestrator arguments carried in `CNI_ARGS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sArgs {
    pub ignore_unknown: bool,
    pub pod_namespace: Option<String>,
    pub pod_name: Option<String>,
    pub pod_infra_container_id: Option<String>,
    /// Annotations passed inline, used when the pod cannot be read
    pub annotations: Option<String>,
}

impl K8sArgs {
    /// Parse a `CNI_ARGS` string (`KEY=VALUE;KEY=VALUE`)
    ///
    /// Unknown keys are rejected unless `IgnoreUnknown` is set to a true value.
    pub fn parse(args: &str) -> Result<Self, GenieError> {
        let mut parsed = Self::default();
        let mut unknown = Vec::new();

        for pair in args.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                GenieError::InvalidArgs(format!("CNI_ARGS entry without '=': {}", pair))
            })?;

            let value = value.to_string();
            match key {
                "IgnoreUnknown" => {
                    parsed.ignore_unknown =
                        matches!(value.to_ascii_lowercase().as_str(), "1" | "true");
                }
                "K8S_POD_NAMESPACE" => parsed.pod_namespace = non_empty(value),
                "K8S_POD_NAME" => parsed.pod_name = non_empty(value),
                "K8S_POD_INFRA_CONTAINER_ID" => parsed.pod_infra_container_id = non_empty(value),
                "K8S_ANNOT" => parsed.annotations = non_empty(value),
                _ => unknown.push(key.to_string()),
            }
        }

        if !unknown.is_empty() && !parsed.ignore_unknown {
            return Err(GenieError::InvalidArgs(format!(
                "unknown CNI_ARGS keys: {}",
                unknown.join(", ")
            )));
        }

        Ok(parsed)
    }

    /// Decode the inline annotations, if any were passed
    pub fn inline_annotations(&self) -> Option<Result<BTreeMap<String, String>, GenieError>> {
        self.annotations.as_deref().map(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| GenieError::decode("failed to decode K8S_ANNOT", e))
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Pod reference in orchestrated mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

/// The pod or container being attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadIdentity {
    pub container_id: String,
    pub netns: String,
    /// Interface name the runtime asked for
    pub ifname: String,
    /// Set only when both namespace and name were given
    pub pod: Option<PodRef>,
    pub args: K8sArgs,
}

impl WorkloadIdentity {
    /// Build the identity from the CNI request
    ///
    /// A namespace without a name (or the other way round) is treated as
    /// standalone mode rather than a half-set pod reference.
    pub fn new(container_id: String, netns: String, ifname: String, args: K8sArgs) -> Self {
        let pod = match (&args.pod_namespace, &args.pod_name) {
            (Some(namespace), Some(name)) => Some(PodRef {
                namespace: namespace.clone(),
                name: name.clone(),
            }),
            _ => None,
        };

        Self {
            container_id,
            netns,
            ifname,
            pod,
            args,
        }
    }

    /// `namespace.name` for pods, the container ID otherwise
    pub fn workload_id(&self) -> String {
        match &self.pod {
            Some(pod) => format!("{}.{}", pod.namespace, pod.name),
            None => self.container_id.clone(),
        }
    }

    /// `k8s` for pods, `cni` for standalone containers
    pub fn orchestrator(&self) -> &'static str {
        if self.pod.is_some() {
            "k8s"
        } else {
            "cni"
        }
    }
}
