//! Backend selection
//!
//! Decides which backends attach a workload, in this order of precedence:
//!
//! 1. the `cni` annotation, a comma-separated backend list
//! 2. the `networks` annotation, a JSON list of logical networks
//! 3. the ranking service, for pods that declare neither
//! 4. the configured default backends, for standalone containers
//!
//! Selection never writes to the cluster itself. A choice that should be
//! remembered on the pod comes back as a patch for the caller to apply.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cluster::{annotation_patch, ClusterClient};
use crate::config::NetworkConfig;
use crate::error::GenieError;
use crate::ranking::RankingService;
use crate::workload::{PodRef, WorkloadIdentity};

/// Annotation holding an explicit backend list
pub const CNI_ANNOTATION: &str = "cni";

/// Annotation holding a logical network list
pub const NETWORKS_ANNOTATION: &str = "networks";

/// One backend chosen for a workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSelection {
    pub backend: String,
    /// Interface the backend creates inside the workload
    pub ifname: String,
    pub subnet: Option<String>,
}

impl BackendSelection {
    fn new(index: usize, backend: String, ifname: Option<String>, subnet: Option<String>) -> Self {
        Self {
            backend,
            ifname: ifname
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| default_ifname(index)),
            subnet,
        }
    }
}

/// `eth<i>` for the i-th selection
pub fn default_ifname(index: usize) -> String {
    format!("eth{}", index)
}

/// Everything selection reads for one call
#[derive(Debug, Clone)]
pub struct SelectionContext {
    /// Set in orchestrated mode
    pub pod: Option<PodRef>,
    /// Workload annotations; `None` when the workload has no metadata
    pub annotations: Option<BTreeMap<String, String>>,
    pub default_backends: Vec<String>,
}

impl SelectionContext {
    /// Gather the selection inputs for `workload`
    ///
    /// Pods have their annotations read from the cluster, falling back to
    /// annotations passed inline through `K8S_ANNOT`. A pod whose metadata is
    /// unavailable both ways cannot be selected for.
    pub fn gather(
        workload: &WorkloadIdentity,
        config: &NetworkConfig,
        cluster: Option<&dyn ClusterClient>,
    ) -> Result<Self, GenieError> {
        let default_backends = config.default_backends();

        let Some(pod) = &workload.pod else {
            let annotations = workload.args.inline_annotations().transpose()?;
            return Ok(Self {
                pod: None,
                annotations,
                default_backends,
            });
        };

        let from_cluster = match cluster {
            Some(cluster) => match cluster.pod_annotations(&pod.namespace, &pod.name) {
                Ok(annotations) => Some(annotations),
                Err(e) => {
                    warn!(
                        namespace = %pod.namespace,
                        pod = %pod.name,
                        error = %e,
                        "failed to read pod annotations"
                    );
                    None
                }
            },
            None => None,
        };

        let annotations = match from_cluster {
            Some(annotations) => annotations,
            None => match workload.args.inline_annotations() {
                Some(inline) => inline?,
                None => {
                    return Err(GenieError::SelectionFailure(format!(
                        "annotations of pod {}/{} are unavailable",
                        pod.namespace, pod.name
                    )))
                }
            },
        };

        Ok(Self {
            pod: Some(pod.clone()),
            annotations: Some(annotations),
            default_backends,
        })
    }

    /// Non-blank value of annotation `key`
    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()?
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

/// Outcome of selection
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub backends: Vec<BackendSelection>,
    /// Patch recording the choice on the pod, applied best-effort
    pub persist: Option<Value>,
}

impl Selection {
    fn declared(backends: Vec<BackendSelection>) -> Self {
        Self {
            backends,
            persist: None,
        }
    }
}

/// Entry of the `networks` annotation
#[derive(Debug, Clone, Deserialize)]
struct NetworkRequest {
    name: String,
    #[serde(default)]
    interface: Option<String>,
    #[serde(default)]
    subnet: Option<String>,
}

/// Applies the selection rules
pub struct BackendSelector<'a> {
    cluster: Option<&'a dyn ClusterClient>,
    ranking: Option<&'a dyn RankingService>,
}

impl<'a> BackendSelector<'a> {
    pub fn new(
        cluster: Option<&'a dyn ClusterClient>,
        ranking: Option<&'a dyn RankingService>,
    ) -> Self {
        Self { cluster, ranking }
    }

    /// Select the backends for a workload
    pub fn select(&self, ctx: &SelectionContext) -> Result<Selection, GenieError> {
        if let Some(list) = ctx.annotation(CNI_ANNOTATION) {
            let backends = parse_backend_list(list);
            info!(backends = ?names(&backends), "backends selected by annotation");
            return Ok(Selection::declared(backends));
        }

        if let Some(networks) = ctx.annotation(NETWORKS_ANNOTATION) {
            let backends = self.from_networks(ctx, networks)?;
            info!(backends = ?names(&backends), "backends selected by logical networks");
            return Ok(Selection::declared(backends));
        }

        if ctx.pod.is_some() {
            return self.from_ranking();
        }

        let backends: Vec<BackendSelection> = ctx
            .default_backends
            .iter()
            .enumerate()
            .map(|(i, name)| BackendSelection::new(i, name.clone(), None, None))
            .collect();
        debug!(backends = ?names(&backends), "using default backends");
        Ok(Selection::declared(backends))
    }

    fn from_networks(
        &self,
        ctx: &SelectionContext,
        networks: &str,
    ) -> Result<Vec<BackendSelection>, GenieError> {
        let (Some(pod), Some(cluster)) = (&ctx.pod, self.cluster) else {
            return Err(GenieError::SelectionFailure(
                "logical networks require a pod and cluster access".to_string(),
            ));
        };

        let requests: Vec<NetworkRequest> = serde_json::from_str(networks).map_err(|e| {
            GenieError::SelectionFailure(format!("invalid {} annotation: {}", NETWORKS_ANNOTATION, e))
        })?;

        requests
            .into_iter()
            .enumerate()
            .map(|(i, request)| {
                let network = cluster
                    .logical_network(&pod.namespace, &request.name)
                    .map_err(|e| {
                        GenieError::SelectionFailure(format!(
                            "logical network {}: {}",
                            request.name, e
                        ))
                    })?;

                let subnet = request.subnet.filter(|s| !s.is_empty()).or(network.subnet);
                Ok(BackendSelection::new(i, network.plugin, request.interface, subnet))
            })
            .collect()
    }

    fn from_ranking(&self) -> Result<Selection, GenieError> {
        let ranking = self.ranking.ok_or_else(|| {
            GenieError::SelectionFailure("no backend declared and no ranking service".to_string())
        })?;

        let backend = ranking
            .best_backend()
            .map_err(|e| GenieError::SelectionFailure(e.to_string()))?;
        info!(backend = %backend, "backend selected by ranking");

        Ok(Selection {
            persist: Some(annotation_patch(CNI_ANNOTATION, &backend)),
            backends: vec![BackendSelection::new(0, backend, None, None)],
        })
    }
}

/// Split a `cni` annotation, keeping empty entries in place
fn parse_backend_list(list: &str) -> Vec<BackendSelection> {
    list.split(',')
        .enumerate()
        .map(|(i, name)| BackendSelection::new(i, name.trim().to_string(), None, None))
        .collect()
}

fn names(backends: &[BackendSelection]) -> Vec<&str> {
    backends.iter().map(|b| b.backend.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{LogicalNetwork, MockClusterClient};
    use crate::ranking::MockRankingService;
    use crate::workload::K8sArgs;
    use serde_json::json;

    fn pod_context(annotations: &[(&str, &str)]) -> SelectionContext {
        SelectionContext {
            pod: Some(PodRef {
                namespace: "default".to_string(),
                name: "nginx".to_string(),
            }),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            default_backends: vec!["weave".to_string()],
        }
    }

    fn standalone_context(defaults: &[&str]) -> SelectionContext {
        SelectionContext {
            pod: None,
            annotations: None,
            default_backends: defaults.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn config() -> NetworkConfig {
        NetworkConfig::parse(r#"{"cniVersion": "0.3.1", "name": "n", "type": "genie"}"#).unwrap()
    }

    fn workload(args: &str) -> WorkloadIdentity {
        WorkloadIdentity::new(
            "ctr1".to_string(),
            "/proc/1/ns/net".to_string(),
            "eth0".to_string(),
            K8sArgs::parse(args).unwrap(),
        )
    }

    fn names_of(selection: &Selection) -> Vec<&str> {
        names(&selection.backends)
    }

    #[test]
    fn test_cni_annotation_in_order() {
        let selection = BackendSelector::new(None, None)
            .select(&pod_context(&[("cni", "bridge,macvlan")]))
            .unwrap();

        assert_eq!(
            selection.backends,
            vec![
                BackendSelection {
                    backend: "bridge".to_string(),
                    ifname: "eth0".to_string(),
                    subnet: None
                },
                BackendSelection {
                    backend: "macvlan".to_string(),
                    ifname: "eth1".to_string(),
                    subnet: None
                },
            ]
        );
        assert!(selection.persist.is_none());
    }

    #[test]
    fn test_cni_annotation_trims_and_keeps_empty_entries() {
        let selection = BackendSelector::new(None, None)
            .select(&pod_context(&[("cni", " weave ,, calico")]))
            .unwrap();
        assert_eq!(names_of(&selection), vec!["weave", "", "calico"]);
        assert_eq!(selection.backends[2].ifname, "eth2");
    }

    #[test]
    fn test_cni_annotation_wins_over_networks() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_logical_network().never();

        let ctx = pod_context(&[("cni", "weave"), ("networks", r#"[{"name": "net-a"}]"#)]);
        let selection = BackendSelector::new(Some(&cluster), None).select(&ctx).unwrap();
        assert_eq!(names_of(&selection), vec!["weave"]);
    }

    #[test]
    fn test_networks_annotation_resolves_logical_networks() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_logical_network()
            .times(2)
            .returning(|_, name| {
                Ok(match name {
                    "fast" => LogicalNetwork {
                        plugin: "macvlan".to_string(),
                        subnet: Some("10.20.0.0/16".to_string()),
                    },
                    _ => LogicalNetwork {
                        plugin: "flannel".to_string(),
                        subnet: Some("10.244.0.0/16".to_string()),
                    },
                })
            });

        let ctx = pod_context(&[(
            "networks",
            r#"[{"name": "default-net"}, {"name": "fast", "interface": "net1", "subnet": "10.20.5.0/24"}]"#,
        )]);
        let selection = BackendSelector::new(Some(&cluster), None).select(&ctx).unwrap();

        assert_eq!(
            selection.backends,
            vec![
                BackendSelection {
                    backend: "flannel".to_string(),
                    ifname: "eth0".to_string(),
                    subnet: Some("10.244.0.0/16".to_string())
                },
                BackendSelection {
                    backend: "macvlan".to_string(),
                    ifname: "net1".to_string(),
                    subnet: Some("10.20.5.0/24".to_string())
                },
            ]
        );
    }

    #[test]
    fn test_networks_lookup_failure_is_selection_failure() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_logical_network()
            .returning(|_, _| Err(GenieError::Cluster("not found".to_string())));

        let ctx = pod_context(&[("networks", r#"[{"name": "missing"}]"#)]);
        let err = BackendSelector::new(Some(&cluster), None).select(&ctx).unwrap_err();
        assert!(matches!(err, GenieError::SelectionFailure(_)));
    }

    #[test]
    fn test_malformed_networks_annotation() {
        let cluster = MockClusterClient::new();
        let ctx = pod_context(&[("networks", "fast,slow")]);
        assert!(matches!(
            BackendSelector::new(Some(&cluster), None).select(&ctx),
            Err(GenieError::SelectionFailure(_))
        ));
    }

    #[test]
    fn test_ranking_selects_and_persists() {
        let mut ranking = MockRankingService::new();
        ranking
            .expect_best_backend()
            .times(1)
            .returning(|| Ok("weave".to_string()));

        let selection = BackendSelector::new(None, Some(&ranking))
            .select(&pod_context(&[("cni", "   ")]))
            .unwrap();

        assert_eq!(names_of(&selection), vec!["weave"]);
        assert_eq!(
            selection.persist,
            Some(json!({"metadata": {"annotations": {"cni": "weave"}}}))
        );
    }

    #[test]
    fn test_ranking_failure_does_not_fall_back_to_defaults() {
        let mut ranking = MockRankingService::new();
        ranking
            .expect_best_backend()
            .returning(|| Err(GenieError::Ranking("connection refused".to_string())));

        let err = BackendSelector::new(None, Some(&ranking))
            .select(&pod_context(&[]))
            .unwrap_err();
        assert!(matches!(err, GenieError::SelectionFailure(_)));
    }

    #[test]
    fn test_standalone_uses_defaults() {
        let mut ranking = MockRankingService::new();
        ranking.expect_best_backend().never();

        let selection = BackendSelector::new(None, Some(&ranking))
            .select(&standalone_context(&["bridge", "macvlan"]))
            .unwrap();
        assert_eq!(names_of(&selection), vec!["bridge", "macvlan"]);
        assert_eq!(selection.backends[1].ifname, "eth1");
        assert!(selection.persist.is_none());
    }

    #[test]
    fn test_gather_reads_cluster_annotations() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_pod_annotations().times(1).returning(|_, _| {
            Ok([("cni".to_string(), "calico".to_string())].into_iter().collect())
        });

        let ctx = SelectionContext::gather(
            &workload("K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx"),
            &config(),
            Some(&cluster),
        )
        .unwrap();
        assert_eq!(ctx.annotation("cni"), Some("calico"));
        assert_eq!(ctx.default_backends, vec!["weave"]);
    }

    #[test]
    fn test_gather_falls_back_to_inline_annotations() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_pod_annotations()
            .returning(|_, _| Err(GenieError::Cluster("forbidden".to_string())));

        let ctx = SelectionContext::gather(
            &workload(r#"K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx;K8S_ANNOT={"cni":"bridge"}"#),
            &config(),
            Some(&cluster),
        )
        .unwrap();
        assert_eq!(ctx.annotation("cni"), Some("bridge"));
    }

    #[test]
    fn test_gather_without_any_annotations_fails() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_pod_annotations()
            .returning(|_, _| Err(GenieError::Cluster("forbidden".to_string())));

        let err = SelectionContext::gather(
            &workload("K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx"),
            &config(),
            Some(&cluster),
        )
        .unwrap_err();
        assert!(matches!(err, GenieError::SelectionFailure(_)));
    }

    #[test]
    fn test_gather_standalone() {
        let ctx = SelectionContext::gather(&workload(""), &config(), None).unwrap();
        assert!(ctx.pod.is_none());
        assert!(ctx.annotations.is_none());
    }
}
