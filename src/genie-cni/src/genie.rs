//! Attachment orchestration
//!
//! Drives one ADD or DEL: select backends, resolve each backend's config,
//! invoke it, and fold the results into one.

use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::error::GenieError;
use crate::invoke::{PluginExecutor, RuntimeConf};
use crate::merge::merge_result;
use crate::multi_ip::MultiIpPreferences;
use crate::ranking::RankingService;
use crate::resolver::ConfigResolver;
use crate::result::CniResult;
use crate::selector::{BackendSelector, Selection, SelectionContext};
use crate::workload::{PodRef, WorkloadIdentity};

/// Everything an ADD produced
///
/// Backend failures do not stop the remaining backends from being attached,
/// so an ADD can end with both a merged result and errors.
#[derive(Debug, Default)]
pub struct AddOutcome {
    /// Merged result of the backends that succeeded
    pub merged: Option<CniResult>,
    /// Errors in the order they happened
    pub errors: Vec<GenieError>,
}

impl AddOutcome {
    /// Final result of the ADD
    ///
    /// Any recorded error fails the whole ADD with the most recent one, and
    /// the partial result is dropped.
    pub fn into_result(mut self) -> Result<CniResult, GenieError> {
        if let Some(err) = self.errors.pop() {
            if let Some(merged) = &self.merged {
                warn!(
                    interfaces = merged.interfaces.len(),
                    failures = self.errors.len() + 1,
                    "discarding partial result"
                );
            }
            return Err(err);
        }

        self.merged
            .ok_or_else(|| GenieError::SelectionFailure("no backends selected".to_string()))
    }
}

/// The attachment orchestrator
pub struct Genie<'a> {
    resolver: ConfigResolver,
    executor: &'a dyn PluginExecutor,
    cluster: Option<&'a dyn ClusterClient>,
    ranking: Option<&'a dyn RankingService>,
}

impl<'a> Genie<'a> {
    pub fn new(
        resolver: ConfigResolver,
        executor: &'a dyn PluginExecutor,
        cluster: Option<&'a dyn ClusterClient>,
        ranking: Option<&'a dyn RankingService>,
    ) -> Self {
        Self {
            resolver,
            executor,
            cluster,
            ranking,
        }
    }

    fn select(&self, ctx: &SelectionContext) -> Result<Selection, GenieError> {
        BackendSelector::new(self.cluster, self.ranking).select(ctx)
    }

    /// Attach `workload` through every selected backend
    ///
    /// Selection, config resolution and result repair failures abort at once.
    /// Backend invocation failures are recorded in the outcome.
    pub fn add(
        &self,
        workload: &WorkloadIdentity,
        ctx: &SelectionContext,
    ) -> Result<AddOutcome, GenieError> {
        info!(
            workload = %workload.workload_id(),
            orchestrator = workload.orchestrator(),
            "ADD"
        );

        let selection = self.select(ctx)?;
        if let (Some(patch), Some(pod)) = (&selection.persist, &workload.pod) {
            self.persist_selection(pod, patch);
        }

        let mut outcome = AddOutcome::default();

        for choice in &selection.backends {
            let config = self
                .resolver
                .resolve(&choice.backend, choice.subnet.as_deref())?;
            debug!(
                backend = %choice.backend,
                source = %config.source.display(),
                ifname = %choice.ifname,
                "resolved backend config"
            );

            let rt = RuntimeConf::new(workload, &choice.ifname);
            let result = match self.executor.add(&config, &rt) {
                Ok(result) => result,
                Err(e) => {
                    warn!(backend = %choice.backend, error = %e, "backend ADD failed");
                    outcome.errors.push(e);
                    continue;
                }
            };

            outcome.merged = Some(merge_result(&choice.backend, outcome.merged.take(), result)?);
        }

        if let (Some(pod), Some(merged)) = (&workload.pod, &outcome.merged) {
            if MultiIpPreferences::wanted_for(merged) {
                let record = MultiIpPreferences::from_result(merged);
                if let Err(e) = self.write_multi_ip(pod, &record) {
                    warn!(error = %e, "failed to record multi-ip preferences");
                    outcome.errors.push(e);
                }
            }
        }

        Ok(outcome)
    }

    /// Detach `workload` from every selected backend
    ///
    /// All backends are attempted; the most recent failure is returned.
    pub fn del(&self, workload: &WorkloadIdentity, ctx: &SelectionContext) -> Result<(), GenieError> {
        info!(
            workload = %workload.workload_id(),
            orchestrator = workload.orchestrator(),
            "DEL"
        );

        let selection = self.select(ctx)?;
        let mut last_error = None;

        for choice in &selection.backends {
            let config = match self
                .resolver
                .resolve_existing(&choice.backend, choice.subnet.as_deref())
            {
                Ok(Some(config)) => config,
                Ok(None) => {
                    info!(backend = %choice.backend, "no config for backend, nothing to delete");
                    continue;
                }
                Err(e) => {
                    warn!(backend = %choice.backend, error = %e, "failed to resolve backend config");
                    last_error = Some(e);
                    continue;
                }
            };

            let rt = RuntimeConf::new(workload, &choice.ifname);
            if let Err(e) = self.executor.del(&config, &rt) {
                warn!(backend = %choice.backend, error = %e, "backend DEL failed");
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn persist_selection(&self, pod: &PodRef, patch: &serde_json::Value) {
        let Some(cluster) = self.cluster else {
            debug!("no cluster access, selection not persisted");
            return;
        };

        if let Err(e) = cluster.patch_pod(&pod.namespace, &pod.name, patch) {
            warn!(
                namespace = %pod.namespace,
                pod = %pod.name,
                error = %e,
                "failed to persist backend selection"
            );
        }
    }

    fn write_multi_ip(&self, pod: &PodRef, record: &MultiIpPreferences) -> Result<(), GenieError> {
        let Some(cluster) = self.cluster else {
            warn!("no cluster access, multi-ip preferences not recorded");
            return Ok(());
        };

        let patch = record.to_patch()?;
        cluster
            .patch_pod(&pod.namespace, &pod.name, &patch)
            .map_err(|e| match e {
                GenieError::MetadataPatchFailure { .. } => e,
                other => GenieError::MetadataPatchFailure {
                    namespace: pod.namespace.clone(),
                    name: pod.name.clone(),
                    reason: other.to_string(),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::invoke::MockPluginExecutor;
    use crate::multi_ip::MULTI_IP_ANNOTATION;
    use crate::ranking::MockRankingService;
    use crate::registry::BackendRegistry;
    use crate::workload::K8sArgs;
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Host {
        conf: TempDir,
        bin: TempDir,
    }

    impl Host {
        fn with_binaries(names: &[&str]) -> Self {
            let host = Self {
                conf: TempDir::new().unwrap(),
                bin: TempDir::new().unwrap(),
            };
            for name in names {
                fs::write(host.bin.path().join(name), "").unwrap();
            }
            host
        }

        fn resolver(&self) -> ConfigResolver {
            ConfigResolver::new(BackendRegistry::new(
                self.conf.path().to_path_buf(),
                vec![self.bin.path().to_path_buf()],
                BTreeMap::new(),
            ))
        }
    }

    fn pod_workload() -> WorkloadIdentity {
        WorkloadIdentity::new(
            "ctr1".to_string(),
            "/var/run/netns/ctr1".to_string(),
            "eth0".to_string(),
            K8sArgs::parse("IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx").unwrap(),
        )
    }

    fn pod_context(annotations: &[(&str, &str)]) -> SelectionContext {
        SelectionContext {
            pod: pod_workload().pod,
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            default_backends: vec!["weave".to_string()],
        }
    }

    fn attachment(ifname: &str, address: &str, gateway: &str) -> CniResult {
        CniResult::new("0.3.1".to_string())
            .with_interface(ifname.to_string(), "0a:58:00:00:00:01".to_string(), Some("/var/run/netns/ctr1".to_string()))
            .with_ip(address.to_string(), Some(gateway.to_string()), Some(0))
    }

    /// Executor answering ADD with one interface per backend
    fn attaching_executor() -> MockPluginExecutor {
        let mut executor = MockPluginExecutor::new();
        executor.expect_add().returning(|config, rt| {
            Ok(match config.backend.as_str() {
                "bridge" => attachment(&rt.ifname, "10.10.0.5/16", "10.10.0.1"),
                _ => attachment(&rt.ifname, "10.20.0.7/16", "10.20.0.1"),
            })
        });
        executor
    }

    #[test]
    fn test_add_bridge_and_macvlan() {
        let host = Host::with_binaries(&["bridge", "macvlan"]);
        let executor = attaching_executor();

        let patches = Arc::new(Mutex::new(Vec::new()));
        let seen = patches.clone();
        let mut cluster = MockClusterClient::new();
        cluster.expect_patch_pod().times(1).returning(move |_, _, patch| {
            seen.lock().unwrap().push(patch.clone());
            Ok(())
        });

        let genie = Genie::new(host.resolver(), &executor, Some(&cluster), None);
        let result = genie
            .add(&pod_workload(), &pod_context(&[("cni", "bridge,macvlan")]))
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(result.interfaces.len(), 2);
        assert_eq!(result.interfaces[0].name, "eth0");
        assert_eq!(result.interfaces[1].name, "eth1");
        assert_eq!(result.ips[0].interface, Some(0));
        assert_eq!(result.ips[1].interface, Some(1));

        // Both configs were synthesized
        assert!(host.conf.path().join("10-bridge.conf").exists());
        assert!(host.conf.path().join("10-macvlan.conf").exists());

        let patches = patches.lock().unwrap();
        let value = patches[0]["metadata"]["annotations"][MULTI_IP_ANNOTATION]
            .as_str()
            .unwrap();
        let record: MultiIpPreferences = serde_json::from_str(value).unwrap();
        assert_eq!(record.multi_entry, 2);
        assert_eq!(record.ips["ip1"].ip, "10.10.0.5");
        assert_eq!(record.ips["ip2"].interface, "eth1");
    }

    #[test]
    fn test_add_ranked_backend_survives_persist_failure() {
        let host = Host::with_binaries(&[]);
        fs::write(
            host.conf.path().join("10-weave.conflist"),
            r#"{"cniVersion": "0.3.0", "name": "weave", "plugins": [{"type": "weave-net"}]}"#,
        )
        .unwrap();

        let mut executor = MockPluginExecutor::new();
        executor
            .expect_add()
            .times(1)
            .returning(|_, rt| Ok(attachment(&rt.ifname, "10.32.0.4/12", "10.32.0.1")));

        let mut ranking = MockRankingService::new();
        ranking
            .expect_best_backend()
            .times(1)
            .returning(|| Ok("weave".to_string()));

        // Only the selection is persisted; a single interface is not recorded
        let mut cluster = MockClusterClient::new();
        cluster.expect_patch_pod().times(1).returning(|ns, name, _| {
            Err(GenieError::MetadataPatchFailure {
                namespace: ns.to_string(),
                name: name.to_string(),
                reason: "conflict".to_string(),
            })
        });

        let genie = Genie::new(host.resolver(), &executor, Some(&cluster), Some(&ranking));
        let result = genie
            .add(&pod_workload(), &pod_context(&[]))
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(result.interfaces.len(), 1);
        assert_eq!(result.ips[0].address, "10.32.0.4/12");
    }

    #[test]
    fn test_add_failure_discards_partial_result() {
        let host = Host::with_binaries(&["bridge", "macvlan"]);

        let mut executor = MockPluginExecutor::new();
        executor.expect_add().times(2).returning(|config, rt| {
            if config.backend == "macvlan" {
                Err(GenieError::invocation("macvlan", "ADD", "master eth0 not found"))
            } else {
                Ok(attachment(&rt.ifname, "10.10.0.5/16", "10.10.0.1"))
            }
        });

        let mut cluster = MockClusterClient::new();
        cluster.expect_patch_pod().never();

        let genie = Genie::new(host.resolver(), &executor, Some(&cluster), None);
        let outcome = genie
            .add(&pod_workload(), &pod_context(&[("cni", "macvlan,bridge")]))
            .unwrap();

        // bridge still ran after macvlan failed
        let merged = outcome.merged.as_ref().unwrap();
        assert_eq!(merged.interfaces.len(), 1);
        assert_eq!(merged.interfaces[0].name, "eth1");
        assert_eq!(outcome.errors.len(), 1);

        let err = outcome.into_result().unwrap_err();
        assert!(matches!(
            err,
            GenieError::InvocationFailure { ref backend, .. } if backend == "macvlan"
        ));
    }

    #[test]
    fn test_add_unsupported_backend_aborts() {
        let host = Host::with_binaries(&["bridge"]);

        let mut executor = MockPluginExecutor::new();
        executor.expect_add().never();

        let genie = Genie::new(host.resolver(), &executor, None, None);
        let err = genie
            .add(&pod_workload(), &pod_context(&[("cni", "romana,bridge")]))
            .unwrap_err();
        assert!(matches!(err, GenieError::UnsupportedBackend { .. }));
    }

    #[test]
    fn test_add_inconsistent_result_aborts() {
        let host = Host::with_binaries(&["bridge", "macvlan"]);

        let mut executor = MockPluginExecutor::new();
        executor.expect_add().times(1).returning(|_, _| {
            Ok(CniResult::new("0.3.1".to_string())
                .with_ip("10.10.0.5/16".to_string(), None, None)
                .with_route("0.0.0.0/0".to_string(), None))
        });

        let genie = Genie::new(host.resolver(), &executor, None, None);
        let err = genie
            .add(&pod_workload(), &pod_context(&[("cni", "bridge,macvlan")]))
            .unwrap_err();
        assert!(matches!(err, GenieError::InconsistentResult { .. }));
    }

    #[test]
    fn test_add_multi_ip_patch_failure_fails_add() {
        let host = Host::with_binaries(&["bridge", "macvlan"]);
        let executor = attaching_executor();

        let mut cluster = MockClusterClient::new();
        cluster
            .expect_patch_pod()
            .times(1)
            .returning(|_, _, _| Err(GenieError::Cluster("connection reset".to_string())));

        let genie = Genie::new(host.resolver(), &executor, Some(&cluster), None);
        let err = genie
            .add(&pod_workload(), &pod_context(&[("cni", "bridge,macvlan")]))
            .unwrap()
            .into_result()
            .unwrap_err();
        assert!(matches!(err, GenieError::MetadataPatchFailure { .. }));
    }

    #[test]
    fn test_add_two_backends_one_interface_not_recorded() {
        let host = Host::with_binaries(&["bridge", "calico"]);

        // calico reports its address without an interface
        let mut executor = MockPluginExecutor::new();
        executor.expect_add().times(2).returning(|config, rt| {
            Ok(match config.backend.as_str() {
                "bridge" => attachment(&rt.ifname, "10.10.0.5/16", "10.10.0.1"),
                _ => CniResult::new("0.3.1".to_string()).with_ip(
                    "192.168.1.7/32".to_string(),
                    None,
                    Some(0),
                ),
            })
        });

        let mut cluster = MockClusterClient::new();
        cluster.expect_patch_pod().never();

        fs::write(
            host.conf.path().join("10-calico.conf"),
            r#"{"cniVersion": "0.3.1", "name": "k8s-pod-network", "type": "calico"}"#,
        )
        .unwrap();

        let genie = Genie::new(host.resolver(), &executor, Some(&cluster), None);
        let result = genie
            .add(&pod_workload(), &pod_context(&[("cni", "bridge,calico")]))
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(result.interfaces.len(), 1);
        assert_eq!(result.ips.len(), 2);
        assert_eq!(result.ips[1].interface, None);
    }

    #[test]
    fn test_add_one_backend_two_interfaces_recorded() {
        let host = Host::with_binaries(&[]);
        fs::write(
            host.conf.path().join("10-weave.conflist"),
            r#"{"cniVersion": "0.3.0", "name": "weave", "plugins": [{"type": "weave-net"}]}"#,
        )
        .unwrap();

        let mut executor = MockPluginExecutor::new();
        executor.expect_add().times(1).returning(|_, _| {
            Ok(CniResult::new("0.3.1".to_string())
                .with_interface("weave".to_string(), "0a:58:00:00:00:09".to_string(), None)
                .with_interface("eth0".to_string(), "0a:58:00:00:00:01".to_string(), Some("/var/run/netns/ctr1".to_string()))
                .with_ip("10.32.0.4/12".to_string(), Some("10.32.0.1".to_string()), Some(1)))
        });

        let patches = Arc::new(Mutex::new(Vec::new()));
        let seen = patches.clone();
        let mut cluster = MockClusterClient::new();
        cluster.expect_patch_pod().times(1).returning(move |_, _, patch| {
            seen.lock().unwrap().push(patch.clone());
            Ok(())
        });

        let genie = Genie::new(host.resolver(), &executor, Some(&cluster), None);
        genie
            .add(&pod_workload(), &pod_context(&[("cni", "weave")]))
            .unwrap()
            .into_result()
            .unwrap();

        let patches = patches.lock().unwrap();
        let value = patches[0]["metadata"]["annotations"][MULTI_IP_ANNOTATION]
            .as_str()
            .unwrap();
        let record: MultiIpPreferences = serde_json::from_str(value).unwrap();
        assert_eq!(record.multi_entry, 1);
        assert_eq!(record.ips["ip1"].ip, "10.32.0.4");
        assert_eq!(record.ips["ip1"].interface, "eth0");
    }

    #[test]
    fn test_add_standalone_uses_defaults_without_record() {
        let host = Host::with_binaries(&["bridge", "macvlan"]);
        let executor = attaching_executor();
        let workload = WorkloadIdentity::new(
            "ctr1".to_string(),
            "/var/run/netns/ctr1".to_string(),
            "eth0".to_string(),
            K8sArgs::default(),
        );
        let ctx = SelectionContext {
            pod: None,
            annotations: None,
            default_backends: vec!["bridge".to_string(), "macvlan".to_string()],
        };

        let genie = Genie::new(host.resolver(), &executor, None, None);
        let result = genie.add(&workload, &ctx).unwrap().into_result().unwrap();
        assert_eq!(result.interfaces.len(), 2);
    }

    #[test]
    fn test_del_attempts_every_backend() {
        let host = Host::with_binaries(&[]);
        for name in ["bridge", "macvlan"] {
            fs::write(
                host.conf.path().join(format!("10-{}.conf", name)),
                format!(r#"{{"cniVersion": "0.3.1", "name": "{0}", "type": "{0}"}}"#, name),
            )
            .unwrap();
        }

        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let mut executor = MockPluginExecutor::new();
        executor.expect_del().times(2).returning(move |config, rt| {
            seen.lock().unwrap().push((config.backend.clone(), rt.ifname.clone()));
            if config.backend == "bridge" {
                Err(GenieError::invocation("bridge", "DEL", "busy"))
            } else {
                Ok(())
            }
        });

        let genie = Genie::new(host.resolver(), &executor, None, None);
        let err = genie
            .del(&pod_workload(), &pod_context(&[("cni", "bridge,macvlan")]))
            .unwrap_err();

        assert!(matches!(err, GenieError::InvocationFailure { ref backend, .. } if backend == "bridge"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                ("bridge".to_string(), "eth0".to_string()),
                ("macvlan".to_string(), "eth1".to_string())
            ]
        );
    }

    #[test]
    fn test_del_skips_backend_without_config() {
        let host = Host::with_binaries(&["bridge"]);

        let mut executor = MockPluginExecutor::new();
        executor.expect_del().never();

        let genie = Genie::new(host.resolver(), &executor, None, None);
        genie
            .del(&pod_workload(), &pod_context(&[("cni", "bridge")]))
            .unwrap();
        assert!(!host.conf.path().join("10-bridge.conf").exists());
    }

    #[test]
    fn test_empty_outcome_is_an_error() {
        assert!(AddOutcome::default().into_result().is_err());
    }
}
