//! Backend ranking
//!
//! Picks a backend for workloads that asked for none, by looking at how much
//! traffic each backend's host interfaces have carried recently. The least
//! loaded backend wins.

use std::collections::BTreeMap;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::GenieError;

/// Request timeout for the ranking endpoint
pub const RANKING_TIMEOUT: Duration = Duration::from_secs(5);

/// cAdvisor path returning the root container's recent stats
const CONTAINERS_PATH: &str = "/api/v1.3/containers/";

/// Host interface name prefixes and the backend that owns them
const INTERFACE_PREFIXES: &[(&str, &str)] = &[
    ("weave", "weave"),
    ("flannel", "flannel"),
    ("cali", "calico"),
    ("cni", "bridge"),
    ("genie", "bridge"),
    ("romana", "romana"),
    ("macvlan", "macvlan"),
];

/// Source of a single "best" backend name
#[cfg_attr(test, automock)]
pub trait RankingService {
    fn best_backend(&self) -> Result<String, GenieError>;
}

/// Ranking backed by cAdvisor network statistics
#[derive(Debug, Clone)]
pub struct CadvisorRanking {
    client: Client,
    base_url: String,
}

impl CadvisorRanking {
    pub fn new(base_url: &str) -> Result<Self, GenieError> {
        let client = Client::builder()
            .timeout(RANKING_TIMEOUT)
            .build()
            .map_err(|e| GenieError::Ranking(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn container_info(&self) -> Result<ContainerInfo, GenieError> {
        let url = format!("{}{}", self.base_url, CONTAINERS_PATH);

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| GenieError::Ranking(format!("request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(GenieError::Ranking(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .json::<ContainerInfo>()
            .map_err(|e| GenieError::Ranking(format!("invalid response from {}: {}", url, e)))
    }
}

impl RankingService for CadvisorRanking {
    fn best_backend(&self) -> Result<String, GenieError> {
        let info = self.container_info()?;
        let usage = backend_usage(&info);
        debug!(?usage, "backend bandwidth usage");

        least_used(&usage).ok_or_else(|| {
            GenieError::Ranking("no backend interfaces found in network stats".to_string())
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ContainerInfo {
    #[serde(default)]
    stats: Vec<ContainerStats>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerStats {
    #[serde(default)]
    network: Option<NetworkStats>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkStats {
    #[serde(default)]
    interfaces: Vec<InterfaceStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InterfaceStats {
    name: String,
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

impl InterfaceStats {
    fn total(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }
}

/// Backend owning a host interface, by name prefix
fn interface_backend(ifname: &str) -> Option<&'static str> {
    INTERFACE_PREFIXES
        .iter()
        .find(|(prefix, _)| ifname.starts_with(prefix))
        .map(|(_, backend)| *backend)
}

/// Bytes moved per backend over the stats window
///
/// Usage of an interface is the difference between its counters in the
/// first and last sample it appears in.
fn backend_usage(info: &ContainerInfo) -> BTreeMap<&'static str, u64> {
    let mut first: BTreeMap<&str, u64> = BTreeMap::new();
    let mut last: BTreeMap<&str, u64> = BTreeMap::new();

    let samples = info.stats.iter().filter_map(|s| s.network.as_ref());
    for network in samples {
        for iface in &network.interfaces {
            first.entry(iface.name.as_str()).or_insert_with(|| iface.total());
            last.insert(iface.name.as_str(), iface.total());
        }
    }

    let mut usage = BTreeMap::new();
    for (name, end) in last {
        let Some(backend) = interface_backend(name) else {
            continue;
        };
        let start = first.get(name).copied().unwrap_or(end);
        *usage.entry(backend).or_insert(0u64) += end.saturating_sub(start);
    }
    usage
}

/// Backend with the least traffic; ties go to the first name in order
fn least_used(usage: &BTreeMap<&'static str, u64>) -> Option<String> {
    usage
        .iter()
        .min_by_key(|(_, bytes)| **bytes)
        .map(|(backend, _)| backend.to_string())
}
