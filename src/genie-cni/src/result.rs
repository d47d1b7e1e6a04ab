//! Attachment results
//!
//! The normalized outcome of one backend invocation, and of the merged
//! attachment genie prints for the runtime. Backends that still answer in the
//! 0.1.x/0.2.x shape (`ip4`/`ip6` objects) are upgraded on parse.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::GenieError;

/// Outcome of an ADD, from one backend or merged across several
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#success
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    #[serde(default)]
    pub cni_version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,

    #[serde(default, skip_serializing_if = "DnsResult::is_empty")]
    pub dns: DnsResult,
}

impl CniResult {
    pub fn new(cni_version: String) -> Self {
        Self {
            cni_version,
            ..Self::default()
        }
    }

    /// Parse a backend's stdout, upgrading legacy result versions
    pub fn from_slice(data: &[u8]) -> Result<Self, GenieError> {
        let value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| GenieError::decode("failed to decode backend result", e))?;

        if value.get("ip4").is_some() || value.get("ip6").is_some() {
            let legacy: LegacyResult = serde_json::from_value(value)
                .map_err(|e| GenieError::decode("failed to decode legacy backend result", e))?;
            return Ok(legacy.upgrade());
        }

        serde_json::from_value(value)
            .map_err(|e| GenieError::decode("failed to decode backend result", e))
    }

    /// Append an interface
    pub fn with_interface(mut self, name: String, mac: String, sandbox: Option<String>) -> Self {
        self.interfaces.push(Interface {
            name,
            mac: Some(mac),
            sandbox,
        });
        self
    }

    /// Append an address; `interface` of `None` means the address is not owned by any reported
    /// interface
    pub fn with_ip(mut self, address: String, gateway: Option<String>, interface: Option<usize>) -> Self {
        self.ips.push(IpConfig {
            address,
            gateway,
            interface,
            version: None,
        });
        self
    }

    pub fn with_route(mut self, dst: String, gw: Option<String>) -> Self {
        self.routes.push(RouteConfig { dst, gw });
        self
    }

    pub fn with_dns(mut self, dns: DnsResult) -> Self {
        self.dns = dns;
        self
    }
}

/// Interface reported by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    /// Netns path, set for interfaces inside the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// Address assigned by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    /// CIDR notation
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Index into `interfaces`, `None` when no interface owns the address
    #[serde(
        default,
        deserialize_with = "deserialize_interface_index",
        skip_serializing_if = "Option::is_none"
    )]
    pub interface: Option<usize>,

    /// IP version, only present in 0.3.x results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Negative indices are how some backends spell "no interface"
fn deserialize_interface_index<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let index: Option<i64> = Option::deserialize(deserializer)?;
    Ok(index.and_then(|i| usize::try_from(i).ok()))
}

/// Route reported by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub dst: String,

    /// Filled from the result's own gateways when a backend leaves it out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// DNS settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl DnsResult {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

/// 0.1.x/0.2.x result shape
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyResult {
    #[serde(default)]
    cni_version: Option<String>,
    #[serde(default)]
    ip4: Option<LegacyIp>,
    #[serde(default)]
    ip6: Option<LegacyIp>,
    #[serde(default)]
    dns: DnsResult,
}

#[derive(Debug, Deserialize)]
struct LegacyIp {
    ip: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    routes: Vec<RouteConfig>,
}

impl LegacyResult {
    fn upgrade(self) -> CniResult {
        let mut result = CniResult::new(self.cni_version.unwrap_or_else(|| "0.2.0".to_string()));
        for (version, ip) in [("4", self.ip4), ("6", self.ip6)] {
            if let Some(ip) = ip {
                result.ips.push(IpConfig {
                    address: ip.ip,
                    gateway: ip.gateway,
                    interface: None,
                    version: Some(version.to_string()),
                });
                result.routes.extend(ip.routes);
            }
        }
        result.dns = self.dns;
        result
    }
}

/// Answer to VERSION
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    pub cni_version: String,

    pub supported_versions: Vec<String>,
}
