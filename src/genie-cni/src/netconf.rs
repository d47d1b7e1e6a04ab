//! Backend configuration files
//!
//! Typed view of the `.conf` and `.conflist` files backends are configured
//! with. Only the keys genie reads or writes are typed; everything else is
//! carried through untouched.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::GenieError;
use crate::result::CniResult;

/// CNI version written into synthesized configs
pub const DEFAULT_CONF_VERSION: &str = "0.3.1";

/// Backends genie can write a default config for
pub const BRIDGE: &str = "bridge";
pub const MACVLAN: &str = "macvlan";
pub const SRIOV: &str = "sriov";

/// One plugin configuration fragment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Plugin type (matches binary name)
    #[serde(rename = "type", default)]
    pub plugin_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConf>,

    /// Backend-specific keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// IPAM sub-object of a plugin fragment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub plugin_type: String,

    /// Subnet in CIDR notation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ordered chain of plugin fragments for one logical network
///
/// A single `.conf` file is loaded as a chain of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfList {
    #[serde(default)]
    pub cni_version: String,

    #[serde(default)]
    pub name: String,

    pub plugins: Vec<PluginConf>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfList {
    /// Wrap a single fragment into a chain
    pub fn from_conf(conf: PluginConf) -> Self {
        Self {
            cni_version: conf
                .cni_version
                .clone()
                .unwrap_or_else(|| DEFAULT_CONF_VERSION.to_string()),
            name: conf.name.clone().unwrap_or_default(),
            plugins: vec![conf],
            extra: Map::new(),
        }
    }

    /// Load a `.conf` or `.conflist` file
    pub fn from_file(path: &Path) -> Result<Self, GenieError> {
        let data = fs::read(path)
            .map_err(|e| GenieError::io(format!("failed to read {}", path.display()), e))?;
        Self::from_bytes(path, &data)
    }

    /// Parse file contents, choosing the shape from the file extension
    pub fn from_bytes(path: &Path, data: &[u8]) -> Result<Self, GenieError> {
        let malformed = |reason: String| GenieError::MalformedConfig {
            path: path.display().to_string(),
            reason,
        };

        let list = if path.extension().is_some_and(|ext| ext == "conflist") {
            serde_json::from_slice::<ConfList>(data).map_err(|e| malformed(e.to_string()))?
        } else {
            let conf: PluginConf =
                serde_json::from_slice(data).map_err(|e| malformed(e.to_string()))?;
            // Also catches a chain saved under a .conf name
            if conf.plugin_type.is_empty() {
                return Err(malformed("no 'type'; perhaps this is a .conflist?".to_string()));
            }
            Self::from_conf(conf)
        };

        if list.plugins.is_empty() {
            return Err(malformed("chain has no plugins".to_string()));
        }
        Ok(list)
    }

    /// Plugin type of the first fragment
    pub fn backend_type(&self) -> &str {
        self.plugins
            .first()
            .map(|p| p.plugin_type.as_str())
            .unwrap_or_default()
    }

    /// Point the first fragment's IPAM at `subnet`
    ///
    /// The IPAM object is created when the fragment has none.
    pub fn set_subnet(&mut self, subnet: &str) -> Result<(), GenieError> {
        IpNetwork::from_str(subnet).map_err(|e| {
            GenieError::InvalidConfig(format!("invalid subnet {}: {}", subnet, e))
        })?;

        let first = self.plugins.first_mut().ok_or_else(|| {
            GenieError::InvalidConfig(format!("network {} has no plugins", self.name))
        })?;

        first.ipam.get_or_insert_with(IpamConf::default).subnet = Some(subnet.to_string());
        Ok(())
    }

    /// Serialize fragment `index` the way it is handed to its binary
    ///
    /// The chain's name and version are injected, and `prevResult` carries
    /// the output of the previous plugin in the chain.
    pub fn plugin_stdin(
        &self,
        index: usize,
        prev_result: Option<&CniResult>,
    ) -> Result<Vec<u8>, GenieError> {
        let mut conf = self.plugins.get(index).cloned().ok_or_else(|| {
            GenieError::InvalidConfig(format!("network {} has no plugin {}", self.name, index))
        })?;

        conf.name = Some(self.name.clone());
        conf.cni_version = Some(self.cni_version.clone());
        if let Some(prev) = prev_result {
            let prev = serde_json::to_value(prev)
                .map_err(|e| GenieError::decode("failed to encode prevResult", e))?;
            conf.extra.insert("prevResult".to_string(), prev);
        }

        serde_json::to_vec(&conf)
            .map_err(|e| GenieError::decode("failed to encode plugin config", e))
    }
}

fn object(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn host_local(subnet: &str, extra: &[(&str, Value)]) -> IpamConf {
    IpamConf {
        plugin_type: "host-local".to_string(),
        subnet: Some(subnet.to_string()),
        extra: object(extra),
    }
}

/// Default configuration for backends genie can synthesize one for
pub fn default_conf(backend: &str) -> Option<PluginConf> {
    let default_route = ("routes", json!([{"dst": "0.0.0.0/0"}]));

    let (name, extra, ipam) = match backend {
        BRIDGE => (
            "mybridge",
            object(&[
                ("bridge", json!("cni_bridge0")),
                ("isGateway", json!(true)),
                ("ipMasq", json!(true)),
            ]),
            host_local("10.10.0.0/16", &[default_route]),
        ),
        MACVLAN => (
            "mymacvlan",
            object(&[("master", json!("eth0")), ("mode", json!("bridge"))]),
            host_local("10.20.0.0/16", &[default_route]),
        ),
        SRIOV => (
            "mysriov",
            object(&[("master", json!("eth1"))]),
            host_local(
                "10.55.206.0/26",
                &[default_route, ("gateway", json!("10.55.206.1"))],
            ),
        ),
        _ => return None,
    };

    Some(PluginConf {
        cni_version: Some(DEFAULT_CONF_VERSION.to_string()),
        name: Some(name.to_string()),
        plugin_type: backend.to_string(),
        ipam: Some(ipam),
        extra,
    })
}
