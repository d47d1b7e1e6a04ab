//! Multi-IP bookkeeping
//!
//! When a pod gets more than one interface, the address of each is recorded
//! in the `multi-ip-preferences` annotation so it can be found without
//! entering the pod's network namespace.

use std::collections::BTreeMap;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::annotation_patch;
use crate::error::GenieError;
use crate::result::CniResult;

/// Annotation the record is stored under
pub const MULTI_IP_ANNOTATION: &str = "multi-ip-preferences";

/// Address attached on one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressPreference {
    pub ip: String,
    pub interface: String,
}

/// Value of the `multi-ip-preferences` annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiIpPreferences {
    pub multi_entry: usize,
    pub ips: BTreeMap<String, IpAddressPreference>,
}

impl MultiIpPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record of every interface in `merged` that owns an address
    ///
    /// Entries are keyed `ip1`, `ip2`, ... in interface order and hold the
    /// first address pointing at that interface. Interfaces without an
    /// address are left out.
    pub fn from_result(merged: &CniResult) -> Self {
        let mut record = Self::new();

        for (index, interface) in merged.interfaces.iter().enumerate() {
            let Some(ip) = merged.ips.iter().find(|ip| ip.interface == Some(index)) else {
                continue;
            };

            record.multi_entry += 1;
            record.ips.insert(
                format!("ip{}", record.multi_entry),
                IpAddressPreference {
                    ip: strip_prefix(&ip.address),
                    interface: interface.name.clone(),
                },
            );
        }

        record
    }

    /// Whether `merged` attached enough interfaces to be recorded
    pub fn wanted_for(merged: &CniResult) -> bool {
        merged.interfaces.len() > 1
    }

    /// Merge-patch storing this record on the pod
    ///
    /// The annotation value is the record JSON-encoded as a string.
    pub fn to_patch(&self) -> Result<Value, GenieError> {
        let encoded = serde_json::to_string(self)
            .map_err(|e| GenieError::decode("failed to encode multi-ip record", e))?;
        Ok(annotation_patch(MULTI_IP_ANNOTATION, &encoded))
    }
}

/// `10.0.0.2/24` -> `10.0.0.2`
fn strip_prefix(address: &str) -> String {
    match address.parse::<IpNetwork>() {
        Ok(network) => network.ip().to_string(),
        Err(_) => address.to_string(),
    }
}
