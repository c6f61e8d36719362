//! VlanNetwork Custom Resource Definition
//!
//! A VlanNetwork declares one external VLAN: its 802.1Q id, the IP pools
//! workers draw from, optional gateways with routes, and per-node interface
//! mappings. The resource is cluster-scoped; its status subresource carries
//! the server-authoritative IPAM state.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Affinity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_valid_ipv4_cidr, Gateway, IpMapping, VlanNetworkPool};
use crate::Error;

/// Specification for a VlanNetwork
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "vlanman.dialo.ai",
    version = "v1",
    kind = "VlanNetwork",
    plural = "vlannetworks",
    shortname = "vlan",
    status = "VlanNetworkStatus",
    namespaced = false,
    printcolumn = r#"{"name":"VLAN","type":"integer","jsonPath":".spec.vlanId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VlanNetworkSpec {
    /// The 802.1Q VLAN identifier
    #[schemars(range(min = 1, max = 4094))]
    pub vlan_id: u16,

    /// IP address pools available for allocation in this network
    pub pools: Vec<VlanNetworkPool>,

    /// Gateways whose address is owned by the elected leader manager
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<Gateway>,

    /// Node affinity constraining where the manager pods may run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_affinity: Option<Affinity>,

    /// Node-to-interface mappings overriding parent auto-detection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<IpMapping>,
}

impl VlanNetworkSpec {
    /// Validate field constraints that the CRD schema cannot fully express
    pub fn validate(&self) -> Result<(), Error> {
        if self.vlan_id < 1 || self.vlan_id > 4094 {
            return Err(Error::validation(format!(
                "vlanId {} is outside the valid range [1, 4094]",
                self.vlan_id
            )));
        }
        if self.pools.is_empty() {
            return Err(Error::validation("a VlanNetwork needs at least one pool"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(Error::validation("pool names must not be empty"));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(Error::validation(format!(
                    "pool name '{}' is declared more than once",
                    pool.name
                )));
            }
            if pool.addresses.is_empty() {
                return Err(Error::validation(format!(
                    "pool '{}' declares no addresses",
                    pool.name
                )));
            }
            for addr in &pool.addresses {
                if !is_valid_ipv4_cidr(addr) {
                    return Err(Error::validation(format!(
                        "address '{}' in pool '{}' is not a valid IPv4 CIDR",
                        addr, pool.name
                    )));
                }
            }
        }
        for gw in &self.gateways {
            if !is_valid_ipv4_cidr(&gw.address) {
                return Err(Error::validation(format!(
                    "gateway address '{}' is not a valid IPv4 CIDR",
                    gw.address
                )));
            }
        }
        Ok(())
    }

    /// The declared pool with the given name
    pub fn pool(&self, name: &str) -> Option<&VlanNetworkPool> {
        self.pools.iter().find(|p| p.name == name)
    }
}

/// Server-authoritative IPAM state of a VlanNetwork
///
/// `free_ips` holds unassigned pool addresses in declared order;
/// `pending_ips` maps a bare address to the RFC 3339 timestamp of the moment
/// admission handed it out. An address is pending between admission and the
/// point where a running pod is observed to carry it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VlanNetworkStatus {
    /// Unassigned addresses per pool, in declared order
    #[serde(rename = "freeIPs", default)]
    pub free_ips: BTreeMap<String, Vec<String>>,

    /// Tentatively handed-out addresses per pool: bare IP to timestamp
    #[serde(rename = "pendingIPs", default)]
    pub pending_ips: BTreeMap<String, BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::Route;

    fn sample_spec() -> VlanNetworkSpec {
        VlanNetworkSpec {
            vlan_id: 100,
            pools: vec![VlanNetworkPool {
                name: "p".into(),
                description: String::new(),
                addresses: vec!["10.0.0.2/24".into(), "10.0.0.3/24".into()],
                routes: vec![],
            }],
            gateways: vec![],
            manager_affinity: None,
            mappings: vec![],
        }
    }

    #[test]
    fn valid_spec_passes_validation() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn duplicate_pool_names_are_rejected() {
        let mut spec = sample_spec();
        spec.pools.push(spec.pools[0].clone());
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("declared more than once"));
    }

    #[test]
    fn empty_pool_list_is_rejected() {
        let mut spec = sample_spec();
        spec.pools.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        let mut spec = sample_spec();
        spec.pools[0].addresses.push("299.1.2.3".into());
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("not a valid IPv4 CIDR"));
    }

    #[test]
    fn gateway_addresses_are_validated() {
        let mut spec = sample_spec();
        spec.gateways.push(Gateway {
            address: "not-an-ip".into(),
            routes: vec![Route {
                destination: "10.1.0.0/16".into(),
                via: None,
                source: Default::default(),
                scope_link: true,
            }],
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn status_serializes_with_the_wire_key_names() {
        let mut status = VlanNetworkStatus::default();
        status
            .free_ips
            .insert("p".into(), vec!["10.0.0.3/24".into()]);
        status.pending_ips.insert(
            "p".into(),
            BTreeMap::from([("10.0.0.2".to_string(), "2026-01-01T00:00:00Z".to_string())]),
        );

        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("freeIPs").is_some());
        assert!(json.get("pendingIPs").is_some());

        let back: VlanNetworkStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn spec_round_trips_through_the_camel_case_wire_form() {
        let spec = sample_spec();
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json.get("vlanId").is_some());
        assert!(json.get("pools").is_some());
        let back: VlanNetworkSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
