//! Shared types embedded in the VlanNetwork CRD

use ipnet::Ipv4Net;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// How the source IP of a route is selected
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RouteSource {
    /// Pin the source to the address assigned from the pool
    #[serde(rename = "self")]
    SelfAddress,
    /// No source pinning, kernel default behavior
    #[default]
    #[serde(rename = "none")]
    None,
}

/// A route installed on the macvlan interface of workers and gateway owners
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Route {
    /// Target subnet in CIDR form; a bare address means a /32 host route
    #[serde(rename = "dest")]
    pub destination: String,

    /// Next-hop address; a route without one is directly connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,

    /// Source IP selection for this route
    #[serde(rename = "src", default)]
    pub source: RouteSource,

    /// Install with link scope; required for direct-attached gateway routes
    #[serde(rename = "scopeLink", default)]
    pub scope_link: bool,
}

/// A named group of IPv4 addresses inside a VLAN network
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VlanNetworkPool {
    /// Unique identifier of this pool within the network
    pub name: String,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Addresses in CIDR form; the mask defaults to /32 when absent
    pub addresses: Vec<String>,

    /// Routes installed for workers drawing from this pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// A gateway owned by exactly one manager per network at a time
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Gateway {
    /// Gateway address in CIDR form; the mask defaults to /32 when absent
    pub address: String,

    /// Routes installed on the gateway interface by the leading manager
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// Overrides auto-detection of the physical parent interface on one node
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpMapping {
    /// Name of the Kubernetes node
    pub node_name: String,

    /// Network interface name on that node
    #[serde(rename = "interfaceName")]
    pub interface: String,
}

/// Split an address in optional-CIDR form into (address, mask), the mask
/// defaulting to "32" when absent. Does not validate the address.
pub fn split_cidr(s: &str) -> (&str, &str) {
    match s.split_once('/') {
        Some((addr, mask)) => (addr, mask),
        None => (s, "32"),
    }
}

/// The address with any mask stripped
pub fn bare_ip(s: &str) -> &str {
    split_cidr(s).0
}

/// Parse an optional-CIDR string, applying the /32 default
pub fn parse_cidr(s: &str) -> crate::Result<Ipv4Net> {
    let (addr, mask) = split_cidr(s);
    format!("{addr}/{mask}")
        .parse()
        .map_err(|e| Error::parsing(format!("CIDR '{s}'"), e))
}

/// True when the string is an IPv4 address optionally followed by /mask
pub fn is_valid_ipv4_cidr(s: &str) -> bool {
    parse_cidr(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_cidr_defaults_the_mask_to_32() {
        assert_eq!(split_cidr("10.0.0.1"), ("10.0.0.1", "32"));
        assert_eq!(split_cidr("10.0.0.0/24"), ("10.0.0.0", "24"));
        assert_eq!(bare_ip("10.0.0.2/24"), "10.0.0.2");
    }

    #[test]
    fn cidr_validation_rejects_junk() {
        assert!(is_valid_ipv4_cidr("192.168.1.1"));
        assert!(is_valid_ipv4_cidr("10.0.0.0/16"));
        assert!(!is_valid_ipv4_cidr("10.0.0.0/33"));
        assert!(!is_valid_ipv4_cidr("300.0.0.1"));
        assert!(!is_valid_ipv4_cidr("fe80::1"));
        assert!(!is_valid_ipv4_cidr("not-an-ip"));
    }

    #[test]
    fn route_serde_uses_the_wire_field_names() {
        let route = Route {
            destination: "10.1.0.0/16".into(),
            via: Some("10.0.0.1".into()),
            source: RouteSource::SelfAddress,
            scope_link: true,
        };
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["dest"], "10.1.0.0/16");
        assert_eq!(json["via"], "10.0.0.1");
        assert_eq!(json["src"], "self");
        assert_eq!(json["scopeLink"], true);

        let back: Route = serde_json::from_value(json).unwrap();
        assert_eq!(back, route);
    }

    #[test]
    fn route_source_defaults_to_none() {
        let route: Route = serde_json::from_value(serde_json::json!({
            "dest": "10.1.0.0/16"
        }))
        .unwrap();
        assert_eq!(route.source, RouteSource::None);
        assert!(!route.scope_link);
        assert!(route.via.is_none());
    }
}
