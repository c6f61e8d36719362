//! Custom Resource Definitions for vlanman
//!
//! This module contains the VlanNetwork CRD and the types embedded in it.

mod network;
mod types;

pub use network::{VlanNetwork, VlanNetworkSpec, VlanNetworkStatus};
pub use types::{
    bare_ip, is_valid_ipv4_cidr, parse_cidr, split_cidr, Gateway, IpMapping, Route, RouteSource,
    VlanNetworkPool,
};
