//! vlanman - Kubernetes operator for external VLAN-tagged L2 networks
//!
//! vlanman attaches workload pods to VLAN networks that live outside the
//! cluster overlay. Administrators declare a [`crd::VlanNetwork`] (VLAN id,
//! IP pools, optional gateways, node mappings); any pod annotated with the
//! network and pool names transparently receives an additional macvlan
//! interface on that VLAN with a pool-assigned address and custom routes.
//!
//! # Architecture
//!
//! One binary, several roles selected by subcommand:
//! - `operator` runs the reconciler and the admission webhook server
//! - `manager` runs on every admissible node inside the per-network
//!   DaemonSet and owns interface creation plus gateway leader election
//! - `worker` is the init-container entry point injected into consumer pods
//! - `interface` is the one-shot job that creates `vlan<id>` on a node and
//!   moves it into the manager's network namespace
//!
//! # Modules
//!
//! - [`crd`] - VlanNetwork custom resource definition
//! - [`store`] - typed accessor over the Kubernetes API
//! - [`lock`] - cluster-wide lease-backed mutex guarding status writes
//! - [`ipam`] - pool address allocation and status reconciliation
//! - [`controller`] - reconciler, desired-state projection, diff, executor
//! - [`webhook`] - mutating and validating admission handlers
//! - [`agent`] - per-node manager HTTP endpoint and gateway leader election
//! - [`worker`] - worker init-container logic
//! - [`iface`] - VLAN interface creation job logic
//! - [`config`] - operator environment configuration
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod agent;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod iface;
pub mod ipam;
pub mod lock;
pub mod retry;
pub mod store;
pub mod webhook;
pub mod worker;

pub use error::Error;

use std::time::Duration;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Names and keys
// =============================================================================
// The annotation, label, and object names below form the external contract
// between the operator, the webhook, the manager daemons, and consumer pods.

/// Annotation on consumer pods naming the VlanNetwork to join
pub const NETWORK_ANNOTATION: &str = "vlanman.dialo.ai/network";

/// Annotation on consumer pods naming the pool within that network
pub const POOL_ANNOTATION: &str = "vlanman.dialo.ai/pool";

/// Label marking the manager DaemonSet and its pods (value = network name)
pub const MANAGER_LABEL: &str = "vlanman.dialo.ai/manager";

/// Label added to consumer pods by the mutating webhook (value = network name)
pub const WORKER_LABEL: &str = "vlanman.dialo.ai/worker";

/// Name of the init container injected into consumer pods
pub const INIT_CONTAINER_NAME: &str = "init-vlan";

/// Name of the manager container inside the manager DaemonSet
pub const MANAGER_CONTAINER_NAME: &str = "vlan-manager";

/// Lease backing the cluster-wide IPAM mutex
pub const IPAM_LEASE_NAME: &str = "vlanman-ipam-lease";

/// Node label carrying the hostname, used for affinity and job pinning
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Manager DaemonSet name for a network
pub fn manager_set_name(network: &str) -> String {
    format!("vlan-manager-{network}")
}

/// Per-network service name fronting the manager pods
pub fn service_name(network: &str) -> String {
    format!("{network}-service")
}

/// Interface-creation job name for a (network, node) pair
pub fn job_name(network: &str, node: &str) -> String {
    format!("create-vlan-job-{network}-{node}")
}

/// Per-network leader election lease name
pub fn leader_lease_name(network: &str) -> String {
    format!("vlanman-leader-election-{network}")
}

/// Name of the VLAN interface for a VLAN id
pub fn vlan_link_name(vlan_id: u16) -> String {
    format!("vlan{vlan_id}")
}

/// Name of the per-namespace macvlan interface for a VLAN id
pub fn macvlan_link_name(vlan_id: u16) -> String {
    format!("macvlan{vlan_id}")
}

/// Name of the gateway macvlan interface for a VLAN id
pub fn gateway_link_name(vlan_id: u16) -> String {
    format!("macvlangw{vlan_id}")
}

// =============================================================================
// Ports and timing
// =============================================================================

/// TCP port of the manager HTTP endpoint on every node
pub const MANAGER_PORT: u16 = 61410;

/// TCP port of the admission webhook server
pub const WEBHOOK_PORT: u16 = 8443;

/// Directory holding the webhook TLS certificate and key
pub const WEBHOOK_CERT_DIR: &str = "/etc/webhook/certs";

/// Polling attempts the executor grants a DaemonSet or pod to become ready
pub const WAIT_FOR_DAEMON_ATTEMPTS: u32 = 30;

/// Interval between executor readiness polls
pub const WAIT_FOR_DAEMON_INTERVAL: Duration = Duration::from_millis(500);

/// Age after which a pending IP not observed on any pod is reclaimed
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(35);

/// Retries granted to a conflicting status update before surfacing the error
pub const UPDATE_STATUS_MAX_RETRIES: u32 = 5;

/// TTL of the IPAM lease
pub const LOCK_LEASE_TTL: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_follow_the_external_contract() {
        assert_eq!(manager_set_name("office"), "vlan-manager-office");
        assert_eq!(service_name("office"), "office-service");
        assert_eq!(job_name("office", "node-a"), "create-vlan-job-office-node-a");
        assert_eq!(leader_lease_name("office"), "vlanman-leader-election-office");
    }

    #[test]
    fn interface_names_embed_the_vlan_id() {
        assert_eq!(vlan_link_name(100), "vlan100");
        assert_eq!(macvlan_link_name(100), "macvlan100");
        assert_eq!(gateway_link_name(100), "macvlangw100");
    }
}
