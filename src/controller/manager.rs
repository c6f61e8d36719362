//! Desired-state projection and manager workload templates
//!
//! A [`ManagerSpec`] is the essential description of one per-network manager
//! workload: which network it serves, on which VLAN, where it may run, and
//! which gateways and interface mappings it carries. The projector maps
//! declared VlanNetworks onto ManagerSpecs; the templates materialize a
//! ManagerSpec into the DaemonSet and Service the executor submits; and
//! `manager_from_daemon_set` recovers a ManagerSpec from an observed
//! DaemonSet so the planner can diff desired against observed.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
    SecurityContext, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::OperatorConfig;
use crate::crd::{Gateway, IpMapping, VlanNetwork, VlanNetworkPool};
use crate::{
    leader_lease_name, manager_set_name, service_name, Error, Result, MANAGER_CONTAINER_NAME,
    MANAGER_LABEL, MANAGER_PORT,
};

/// Essential attributes of one per-network manager workload
#[derive(Clone, Debug, PartialEq)]
pub struct ManagerSpec {
    /// Name of the owning VlanNetwork
    pub network_name: String,
    /// VLAN id the managers serve
    pub vlan_id: u16,
    /// Gateways owned by the elected leader
    pub gateways: Vec<Gateway>,
    /// Node affinity constraining manager placement
    pub manager_affinity: Option<Affinity>,
    /// Node-to-interface mappings
    pub mappings: Vec<IpMapping>,
    /// Declared pools, passed through to the manager environment
    pub pools: Vec<VlanNetworkPool>,
}

impl ManagerSpec {
    /// Project one declared network onto its manager workload
    pub fn from_network(network: &VlanNetwork) -> Self {
        Self {
            network_name: network.metadata.name.clone().unwrap_or_default(),
            vlan_id: network.spec.vlan_id,
            gateways: network.spec.gateways.clone(),
            manager_affinity: network.spec.manager_affinity.clone(),
            mappings: network.spec.mappings.clone(),
            pools: network.spec.pools.clone(),
        }
    }

    /// Ordering key used to sort desired and observed sequences
    pub fn cmp_key(&self, other: &Self) -> Ordering {
        (self.network_name.as_str(), self.vlan_id).cmp(&(other.network_name.as_str(), other.vlan_id))
    }

    /// Two managers are interchangeable iff vlan id, sorted gateways and
    /// sorted mappings agree. Pools and affinity deliberately do not force a
    /// replace: pools flow through IPAM, and affinity alone never changes a
    /// placed daemon.
    pub fn same_config(&self, other: &Self) -> bool {
        self.vlan_id == other.vlan_id
            && sorted_gateways(&self.gateways) == sorted_gateways(&other.gateways)
            && sorted_mappings(&self.mappings) == sorted_mappings(&other.mappings)
    }

    /// The mapped interface for a node, when one is declared
    pub fn interface_for_node(&self, node: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.node_name == node)
            .map(|m| m.interface.as_str())
    }
}

fn sorted_gateways(gateways: &[Gateway]) -> Vec<Gateway> {
    let mut sorted = gateways.to_vec();
    sorted.sort_by(|a, b| a.address.cmp(&b.address));
    sorted
}

fn sorted_mappings(mappings: &[IpMapping]) -> Vec<IpMapping> {
    let mut sorted = mappings.to_vec();
    sorted.sort_by(|a, b| a.node_name.cmp(&b.node_name));
    sorted
}

/// Project every declared network onto its manager workload
pub fn project(networks: &[VlanNetwork]) -> Vec<ManagerSpec> {
    networks.iter().map(ManagerSpec::from_network).collect()
}

fn manager_labels(network: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGER_LABEL.to_string(), network.to_string())])
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Materialize the manager DaemonSet for a spec
pub fn daemon_set_for(spec: &ManagerSpec, config: &OperatorConfig) -> Result<DaemonSet> {
    let pools = serde_json::to_string(&spec.pools)
        .map_err(|e| Error::parsing("manager pools env", e))?;
    let gateways = serde_json::to_string(&spec.gateways)
        .map_err(|e| Error::parsing("manager gateways env", e))?;
    let mappings = serde_json::to_string(&spec.mappings)
        .map_err(|e| Error::parsing("manager mappings env", e))?;

    let container = Container {
        name: MANAGER_CONTAINER_NAME.to_string(),
        image: Some(config.manager_image.clone()),
        image_pull_policy: Some(config.manager_pull_policy.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("manager".to_string()),
            container_port: MANAGER_PORT as i32,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            env("VLAN_ID", spec.vlan_id.to_string()),
            env("NAMESPACE", &config.namespace),
            env("LOCK_NAME", leader_lease_name(&spec.network_name)),
            env("OWNER_NETWORK", &spec.network_name),
            env("POOLS", pools),
            env("GATEWAYS", gateways),
            env("MAPPINGS", mappings),
        ]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(DaemonSet {
        metadata: ObjectMeta {
            name: Some(manager_set_name(&spec.network_name)),
            namespace: Some(config.namespace.clone()),
            labels: Some(manager_labels(&spec.network_name)),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(manager_labels(&spec.network_name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(manager_labels(&spec.network_name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(config.service_account.clone()),
                    host_pid: Some(true),
                    affinity: spec.manager_affinity.clone(),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Materialize the per-network service fronting the manager pods.
///
/// Local traffic policy keeps a worker's request on its own node, which is
/// what makes the macvlan land in the right network namespace.
pub fn service_for(spec: &ManagerSpec, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&spec.network_name)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(manager_labels(&spec.network_name)),
            internal_traffic_policy: Some("Local".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("manager".to_string()),
                protocol: Some("TCP".to_string()),
                port: MANAGER_PORT as i32,
                target_port: Some(IntOrString::Int(MANAGER_PORT as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Recover a ManagerSpec from an observed DaemonSet
pub fn manager_from_daemon_set(set: &DaemonSet) -> Result<ManagerSpec> {
    let network_name = set
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGER_LABEL))
        .cloned()
        .ok_or_else(|| {
            Error::internal(format!(
                "daemonset '{}' carries no manager label",
                set.metadata.name.as_deref().unwrap_or("?")
            ))
        })?;

    let template = set
        .spec
        .as_ref()
        .map(|s| &s.template)
        .ok_or_else(|| Error::internal("daemonset without a pod template"))?;
    let pod_spec = template
        .spec
        .as_ref()
        .ok_or_else(|| Error::internal("daemonset template without a pod spec"))?;
    let container = pod_spec
        .containers
        .iter()
        .find(|c| c.name == MANAGER_CONTAINER_NAME)
        .ok_or_else(|| Error::internal("daemonset without a manager container"))?;

    let mut vlan_id = 0u16;
    let mut gateways = Vec::new();
    let mut mappings = Vec::new();
    let mut pools = Vec::new();
    for var in container.env.as_deref().unwrap_or_default() {
        let Some(value) = var.value.as_deref() else {
            continue;
        };
        match var.name.as_str() {
            "VLAN_ID" => {
                vlan_id = value
                    .parse()
                    .map_err(|e| Error::parsing("VLAN_ID env of observed manager", e))?;
            }
            "GATEWAYS" => {
                gateways = serde_json::from_str(value)
                    .map_err(|e| Error::parsing("GATEWAYS env of observed manager", e))?;
            }
            "MAPPINGS" => {
                mappings = serde_json::from_str(value)
                    .map_err(|e| Error::parsing("MAPPINGS env of observed manager", e))?;
            }
            "POOLS" => {
                pools = serde_json::from_str(value)
                    .map_err(|e| Error::parsing("POOLS env of observed manager", e))?;
            }
            _ => {}
        }
    }

    Ok(ManagerSpec {
        network_name,
        vlan_id,
        gateways,
        manager_affinity: pod_spec.affinity.clone(),
        mappings,
        pools,
    })
}
