//! Validating admission for VlanNetwork resources
//!
//! The handler dispatches on the shape of the request: an object without an
//! old object is a creation, the reverse is a deletion, both present is an
//! update, neither is an internal error. The rules:
//!
//! - creation: at least one admissible node must remain after manager
//!   affinity exclusions, and the VLAN id must be unique,
//! - update: same node rule, and only `pools` may change,
//! - deletion: denied while any worker pod of the network is pending or
//!   running, listing them as `name@namespace`.

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{error, info};

use super::WebhookState;
use crate::crd::VlanNetwork;
use crate::{Error, Result, HOSTNAME_LABEL};

/// Handle a validating admission review for VlanNetworks
pub async fn handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<VlanNetwork>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<VlanNetwork> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse validating admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(validate(&state, &req).await.into_review())
}

async fn validate(state: &WebhookState, req: &AdmissionRequest<VlanNetwork>) -> AdmissionResponse {
    let outcome = match (&req.object, &req.old_object) {
        (Some(network), None) => validate_creation(state, network).await,
        (None, Some(network)) => validate_deletion(state, network).await,
        (Some(new), Some(old)) => validate_update(state, new, old).await,
        (None, None) => Err(Error::internal(
            "validating webhook received a request with neither object nor oldObject",
        )),
    };

    match outcome {
        Ok(()) => AdmissionResponse::from(req),
        Err(e) => {
            info!(reason = %e, "denying VlanNetwork admission");
            AdmissionResponse::from(req).deny(e.to_string())
        }
    }
}

async fn validate_creation(state: &WebhookState, network: &VlanNetwork) -> Result<()> {
    network.spec.validate()?;

    let nodes = state.store.list_nodes().await?;
    validate_minimum_nodes(&nodes, network)?;

    let networks = state.store.list_networks().await?;
    validate_unique_vlan(&networks, network)
}

async fn validate_update(
    state: &WebhookState,
    new: &VlanNetwork,
    old: &VlanNetwork,
) -> Result<()> {
    new.spec.validate()?;

    let nodes = state.store.list_nodes().await?;
    validate_minimum_nodes(&nodes, new)?;

    // Everything except pools is frozen after creation.
    let mut new_spec = new.spec.clone();
    let mut old_spec = old.spec.clone();
    new_spec.pools = vec![];
    old_spec.pools = vec![];
    if new_spec != old_spec {
        return Err(Error::validation(
            "The only field in spec that supports update is 'pools'.",
        ));
    }
    Ok(())
}

async fn validate_deletion(state: &WebhookState, network: &VlanNetwork) -> Result<()> {
    let name = network.metadata.name.clone().unwrap_or_default();
    let pods = state.store.list_worker_pods(&name).await?;
    validate_not_in_use(&pods)
}

/// Deny when manager affinity exclusions leave no node to run on
fn validate_minimum_nodes(nodes: &[Node], network: &VlanNetwork) -> Result<()> {
    let denial =
        || Error::validation("There are no available nodes (make sure you don't exclude all nodes)");

    if nodes.is_empty() {
        return Err(denial());
    }

    let Some(selector) = network
        .spec
        .manager_affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
    else {
        return Ok(());
    };

    let admissible = nodes
        .iter()
        .filter(|node| {
            let name = node.metadata.name.as_deref().unwrap_or_default();
            let excluded = selector.node_selector_terms.iter().any(|term| {
                term.match_expressions
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|expr| {
                        expr.key == HOSTNAME_LABEL
                            && expr.operator == "NotIn"
                            && expr
                                .values
                                .as_deref()
                                .unwrap_or_default()
                                .iter()
                                .any(|v| v == name)
                    })
            });
            !excluded
        })
        .count();

    if admissible == 0 {
        return Err(denial());
    }
    Ok(())
}

/// Deny when another network already claims the VLAN id
fn validate_unique_vlan(networks: &[VlanNetwork], network: &VlanNetwork) -> Result<()> {
    let name = network.metadata.name.as_deref().unwrap_or_default();
    for other in networks {
        let other_name = other.metadata.name.as_deref().unwrap_or_default();
        if other_name == name {
            continue;
        }
        if other.spec.vlan_id == network.spec.vlan_id {
            return Err(Error::validation(format!(
                "There exists a network with that VLAN ID: {other_name}"
            )));
        }
    }
    Ok(())
}

/// Deny while pending or running worker pods still reference the network
fn validate_not_in_use(pods: &[Pod]) -> Result<()> {
    let in_use: Vec<String> = pods
        .iter()
        .filter(|pod| {
            matches!(
                pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                Some("Pending") | Some("Running")
            )
        })
        .map(|pod| {
            format!(
                "{}@{}",
                pod.metadata.name.as_deref().unwrap_or("?"),
                pod.metadata.namespace.as_deref().unwrap_or("?"),
            )
        })
        .collect();

    if !in_use.is_empty() {
        return Err(Error::validation(format!(
            "Network is still used by {} pods: {}",
            in_use.len(),
            in_use.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::crd::{VlanNetworkPool, VlanNetworkSpec};
    use crate::lock::NoopLock;
    use crate::store::MockStore;
    use k8s_openapi::api::core::v1::{
        Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        PodStatus,
    };
    use kube::api::ObjectMeta;

    fn state(store: MockStore) -> Arc<WebhookState> {
        Arc::new(WebhookState {
            store: Arc::new(store),
            locker: Arc::new(NoopLock),
            config: OperatorConfig::for_tests(),
        })
    }

    fn network(name: &str, vlan_id: u16) -> VlanNetwork {
        VlanNetwork::new(
            name,
            VlanNetworkSpec {
                vlan_id,
                pools: vec![VlanNetworkPool {
                    name: "p".into(),
                    description: String::new(),
                    addresses: vec!["10.0.0.2/24".into()],
                    routes: vec![],
                }],
                gateways: vec![],
                manager_affinity: None,
                mappings: vec![],
            },
        )
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn excluding_affinity(excluded: &[&str]) -> Affinity {
        Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: HOSTNAME_LABEL.into(),
                            operator: "NotIn".into(),
                            values: Some(excluded.iter().map(|s| s.to_string()).collect()),
                        }]),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn worker_pod(name: &str, namespace: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn request(
        object: Option<&VlanNetwork>,
        old_object: Option<&VlanNetwork>,
        operation: &str,
    ) -> AdmissionRequest<VlanNetwork> {
        let review: AdmissionReview<VlanNetwork> =
            serde_json::from_value(serde_json::json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
                "request": {
                    "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                    "kind": {"group": "vlanman.dialo.ai", "version": "v1", "kind": "VlanNetwork"},
                    "resource": {"group": "vlanman.dialo.ai", "version": "v1", "resource": "vlannetworks"},
                    "name": "n1",
                    "operation": operation,
                    "userInfo": {},
                    "object": object.map(|n| serde_json::to_value(n).unwrap()),
                    "oldObject": old_object.map(|n| serde_json::to_value(n).unwrap()),
                }
            }))
            .unwrap();
        review.try_into().unwrap()
    }

    #[tokio::test]
    async fn creation_with_a_fresh_vlan_id_is_allowed() {
        let mut store = MockStore::new();
        store
            .expect_list_nodes()
            .returning(|| Ok(vec![node("node-a")]));
        store
            .expect_list_networks()
            .returning(|| Ok(vec![network("a", 100)]));

        let new = network("b", 200);
        let response = validate(&state(store), &request(Some(&new), None, "CREATE")).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn duplicate_vlan_ids_are_denied() {
        let mut store = MockStore::new();
        store
            .expect_list_nodes()
            .returning(|| Ok(vec![node("node-a")]));
        store
            .expect_list_networks()
            .returning(|| Ok(vec![network("A", 100)]));

        let new = network("B", 100);
        let response = validate(&state(store), &request(Some(&new), None, "CREATE")).await;
        assert!(!response.allowed);
        assert!(response
            .result
            .message
            .contains("There exists a network with that VLAN ID: A"));
    }

    #[tokio::test]
    async fn creation_excluding_every_node_is_denied() {
        let mut store = MockStore::new();
        store
            .expect_list_nodes()
            .returning(|| Ok(vec![node("node-a"), node("node-b")]));
        store.expect_list_networks().returning(|| Ok(vec![]));

        let mut new = network("n1", 100);
        new.spec.manager_affinity = Some(excluding_affinity(&["node-a", "node-b"]));
        let response = validate(&state(store), &request(Some(&new), None, "CREATE")).await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("There are no available nodes"));
    }

    #[tokio::test]
    async fn partial_exclusions_keep_creation_allowed() {
        let mut store = MockStore::new();
        store
            .expect_list_nodes()
            .returning(|| Ok(vec![node("node-a"), node("node-b")]));
        store.expect_list_networks().returning(|| Ok(vec![]));

        let mut new = network("n1", 100);
        new.spec.manager_affinity = Some(excluding_affinity(&["node-a"]));
        let response = validate(&state(store), &request(Some(&new), None, "CREATE")).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn updates_touching_more_than_pools_are_denied() {
        let mut store = MockStore::new();
        store
            .expect_list_nodes()
            .returning(|| Ok(vec![node("node-a")]));

        let old = network("n1", 100);
        let mut new = network("n1", 200);
        new.spec.pools.push(VlanNetworkPool {
            name: "extra".into(),
            description: String::new(),
            addresses: vec!["10.0.0.9/24".into()],
            routes: vec![],
        });
        let response = validate(&state(store), &request(Some(&new), Some(&old), "UPDATE")).await;
        assert!(!response.allowed);
        assert!(response
            .result
            .message
            .contains("The only field in spec that supports update is 'pools'."));
    }

    #[tokio::test]
    async fn pool_only_updates_are_allowed() {
        let mut store = MockStore::new();
        store
            .expect_list_nodes()
            .returning(|| Ok(vec![node("node-a")]));

        let old = network("n1", 100);
        let mut new = network("n1", 100);
        new.spec.pools[0].addresses.push("10.0.0.4/24".into());
        let response = validate(&state(store), &request(Some(&new), Some(&old), "UPDATE")).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn deletion_while_pods_run_is_denied_listing_them() {
        let mut store = MockStore::new();
        store
            .expect_list_worker_pods()
            .returning(|_| Ok(vec![worker_pod("q", "default", "Running")]));

        let doomed = network("n1", 100);
        let response = validate(&state(store), &request(None, Some(&doomed), "DELETE")).await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("q@default"));
    }

    #[tokio::test]
    async fn deletion_with_only_finished_pods_is_allowed() {
        let mut store = MockStore::new();
        store
            .expect_list_worker_pods()
            .returning(|_| Ok(vec![worker_pod("q", "default", "Succeeded")]));

        let doomed = network("n1", 100);
        let response = validate(&state(store), &request(None, Some(&doomed), "DELETE")).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn shapeless_requests_are_denied_as_internal() {
        let response = validate(
            &state(MockStore::new()),
            &request(None, None, "CREATE"),
        )
        .await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("Internal error"));
    }
}
