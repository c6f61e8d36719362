//! Mutating admission for consumer pods
//!
//! Every pod creation passes through here. Pods without the vlanman
//! annotations are allowed untouched; annotated pods get an address
//! allocated from their pool under the cluster-wide lock, and a JSON patch
//! that:
//!
//! - labels the pod as a worker of its network,
//! - prepends the `init-vlan` init container carrying the assignment and
//!   routing configuration in its environment,
//! - appends `VLAN_IP` / `VLAN_SUBNET` to every main container,
//! - merges the network's manager affinity into the pod.
//!
//! Denials are admission responses with a human-readable reason; the HTTP
//! exchange itself always succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::Pointer as PointerBuf;
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, EnvVar, Pod, SecurityContext,
};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{debug, error, info};

use super::WebhookState;
use crate::crd::{split_cidr, Route, VlanNetwork};
use crate::{ipam, Error, Result};
use crate::{INIT_CONTAINER_NAME, NETWORK_ANNOTATION, POOL_ANNOTATION, WORKER_LABEL};

/// Handle a mutating admission review for pod creation
pub async fn handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse mutating admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(mutate(&state, &req).await.into_review())
}

/// Process one pod admission request
async fn mutate(state: &WebhookState, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
    if req.kind.kind != "Pod" {
        let err = Error::TypeMismatch {
            context: "mutating webhook".into(),
            expected: "Pod".into(),
            got: req.kind.kind.clone(),
        };
        return AdmissionResponse::from(req).deny(err.to_string());
    }

    let Some(pod) = &req.object else {
        debug!(uid = %req.uid, "no pod in request, allowing unchanged");
        return AdmissionResponse::from(req);
    };

    let resource = format!(
        "{}@{}",
        pod.metadata.name.as_deref().unwrap_or("?"),
        pod.metadata.namespace.as_deref().unwrap_or("default"),
    );

    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let network_name = annotations.get(NETWORK_ANNOTATION);
    let pool_name = annotations.get(POOL_ANNOTATION);
    let (network_name, pool_name) = match (network_name, pool_name) {
        (None, None) => {
            debug!(pod = %resource, "no vlanman annotations, allowing unchanged");
            return AdmissionResponse::from(req);
        }
        (Some(n), Some(p)) => (n.clone(), p.clone()),
        _ => {
            let err = Error::MissingAnnotation { resource };
            return AdmissionResponse::from(req).deny(err.to_string());
        }
    };

    match mutate_annotated(state, req, pod, &resource, &network_name, &pool_name).await {
        Ok(response) => response,
        Err(e) => {
            info!(pod = %resource, reason = %e, "denying pod admission");
            AdmissionResponse::from(req).deny(e.to_string())
        }
    }
}

async fn mutate_annotated(
    state: &WebhookState,
    req: &AdmissionRequest<Pod>,
    pod: &Pod,
    resource: &str,
    network_name: &str,
    pool_name: &str,
) -> Result<AdmissionResponse> {
    let network = state.store.get_network(network_name).await?;

    let locker = state.locker_for(req.dry_run);
    let assigned = ipam::allocate(
        state.store.as_ref(),
        locker.as_ref(),
        resource,
        network_name,
        pool_name,
        req.dry_run,
    )
    .await?;

    let managers = state.store.list_manager_pods(network_name).await?;
    if managers.is_empty() {
        return Err(Error::NoManagerPods {
            resource: resource.to_string(),
            network: network_name.to_string(),
        });
    }
    let mut endpoints = BTreeMap::new();
    for manager in &managers {
        let manager_name = format!(
            "{}@{}",
            manager.metadata.name.as_deref().unwrap_or("?"),
            manager.metadata.namespace.as_deref().unwrap_or("?"),
        );
        let ip = manager
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::ManagerNotReady {
                resource: resource.to_string(),
                manager: manager_name,
            })?;
        let node = manager
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        endpoints.insert(node, ip);
    }

    let ops = build_patch(pod, &network, pool_name, &assigned, &endpoints, &state.config)?;
    info!(
        pod = %resource,
        network = network_name,
        pool = pool_name,
        ip = %assigned,
        patch_ops = ops.len(),
        "mutating pod"
    );

    AdmissionResponse::from(req)
        .with_patch(Patch(ops))
        .map_err(|e| Error::parsing("admission patch", e))
}

/// Build the JSON patch attaching a pod to its network
fn build_patch(
    pod: &Pod,
    network: &VlanNetwork,
    pool_name: &str,
    assigned: &str,
    endpoints: &BTreeMap<String, String>,
    config: &crate::config::OperatorConfig,
) -> Result<Vec<PatchOperation>> {
    let mut ops = Vec::new();
    let network_name = network.metadata.name.clone().unwrap_or_default();

    // Worker label; slashes in the label key are escaped as ~1 by the
    // pointer encoding.
    if pod.metadata.labels.as_ref().is_some_and(|l| !l.is_empty()) {
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::new(["metadata", "labels", WORKER_LABEL]),
            value: serde_json::Value::String(network_name.clone()),
        }));
    } else {
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::new(["metadata", "labels"]),
            value: serde_json::json!({ WORKER_LABEL: network_name }),
        }));
    }

    let init = init_container(network, pool_name, assigned, endpoints, config)?;
    let init_value =
        serde_json::to_value(&init).map_err(|e| Error::parsing("init container", e))?;
    let has_inits = pod
        .spec
        .as_ref()
        .and_then(|s| s.init_containers.as_ref())
        .is_some_and(|c| !c.is_empty());
    if has_inits {
        // Prepend: the VLAN should come up before any other init container
        // that may want to use it.
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::new(["spec", "initContainers", "0"]),
            value: init_value,
        }));
    } else {
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::new(["spec", "initContainers"]),
            value: serde_json::Value::Array(vec![init_value]),
        }));
    }

    let (address, subnet) = split_cidr(assigned);
    let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
    for (idx, container) in containers.iter().enumerate() {
        let vlan_env = [
            env("VLAN_IP", address),
            env("VLAN_SUBNET", subnet),
        ];
        if container.env.as_ref().is_some_and(|e| !e.is_empty()) {
            for var in vlan_env {
                ops.push(PatchOperation::Add(AddOperation {
                    path: PointerBuf::new([
                        "spec",
                        "containers",
                        &idx.to_string(),
                        "env",
                        "-",
                    ]),
                    value: serde_json::to_value(var)
                        .map_err(|e| Error::parsing("container env", e))?,
                }));
            }
        } else {
            ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::new(["spec", "containers", &idx.to_string(), "env"]),
                value: serde_json::to_value(vlan_env.to_vec())
                    .map_err(|e| Error::parsing("container env", e))?,
            }));
        }
    }

    if let Some(affinity) = &network.spec.manager_affinity {
        let merged = merge_affinity(
            pod.spec.as_ref().and_then(|s| s.affinity.as_ref()),
            affinity,
        );
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::new(["spec", "affinity"]),
            value: serde_json::to_value(&merged).map_err(|e| Error::parsing("affinity", e))?,
        }));
    }

    Ok(ops)
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// The injected init container joining the pod to its macvlan
fn init_container(
    network: &VlanNetwork,
    pool_name: &str,
    assigned: &str,
    endpoints: &BTreeMap<String, String>,
    config: &crate::config::OperatorConfig,
) -> Result<Container> {
    let network_name = network.metadata.name.clone().unwrap_or_default();
    let (address, subnet) = split_cidr(assigned);

    let (gateway_ip, gateway_subnet) = match network.spec.gateways.first() {
        Some(gw) => {
            let (a, s) = split_cidr(&gw.address);
            (a.to_string(), s.to_string())
        }
        None => (String::new(), String::new()),
    };

    // The route program for this pod: its pool's routes plus every gateway's.
    let mut routes: Vec<Route> = network
        .spec
        .pool(pool_name)
        .map(|p| p.routes.clone())
        .unwrap_or_default();
    for gw in &network.spec.gateways {
        routes.extend(gw.routes.iter().cloned());
    }
    let remote_routes: Vec<String> = routes.iter().map(|r| r.destination.clone()).collect();
    let routes_json =
        serde_json::to_string(&routes).map_err(|e| Error::parsing("routes env", e))?;

    let managers: Vec<String> = endpoints
        .iter()
        .map(|(node, ip)| format!("{node}={ip}"))
        .collect();

    Ok(Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(config.worker_image.clone()),
        image_pull_policy: Some(config.worker_pull_policy.clone()),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        env: Some(vec![
            env("VLAN_NETWORK", network_name),
            env("MACVLAN_IP", address),
            env("MACVLAN_SUBNET", subnet),
            env("REMOTE_ROUTES", remote_routes.join(",")),
            env("GATEWAY_IP", gateway_ip),
            env("GATEWAY_SUBNET", gateway_subnet),
            env("MANAGERS", managers.join(",")),
            env("ROUTES", routes_json),
        ]),
        ..Default::default()
    })
}

/// Merge pod affinity with the network's manager affinity, the network
/// winning per sub-field
fn merge_affinity(base: Option<&Affinity>, network: &Affinity) -> Affinity {
    let Some(base) = base else {
        return network.clone();
    };
    Affinity {
        node_affinity: network
            .node_affinity
            .clone()
            .or_else(|| base.node_affinity.clone()),
        pod_affinity: network
            .pod_affinity
            .clone()
            .or_else(|| base.pod_affinity.clone()),
        pod_anti_affinity: network
            .pod_anti_affinity
            .clone()
            .or_else(|| base.pod_anti_affinity.clone()),
    }
}
