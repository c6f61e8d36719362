//! Controller implementation for VlanNetwork resources
//!
//! The reconciler re-derives everything from the cluster on every pass:
//! it refreshes IPAM state for all networks under the cluster-wide lock,
//! projects declared networks onto desired manager workloads, diffs them
//! against the observed DaemonSets, and executes the resulting plan. No
//! in-process state survives between passes.
//!
//! Triggers are VlanNetwork events plus events of pods carrying the network
//! annotation; the watch framework coalesces them per network key.

pub mod actions;
pub mod manager;
pub mod plan;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{error, info, instrument, warn};

pub use actions::{HttpManagerApi, ManagerApi};
pub use manager::ManagerSpec;

use crate::config::OperatorConfig;
use crate::crd::VlanNetwork;
use crate::ipam;
use crate::lock::Locker;
use crate::retry::PollBudget;
use crate::store::Store;
use crate::{Error, Result, NETWORK_ANNOTATION};

/// Shared state of every reconcile call
pub struct Context {
    /// Cluster access
    pub store: Arc<dyn Store>,
    /// Cluster-wide mutex guarding status writes
    pub locker: Arc<dyn Locker>,
    /// HTTP surface of manager pods
    pub manager_api: Arc<dyn ManagerApi>,
    /// Operator environment
    pub config: OperatorConfig,
    /// Polling budget for the executor's readiness waits
    pub budget: PollBudget,
}

/// Reconcile one trigger: refresh IPAM, then converge manager workloads.
///
/// The network key only identifies the trigger; the pass itself covers every
/// declared network so that a single watch event converges the whole world.
#[instrument(skip_all, fields(trigger = %network.name_any()))]
pub async fn reconcile(network: Arc<VlanNetwork>, ctx: Arc<Context>) -> Result<Action> {
    info!("reconciling");

    let requeue = ipam::refresh_all(ctx.store.as_ref(), ctx.locker.as_ref()).await?;

    let networks = ctx.store.list_networks().await?;
    let desired = manager::project(&networks);

    let mut observed = Vec::new();
    for set in ctx.store.list_manager_sets().await? {
        match manager::manager_from_daemon_set(&set) {
            Ok(spec) => observed.push(spec),
            Err(e) => {
                // An unparseable manager set is foreign or corrupt; skip it
                // rather than blocking every other network.
                warn!(error = %e, "ignoring unreadable manager daemonset");
            }
        }
    }

    let plan = plan::plan(desired, observed);
    let mut failures = Vec::new();
    for action in plan {
        let what = action.describe();
        info!(action = %what, "executing");
        if let Err(e) = action.execute(&ctx).await {
            error!(action = %what, error = %e, "action failed");
            failures.push(e);
        }
    }
    if !failures.is_empty() {
        return Err(Error::Aggregate(failures));
    }

    Ok(match requeue {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

/// Requeue policy on reconcile errors
pub fn error_policy(network: Arc<VlanNetwork>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        network = %network.name_any(),
        error = %error,
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Map a pod event onto the network it belongs to.
///
/// Only pods carrying the network annotation matter, and interface-job pods
/// are excluded so the jobs the executor creates do not retrigger it.
pub fn network_of_pod(pod: &Pod) -> Option<ObjectRef<VlanNetwork>> {
    let network = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(NETWORK_ANNOTATION))
        .filter(|v| !v.is_empty())?;
    let is_job_pod = pod
        .metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key("job-name"));
    if is_job_pod {
        return None;
    }
    Some(ObjectRef::new(network))
}

/// Run the controller until shutdown
pub async fn run(client: Client, ctx: Arc<Context>) -> Result<()> {
    let networks: Api<VlanNetwork> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    info!("starting VlanNetwork controller");
    Controller::new(networks, watcher::Config::default())
        .watches(pods, watcher::Config::default(), |pod| {
            network_of_pod(&pod)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => tracing::debug!(object = %obj, "reconciled"),
                Err(e) => tracing::debug!(error = %e, "reconcile stream error"),
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::NoopLock;
    use crate::store::MockStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as KMeta;

    fn annotated_pod(annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: KMeta {
                name: Some("p".into()),
                namespace: Some("default".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn annotated_pods_map_to_their_network() {
        let pod = annotated_pod(&[(NETWORK_ANNOTATION, "n1")], &[]);
        let obj = network_of_pod(&pod).expect("pod should trigger its network");
        assert_eq!(obj.name, "n1");
    }

    #[test]
    fn unannotated_and_job_pods_do_not_trigger() {
        assert!(network_of_pod(&annotated_pod(&[], &[])).is_none());
        assert!(network_of_pod(&annotated_pod(&[(NETWORK_ANNOTATION, "")], &[])).is_none());
        assert!(network_of_pod(&annotated_pod(
            &[(NETWORK_ANNOTATION, "n1")],
            &[("job-name", "create-vlan-job-n1-node-a")]
        ))
        .is_none());
    }

    #[tokio::test]
    async fn empty_world_reconciles_to_await_change() {
        let mut store = MockStore::new();
        store.expect_list_networks().returning(|| Ok(vec![]));
        store.expect_list_manager_sets().returning(|| Ok(vec![]));

        let ctx = Arc::new(Context {
            store: Arc::new(store),
            locker: Arc::new(NoopLock),
            manager_api: Arc::new(actions::MockManagerApi::new()),
            config: crate::config::OperatorConfig::for_tests(),
            budget: PollBudget {
                attempts: 1,
                interval: Duration::from_millis(1),
            },
        });

        let trigger = Arc::new(VlanNetwork::new(
            "n1",
            crate::crd::VlanNetworkSpec {
                vlan_id: 1,
                pools: vec![],
                gateways: vec![],
                manager_affinity: None,
                mappings: vec![],
            },
        ));
        let action = reconcile(trigger, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn failed_actions_surface_as_one_aggregate() {
        let mut store = MockStore::new();
        let net = VlanNetwork::new(
            "n1",
            crate::crd::VlanNetworkSpec {
                vlan_id: 100,
                pools: vec![crate::crd::VlanNetworkPool {
                    name: "p".into(),
                    description: String::new(),
                    addresses: vec!["10.0.0.2/24".into()],
                    routes: vec![],
                }],
                gateways: vec![],
                manager_affinity: None,
                mappings: vec![],
            },
        );
        store
            .expect_list_networks()
            .returning(move || Ok(vec![net.clone()]));
        store.expect_list_worker_pods().returning(|_| Ok(vec![]));
        store
            .expect_update_network_status()
            .returning(|n| Ok(n.clone()));
        store.expect_list_manager_sets().returning(|| Ok(vec![]));
        // The plan wants a Create; make it fail at submission.
        store.expect_create_manager_set().returning(|_| {
            Err(Error::unrecoverable("daemonset submission refused"))
        });

        let ctx = Arc::new(Context {
            store: Arc::new(store),
            locker: Arc::new(NoopLock),
            manager_api: Arc::new(actions::MockManagerApi::new()),
            config: crate::config::OperatorConfig::for_tests(),
            budget: PollBudget {
                attempts: 1,
                interval: Duration::from_millis(1),
            },
        });

        let trigger = Arc::new(VlanNetwork::new(
            "n1",
            crate::crd::VlanNetworkSpec {
                vlan_id: 100,
                pools: vec![],
                gateways: vec![],
                manager_affinity: None,
                mappings: vec![],
            },
        ));
        let err = reconcile(trigger, ctx).await.unwrap_err();
        assert!(matches!(err, Error::Aggregate(ref v) if v.len() == 1));
    }
}
