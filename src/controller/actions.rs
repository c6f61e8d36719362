//! Action executor
//!
//! Carries out the planner's Create/Delete actions against the cluster.
//! Creation is synchronous: the executor waits, with a bounded polling
//! budget, for the DaemonSet to schedule, for its pods to become available
//! and receive IPs, and for every manager endpoint to report ready after its
//! VLAN interface job ran. A timeout mid-create attempts to tear the
//! DaemonSet down again and reports whether that cleanup worked.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, Pod, PodSpec, PodTemplateSpec, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use super::manager::{daemon_set_for, service_for, ManagerSpec};
use super::plan::Action;
use super::Context;
use crate::agent::PidResponse;
use crate::retry::poll_until;
use crate::{job_name, manager_set_name, Error, Result, HOSTNAME_LABEL, MANAGER_PORT};

/// HTTP surface of a manager pod, as seen by the executor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagerApi: Send + Sync {
    /// Fetch the manager's root process id from `GET /pid`
    async fn pid(&self, pod_ip: &str) -> Result<i64>;

    /// Probe `GET /ready`; true on HTTP 200
    async fn ready(&self, pod_ip: &str) -> Result<bool>;
}

/// Real [`ManagerApi`] over reqwest
pub struct HttpManagerApi {
    client: reqwest::Client,
}

impl HttpManagerApi {
    /// Create a client for manager endpoints
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpManagerApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagerApi for HttpManagerApi {
    async fn pid(&self, pod_ip: &str) -> Result<i64> {
        let url = format!("http://{pod_ip}:{MANAGER_PORT}/pid");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Request {
                action: "get manager pid".into(),
                source: e,
            })?;
        let body: PidResponse = response.json().await.map_err(|e| Error::Request {
            action: "parse manager pid response".into(),
            source: e,
        })?;
        Ok(body.pid)
    }

    async fn ready(&self, pod_ip: &str) -> Result<bool> {
        let url = format!("http://{pod_ip}:{MANAGER_PORT}/ready");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Request {
                action: "probe manager readiness".into(),
                source: e,
            })?;
        Ok(response.status().is_success())
    }
}

impl Action {
    /// Execute this action against the cluster
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        match self {
            Action::Create(spec) => create_manager(spec, ctx).await,
            Action::Delete(spec) => delete_manager(spec, ctx).await,
        }
    }
}

async fn create_manager(spec: &ManagerSpec, ctx: &Context) -> Result<()> {
    let name = manager_set_name(&spec.network_name);
    let set = daemon_set_for(spec, &ctx.config)?;
    ctx.store.create_manager_set(&set).await?;
    info!(network = %spec.network_name, daemonset = %name, "submitted manager daemonset");

    let set_name = name.as_str();

    // Phase 1: the object is scheduled once its status reports any desired
    // instances. Nothing to clean up if this never happens.
    let scheduled = poll_until(ctx.budget, "daemonset scheduled", || async move {
        match ctx.store.get_manager_set(set_name).await? {
            Some(set) => {
                let desired = set
                    .status
                    .as_ref()
                    .map(|s| s.desired_number_scheduled)
                    .unwrap_or(0);
                Ok((desired > 0).then_some(set))
            }
            None => Ok(None),
        }
    })
    .await?;
    if scheduled.is_none() {
        return Err(Error::DaemonSetTimeout {
            name: spec.network_name.clone(),
            attempts: ctx.budget.attempts,
            ready: 0,
            total: 0,
            cleanup_success: true,
            cleanup_error: None,
        });
    }

    // Phase 2: every instance available.
    let available = poll_until(ctx.budget, "daemonset available", || async move {
        match ctx.store.get_manager_set(set_name).await? {
            Some(set) => {
                let status = set.status.clone().unwrap_or_default();
                Ok((status.number_unavailable.unwrap_or(0) == 0).then_some(set))
            }
            None => Ok(None),
        }
    })
    .await?;
    let set = match available {
        Some(set) => set,
        None => {
            let (cleanup_success, cleanup_error) =
                match ctx.store.delete_manager_set(&name).await {
                    Ok(()) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                };
            let status = ctx
                .store
                .get_manager_set(&name)
                .await
                .ok()
                .flatten()
                .and_then(|s| s.status)
                .unwrap_or_default();
            return Err(Error::DaemonSetTimeout {
                name: spec.network_name.clone(),
                attempts: ctx.budget.attempts,
                ready: status.current_number_scheduled,
                total: status.desired_number_scheduled,
                cleanup_success,
                cleanup_error,
            });
        }
    };

    // The service is recreated idempotently on every create.
    ctx.store
        .ensure_service(&service_for(spec, &ctx.config.namespace))
        .await?;

    let desired = set
        .status
        .as_ref()
        .map(|s| s.desired_number_scheduled)
        .unwrap_or(0);

    // Phase 3: one manager pod per scheduled instance.
    let network = spec.network_name.as_str();
    let pods = poll_until(ctx.budget, "manager pods created", || async move {
        let pods = ctx.store.list_manager_pods(network).await?;
        Ok((pods.len() as i32 == desired).then_some(pods))
    })
    .await?;
    let Some(pods) = pods else {
        return Err(Error::DaemonSetTimeout {
            name: spec.network_name.clone(),
            attempts: ctx.budget.attempts,
            ready: ctx.store.list_manager_pods(&spec.network_name).await?.len() as i32,
            total: desired,
            cleanup_success: true,
            cleanup_error: None,
        });
    };

    // Phase 4: per pod, learn the manager PID, run the interface job on its
    // node, and wait for the endpoint to turn ready.
    for pod in &pods {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let ip = wait_for_pod_ip(ctx, &pod_name).await?;

        let pid = ctx.manager_api.pid(&ip).await?;
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        let job = interface_job(spec, &node, pid, ctx)?;
        ctx.store.create_job(&job).await?;
        info!(
            network = %spec.network_name,
            node = %node,
            pid = pid,
            "submitted interface creation job"
        );

        let ip_ref = ip.as_str();
        let ready = poll_until(ctx.budget, "manager ready", || async move {
            Ok(ctx.manager_api.ready(ip_ref).await?.then_some(()))
        })
        .await?;
        if ready.is_none() {
            return Err(Error::DaemonPodTimeout {
                name: pod_name,
                attempts: ctx.budget.attempts,
                cleanup_success: false,
                cleanup_error: Some("cleanup not attempted".into()),
            });
        }
    }

    Ok(())
}

async fn wait_for_pod_ip(ctx: &Context, pod_name: &str) -> Result<String> {
    let ip = poll_until(ctx.budget, "manager pod ip", || async move {
        let pod: Pod = ctx.store.get_pod(pod_name).await?;
        Ok(pod.status.and_then(|s| s.pod_ip).filter(|ip| !ip.is_empty()))
    })
    .await?;
    ip.ok_or_else(|| Error::DaemonPodTimeout {
        name: pod_name.to_string(),
        attempts: ctx.budget.attempts,
        cleanup_success: false,
        cleanup_error: Some("cleanup not attempted".into()),
    })
}

async fn delete_manager(spec: &ManagerSpec, ctx: &Context) -> Result<()> {
    let name = manager_set_name(&spec.network_name);
    warn!(network = %spec.network_name, daemonset = %name, "deleting manager daemonset");
    ctx.store.delete_manager_set(&name).await
}

/// One-shot job that creates `vlan<id>` on a node and moves it into the
/// manager's network namespace
fn interface_job(spec: &ManagerSpec, node: &str, pid: i64, ctx: &Context) -> Result<Job> {
    let env = |name: &str, value: String| k8s_openapi::api::core::v1::EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(&spec.network_name, node)),
            namespace: Some(ctx.config.namespace.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: ctx.config.job_ttl_seconds,
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    termination_grace_period_seconds: Some(1),
                    host_network: Some(true),
                    host_pid: Some(true),
                    node_selector: Some(
                        [(HOSTNAME_LABEL.to_string(), node.to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "create-vlan".to_string(),
                        image: Some(ctx.config.interface_image.clone()),
                        image_pull_policy: Some(ctx.config.interface_pull_policy.clone()),
                        env: Some(vec![
                            env("PID", pid.to_string()),
                            env("ID", spec.vlan_id.to_string()),
                            env(
                                "INTERFACE",
                                spec.interface_for_node(node).unwrap_or_default().to_string(),
                            ),
                        ]),
                        security_context: Some(SecurityContext {
                            capabilities: Some(Capabilities {
                                add: Some(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::crd::IpMapping;
    use crate::lock::NoopLock;
    use crate::retry::PollBudget;
    use crate::store::MockStore;
    use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus};
    use k8s_openapi::api::core::v1::PodStatus;
    use std::sync::Arc;
    use std::time::Duration;

    fn quick_ctx(store: MockStore, api: MockManagerApi) -> Context {
        Context {
            store: Arc::new(store),
            locker: Arc::new(NoopLock),
            manager_api: Arc::new(api),
            config: OperatorConfig::for_tests(),
            budget: PollBudget {
                attempts: 3,
                interval: Duration::from_millis(1),
            },
        }
    }

    fn manager(network: &str) -> ManagerSpec {
        ManagerSpec {
            network_name: network.into(),
            vlan_id: 100,
            gateways: vec![],
            manager_affinity: None,
            mappings: vec![IpMapping {
                node_name: "node-a".into(),
                interface: "eth1".into(),
            }],
            pools: vec![],
        }
    }

    fn ready_set(network: &str) -> DaemonSet {
        let mut set =
            daemon_set_for(&manager(network), &OperatorConfig::for_tests()).unwrap();
        set.status = Some(DaemonSetStatus {
            desired_number_scheduled: 1,
            current_number_scheduled: 1,
            number_unavailable: Some(0),
            ..Default::default()
        });
        set
    }

    fn manager_pod(name: &str, node: &str, ip: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("vlanman-system".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.into()),
                containers: vec![],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some(ip.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_runs_the_full_readiness_sequence() {
        let mut store = MockStore::new();
        store.expect_create_manager_set().returning(|_| Ok(()));
        store
            .expect_get_manager_set()
            .returning(|_| Ok(Some(ready_set("n1"))));
        store.expect_ensure_service().returning(|svc| {
            assert_eq!(svc.metadata.name.as_deref(), Some("n1-service"));
            Ok(())
        });
        store
            .expect_list_manager_pods()
            .returning(|_| Ok(vec![manager_pod("mgr-1", "node-a", "10.244.0.5")]));
        store
            .expect_get_pod()
            .returning(|_| Ok(manager_pod("mgr-1", "node-a", "10.244.0.5")));
        store.expect_create_job().returning(|job| {
            assert_eq!(job.metadata.name.as_deref(), Some("create-vlan-job-n1-node-a"));
            let container = &job
                .spec
                .as_ref()
                .unwrap()
                .template
                .spec
                .as_ref()
                .unwrap()
                .containers[0];
            let envs: std::collections::BTreeMap<&str, &str> = container
                .env
                .as_ref()
                .unwrap()
                .iter()
                .map(|e| (e.name.as_str(), e.value.as_deref().unwrap()))
                .collect();
            assert_eq!(envs["PID"], "42");
            assert_eq!(envs["ID"], "100");
            assert_eq!(envs["INTERFACE"], "eth1");
            Ok(())
        });

        let mut api = MockManagerApi::new();
        api.expect_pid().returning(|_| Ok(42));
        api.expect_ready().returning(|_| Ok(true));

        let ctx = quick_ctx(store, api);
        Action::Create(manager("n1")).execute(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn unscheduled_daemonset_times_out_without_cleanup() {
        let mut store = MockStore::new();
        store.expect_create_manager_set().returning(|_| Ok(()));
        // Status never materializes.
        store.expect_get_manager_set().returning(|_| Ok(None));

        let ctx = quick_ctx(store, MockManagerApi::new());
        let err = Action::Create(manager("n1")).execute(&ctx).await.unwrap_err();
        match err {
            Error::DaemonSetTimeout {
                cleanup_success, ..
            } => assert!(cleanup_success),
            other => panic!("expected DaemonSetTimeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn unavailable_daemonset_is_cleaned_up_on_timeout() {
        let mut store = MockStore::new();
        store.expect_create_manager_set().returning(|_| Ok(()));
        store.expect_get_manager_set().returning(|_| {
            let mut set = ready_set("n1");
            set.status.as_mut().unwrap().number_unavailable = Some(1);
            Ok(Some(set))
        });
        store
            .expect_delete_manager_set()
            .times(1)
            .returning(|name| {
                assert_eq!(name, "vlan-manager-n1");
                Ok(())
            });

        let ctx = quick_ctx(store, MockManagerApi::new());
        let err = Action::Create(manager("n1")).execute(&ctx).await.unwrap_err();
        match err {
            Error::DaemonSetTimeout {
                ready,
                total,
                cleanup_success,
                ..
            } => {
                assert_eq!((ready, total), (1, 1));
                assert!(cleanup_success);
            }
            other => panic!("expected DaemonSetTimeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn never_ready_manager_times_out_per_pod() {
        let mut store = MockStore::new();
        store.expect_create_manager_set().returning(|_| Ok(()));
        store
            .expect_get_manager_set()
            .returning(|_| Ok(Some(ready_set("n1"))));
        store.expect_ensure_service().returning(|_| Ok(()));
        store
            .expect_list_manager_pods()
            .returning(|_| Ok(vec![manager_pod("mgr-1", "node-a", "10.244.0.5")]));
        store
            .expect_get_pod()
            .returning(|_| Ok(manager_pod("mgr-1", "node-a", "10.244.0.5")));
        store.expect_create_job().returning(|_| Ok(()));

        let mut api = MockManagerApi::new();
        api.expect_pid().returning(|_| Ok(42));
        api.expect_ready().returning(|_| Ok(false));

        let ctx = quick_ctx(store, api);
        let err = Action::Create(manager("n1")).execute(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::DaemonPodTimeout { name, .. } if name == "mgr-1"));
    }

    #[tokio::test]
    async fn delete_removes_the_daemonset() {
        let mut store = MockStore::new();
        store
            .expect_delete_manager_set()
            .times(1)
            .returning(|name| {
                assert_eq!(name, "vlan-manager-n1");
                Ok(())
            });

        let ctx = quick_ctx(store, MockManagerApi::new());
        Action::Delete(manager("n1")).execute(&ctx).await.unwrap();
    }
}
