//! Typed accessor over the Kubernetes API
//!
//! Everything the core reads or writes lives in the API server: VlanNetworks
//! and their status, pods, nodes, the manager DaemonSets, services, jobs and
//! leases. The [`Store`] trait is the single seam between the coordination
//! logic and the cluster, so IPAM, the executor and both admission handlers
//! are tested against a mock without an API server.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::api::{Api, ListParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::VlanNetwork;
use crate::{Error, Result, MANAGER_LABEL, WORKER_LABEL};

/// Trait abstracting Kubernetes object access for the coordination core
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch one VlanNetwork by name
    async fn get_network(&self, name: &str) -> Result<VlanNetwork>;

    /// List every declared VlanNetwork
    async fn list_networks(&self) -> Result<Vec<VlanNetwork>>;

    /// Replace the status subresource of a network; 409 surfaces as an error
    /// the caller may retry on
    async fn update_network_status(&self, network: &VlanNetwork) -> Result<VlanNetwork>;

    /// List pods labeled as workers of the given network
    async fn list_worker_pods(&self, network: &str) -> Result<Vec<Pod>>;

    /// List pods labeled as managers of the given network
    async fn list_manager_pods(&self, network: &str) -> Result<Vec<Pod>>;

    /// Fetch one pod from the operator namespace
    async fn get_pod(&self, name: &str) -> Result<Pod>;

    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// List every pod in the cluster
    async fn list_all_pods(&self) -> Result<Vec<Pod>>;

    /// List the manager DaemonSets of every network
    async fn list_manager_sets(&self) -> Result<Vec<DaemonSet>>;

    /// Fetch one manager DaemonSet; Ok(None) when it does not exist
    async fn get_manager_set(&self, name: &str) -> Result<Option<DaemonSet>>;

    /// Submit a manager DaemonSet
    async fn create_manager_set(&self, set: &DaemonSet) -> Result<()>;

    /// Delete a manager DaemonSet; missing objects are not an error
    async fn delete_manager_set(&self, name: &str) -> Result<()>;

    /// Create the per-network service; an existing one is left in place
    async fn ensure_service(&self, service: &Service) -> Result<()>;

    /// Submit an interface-creation job; an existing one is left in place
    async fn create_job(&self, job: &Job) -> Result<()>;
}

/// Real [`Store`] backed by a kube client
///
/// Namespaced objects (manager sets, services, jobs, manager pods) live in
/// the operator namespace; worker pods are listed across all namespaces.
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    /// Create a store bound to the operator namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn networks(&self) -> Api<VlanNetwork> {
        Api::all(self.client.clone())
    }

    fn sets(&self) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get_network(&self, name: &str) -> Result<VlanNetwork> {
        Ok(self.networks().get(name).await?)
    }

    async fn list_networks(&self) -> Result<Vec<VlanNetwork>> {
        Ok(self.networks().list(&ListParams::default()).await?.items)
    }

    async fn update_network_status(&self, network: &VlanNetwork) -> Result<VlanNetwork> {
        let name = network
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("network without a name in update_network_status"))?;
        // Full replace carrying the resourceVersion we read, so concurrent
        // writers surface as 409 conflicts the caller retries under the lock.
        let body = serde_json::to_vec(network)
            .map_err(|e| Error::parsing("VlanNetwork status body", e))?;
        Ok(self
            .networks()
            .replace_status(name, &PostParams::default(), body)
            .await?)
    }

    async fn list_worker_pods(&self, network: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&format!("{WORKER_LABEL}={network}"));
        Ok(pods.list(&lp).await?.items)
    }

    async fn list_manager_pods(&self, network: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&format!("{MANAGER_LABEL}={network}"));
        Ok(pods.list(&lp).await?.items)
    }

    async fn get_pod(&self, name: &str) -> Result<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(pods.get(name).await?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default()).await?.items)
    }

    async fn list_all_pods(&self) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        Ok(pods.list(&ListParams::default()).await?.items)
    }

    async fn list_manager_sets(&self) -> Result<Vec<DaemonSet>> {
        let lp = ListParams::default().labels(MANAGER_LABEL);
        Ok(self.sets().list(&lp).await?.items)
    }

    async fn get_manager_set(&self, name: &str) -> Result<Option<DaemonSet>> {
        match self.sets().get(name).await {
            Ok(set) => Ok(Some(set)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_manager_set(&self, set: &DaemonSet) -> Result<()> {
        self.sets().create(&PostParams::default(), set).await?;
        Ok(())
    }

    async fn delete_manager_set(&self, name: &str) -> Result<()> {
        match self.sets().delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_service(&self, service: &Service) -> Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        match services.create(&PostParams::default(), service).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        match jobs.create(&PostParams::default(), job).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
