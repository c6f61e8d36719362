//! Worker init-container logic
//!
//! Runs as the first init container of an annotated pod. It asks the
//! co-located manager (through the per-network service, whose Local traffic
//! policy keeps the request on this node) to create a macvlan inside this
//! pod's network namespace, then brings the interface up, binds the assigned
//! address, and installs the route program from its environment. Any fatal
//! error exits the container with code 1 so the pod retries.

use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::info;

use crate::agent::{LinkOps, MacvlanRequest, MacvlanResponse, RouteSpec, RtnetlinkOps};
use crate::crd::{parse_cidr, Route, RouteSource};
use crate::{macvlan_link_name, Error, Result, MANAGER_PORT};

/// DNS suffix of the per-network service, fixed by the deployment layout
const OPERATOR_NAMESPACE: &str = "vlanman-system";

/// Environment contract of the worker init container, set by admission
#[derive(Clone, Debug)]
pub struct WorkerEnv {
    /// Network this pod joins
    pub network: String,
    /// Assigned address, without mask
    pub macvlan_ip: String,
    /// Mask of the assigned address
    pub macvlan_subnet: String,
    /// Gateway address without mask; empty when the network has none
    pub gateway_ip: String,
    /// Gateway mask
    pub gateway_subnet: String,
    /// Route program, JSON-decoded from `ROUTES`
    pub routes: Vec<Route>,
}

impl WorkerEnv {
    /// Parse the injected environment
    pub fn from_env() -> Result<Self> {
        let network = std::env::var("VLAN_NETWORK")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::unrecoverable("VLAN_NETWORK env variable is not set"))?;
        let macvlan_ip = std::env::var("MACVLAN_IP")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::unrecoverable("MACVLAN_IP env variable is not set"))?;
        let macvlan_subnet = std::env::var("MACVLAN_SUBNET")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "32".into());
        let routes = match std::env::var("ROUTES") {
            Ok(raw) if !raw.is_empty() => serde_json::from_str(&raw)
                .map_err(|e| Error::parsing("ROUTES env variable", e))?,
            _ => vec![],
        };
        Ok(Self {
            network,
            macvlan_ip,
            macvlan_subnet,
            gateway_ip: std::env::var("GATEWAY_IP").unwrap_or_default(),
            gateway_subnet: std::env::var("GATEWAY_SUBNET")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "32".into()),
            routes,
        })
    }

    fn assigned(&self) -> Result<Ipv4Net> {
        parse_cidr(&format!("{}/{}", self.macvlan_ip, self.macvlan_subnet))
    }

    fn gateway(&self) -> Result<Option<Ipv4Net>> {
        if self.gateway_ip.is_empty() {
            return Ok(None);
        }
        parse_cidr(&format!("{}/{}", self.gateway_ip, self.gateway_subnet)).map(Some)
    }
}

/// Extract the namespace inode from a `/proc/<pid>/ns/net` link target,
/// which reads `net:[<inode>]`
pub fn parse_ns_inode(target: &str) -> Result<u64> {
    target
        .trim()
        .strip_prefix("net:[")
        .and_then(|s| s.strip_suffix(']'))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::parsing("network namespace link", format!("unexpected '{target}'")))
}

/// The routes this worker installs on its macvlan.
///
/// The gateway's own subnet is reached with a link-scope route first; the
/// declared routes follow, a `self` source pinning the assigned address and
/// a missing next hop defaulting to the gateway when one exists.
pub fn plan_routes(env: &WorkerEnv, link_index: u32) -> Result<Vec<RouteSpec>> {
    let assigned = env.assigned()?;
    let gateway = env.gateway()?;
    let mut planned = Vec::new();

    if let Some(gateway) = gateway {
        planned.push(RouteSpec {
            destination: gateway.trunc(),
            gateway: None,
            source: None,
            link_index,
            scope_link: true,
        });
    }

    for route in &env.routes {
        let via = match route.via.as_deref() {
            Some(via) => Some(
                via.parse()
                    .map_err(|e| Error::parsing(format!("route next hop '{via}'"), e))?,
            ),
            None if !route.scope_link => gateway.map(|gw| gw.addr()),
            None => None,
        };
        planned.push(RouteSpec {
            destination: parse_cidr(&route.destination)?,
            gateway: via,
            source: match route.source {
                RouteSource::SelfAddress => Some(assigned.addr()),
                RouteSource::None => None,
            },
            link_index,
            scope_link: route.scope_link,
        });
    }
    Ok(planned)
}

/// Join the macvlan: request it from the manager, bring it up, address it,
/// and install the route program
pub async fn join(env: &WorkerEnv, links: &dyn LinkOps, ns_inode: u64) -> Result<()> {
    let url = format!(
        "http://{}-service.{OPERATOR_NAMESPACE}:{MANAGER_PORT}/macvlan",
        env.network
    );
    let response = reqwest::Client::new()
        .post(&url)
        .json(&MacvlanRequest {
            ns_id: ns_inode as i64,
        })
        .send()
        .await
        .map_err(|e| Error::Request {
            action: "request macvlan from manager".into(),
            source: e,
        })?;
    if !response.status().is_success() {
        return Err(Error::unrecoverable(format!(
            "macvlan request returned {}, check the manager pod on this node",
            response.status()
        )));
    }
    let body: MacvlanResponse = response.json().await.map_err(|e| Error::Request {
        action: "parse macvlan response".into(),
        source: e,
    })?;

    let name = macvlan_link_name(body.vlan_id);
    let index = links
        .link_index(&name)
        .await?
        .ok_or_else(|| Error::unrecoverable(format!("link '{name}' did not arrive in this namespace")))?;
    links.set_link_up(index).await?;
    links.add_address(index, env.assigned()?).await?;

    for route in plan_routes(env, index)? {
        links.add_route(&route).await?;
    }

    info!(network = %env.network, link = %name, ip = %env.macvlan_ip, "worker joined vlan");
    Ok(())
}

/// Entry point of the `worker` subcommand
pub async fn run() -> Result<()> {
    let env = WorkerEnv::from_env()?;
    let target = std::fs::read_link("/proc/self/ns/net")
        .map_err(|e| Error::unrecoverable(format!("reading /proc/self/ns/net: {e}")))?;
    let ns_inode = parse_ns_inode(&target.to_string_lossy())?;

    let links: Arc<dyn LinkOps> = Arc::new(RtnetlinkOps::connect()?);
    join(&env, links.as_ref(), ns_inode).await
}
