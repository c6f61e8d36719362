//! Gateway leader election
//!
//! When a network declares gateways, exactly one manager instance owns the
//! gateway addresses at any time. Each instance competes over a per-network
//! lease (`vlanman-leader-election-<network>`); the winner binds the gateway
//! CIDRs to `macvlangw<id>` and installs the pool and gateway route lists.
//! Losing leadership unbinds the addresses; if that fails the process exits
//! and the DaemonSet restart converges the node.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, error, info, warn};

use super::{AgentConfig, AgentState, LinkOps, RouteSpec};
use crate::crd::{parse_cidr, Route, RouteSource};
use crate::{gateway_link_name, Error, Result};

const LEASE_DURATION: Duration = Duration::from_secs(5);
const RENEW_INTERVAL: Duration = Duration::from_secs(3);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Run the gateway election forever.
///
/// The gateway macvlan is created eagerly so that acquiring leadership only
/// has to bind addresses, never build interfaces.
pub async fn run(
    config: AgentConfig,
    state: Arc<AgentState>,
    links: Arc<dyn LinkOps>,
) -> Result<()> {
    let name = gateway_link_name(config.vlan_id);
    let parent = state.vlan_index.load(std::sync::atomic::Ordering::SeqCst);
    let index = match links.link_index(&name).await? {
        Some(index) => index,
        None => {
            links.create_macvlan_bridge(&name, parent).await?;
            links.link_index(&name).await?.ok_or_else(|| {
                Error::unrecoverable(format!("link '{name}' missing after creation"))
            })?
        }
    };
    links.set_link_up(index).await?;
    info!(link = %name, index, "gateway macvlan ready");

    let client = Client::try_default()
        .await
        .map_err(|e| Error::unrecoverable(format!("building kube client: {e}")))?;
    let identity = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| format!("manager-{}", std::process::id()));
    let mut elector = GatewayElector {
        api: Api::namespaced(client, &config.namespace),
        lease_name: config.lock_name.clone(),
        namespace: config.namespace.clone(),
        identity,
        observed_holder: None,
    };

    loop {
        elector.acquire(&state).await?;
        info!(network = %config.network, "gateway leadership acquired");
        on_started_leading(&config, links.as_ref(), index).await?;

        elector.hold(&state).await;
        warn!(network = %config.network, "gateway leadership lost");
        if let Err(e) = on_stopped_leading(&config, links.as_ref(), index).await {
            // A node that cannot unbind the gateway address would fight the
            // new leader; restarting clears the slate.
            error!(error = %e, "failed to unbind gateway address, exiting");
            std::process::exit(1);
        }
    }
}

/// Bind the gateway addresses and install the route program
async fn on_started_leading(
    config: &AgentConfig,
    links: &dyn LinkOps,
    index: u32,
) -> Result<()> {
    for gateway in &config.gateways {
        links.add_address(index, parse_cidr(&gateway.address)?).await?;
    }
    for route in route_program(config, index)? {
        links.add_route(&route).await?;
    }
    Ok(())
}

/// Unbind the gateway addresses
async fn on_stopped_leading(
    config: &AgentConfig,
    links: &dyn LinkOps,
    index: u32,
) -> Result<()> {
    for gateway in &config.gateways {
        links.remove_address(index, parse_cidr(&gateway.address)?).await?;
    }
    Ok(())
}

/// The routes the leading manager installs: every route of every pool plus
/// every gateway's routes. A `self` source pins the first gateway address.
pub fn route_program(config: &AgentConfig, link_index: u32) -> Result<Vec<RouteSpec>> {
    let self_source = config
        .gateways
        .first()
        .map(|gw| parse_cidr(&gw.address))
        .transpose()?
        .map(|net| net.addr());

    let declared: Vec<&Route> = config
        .pools
        .iter()
        .flat_map(|p| p.routes.iter())
        .chain(config.gateways.iter().flat_map(|g| g.routes.iter()))
        .collect();

    declared
        .into_iter()
        .map(|route| {
            let gateway = route
                .via
                .as_deref()
                .map(|via| {
                    via.parse()
                        .map_err(|e| Error::parsing(format!("route next hop '{via}'"), e))
                })
                .transpose()?;
            Ok(RouteSpec {
                destination: parse_cidr(&route.destination)?,
                gateway,
                source: match route.source {
                    RouteSource::SelfAddress => self_source,
                    RouteSource::None => None,
                },
                link_index,
                scope_link: route.scope_link,
            })
        })
        .collect()
}

/// Minimal lease elector for the gateway, tracking holder changes for the
/// leader-change metrics
struct GatewayElector {
    api: Api<Lease>,
    lease_name: String,
    namespace: String,
    identity: String,
    observed_holder: Option<String>,
}

impl GatewayElector {
    /// Block until this instance holds the lease
    async fn acquire(&mut self, state: &AgentState) -> Result<()> {
        info!(lease = %self.lease_name, identity = %self.identity, "waiting for gateway leadership");
        loop {
            match self.try_acquire(state).await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(lease = %self.lease_name, "lease held by another manager"),
                Err(e) => warn!(lease = %self.lease_name, error = %e, "lease acquisition failed"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renew until leadership is lost
    async fn hold(&mut self, state: &AgentState) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire(state).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(lease = %self.lease_name, error = %e, "lease renewal failed");
                    return;
                }
            }
        }
    }

    /// One acquisition or renewal attempt; observes holder changes
    async fn try_acquire(&mut self, state: &AgentState) -> Result<bool> {
        let now = Utc::now();
        let mut lease = match self.api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return self.create_lease(now, state).await;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = lease.spec.get_or_insert_with(Default::default);
        self.observe_holder(spec.holder_identity.as_deref(), state);

        let held_by_other = spec
            .holder_identity
            .as_deref()
            .is_some_and(|h| h != self.identity);
        let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
            (Some(rt), Some(secs)) => now > rt.0 + chrono::Duration::seconds(secs as i64),
            _ => true,
        };
        if held_by_other && !expired {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0);
        if held_by_other {
            spec.lease_transitions = Some(transitions + 1);
            spec.acquire_time = Some(MicroTime(now));
        }
        spec.holder_identity = Some(self.identity.clone());
        spec.lease_duration_seconds = Some(LEASE_DURATION.as_secs() as i32);
        spec.renew_time = Some(MicroTime(now));

        match self.api.replace(&self.lease_name, &PostParams::default(), &lease).await {
            Ok(_) => {
                let me = self.identity.clone();
                self.observe_holder(Some(&me), state);
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(
        &mut self,
        now: chrono::DateTime<Utc>,
        state: &AgentState,
    ) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                let me = self.identity.clone();
                self.observe_holder(Some(&me), state);
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Bump the change metrics whenever the observed holder flips
    fn observe_holder(&mut self, holder: Option<&str>, state: &AgentState) {
        let Some(holder) = holder else { return };
        if self.observed_holder.as_deref() != Some(holder) {
            if self.observed_holder.is_some() {
                state.metrics.leader_changed();
            }
            self.observed_holder = Some(holder.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::netlink::MockLinkOps;
    use crate::crd::{Gateway, VlanNetworkPool};

    fn config() -> AgentConfig {
        AgentConfig {
            network: "n1".into(),
            namespace: "vlanman-system".into(),
            lock_name: "vlanman-leader-election-n1".into(),
            vlan_id: 100,
            pools: vec![VlanNetworkPool {
                name: "p".into(),
                description: String::new(),
                addresses: vec!["10.0.0.2/24".into()],
                routes: vec![Route {
                    destination: "10.2.0.0/16".into(),
                    via: Some("10.0.1.254".into()),
                    source: RouteSource::SelfAddress,
                    scope_link: false,
                }],
            }],
            gateways: vec![Gateway {
                address: "10.0.1.1/24".into(),
                routes: vec![Route {
                    destination: "10.3.0.0".into(),
                    via: None,
                    source: RouteSource::None,
                    scope_link: true,
                }],
            }],
        }
    }

    #[test]
    fn route_program_combines_pool_and_gateway_routes() {
        let routes = route_program(&config(), 7).unwrap();
        assert_eq!(routes.len(), 2);

        // Pool route: next hop and self source pinned to the gateway address.
        assert_eq!(routes[0].destination, "10.2.0.0/16".parse().unwrap());
        assert_eq!(routes[0].gateway, Some("10.0.1.254".parse().unwrap()));
        assert_eq!(routes[0].source, Some("10.0.1.1".parse().unwrap()));
        assert!(!routes[0].scope_link);

        // Gateway route: bare destination defaults to /32, link scope.
        assert_eq!(routes[1].destination, "10.3.0.0/32".parse().unwrap());
        assert_eq!(routes[1].gateway, None);
        assert_eq!(routes[1].source, None);
        assert!(routes[1].scope_link);
        assert_eq!(routes[1].link_index, 7);
    }

    #[test]
    fn malformed_route_destinations_fail_the_program() {
        let mut config = config();
        config.pools[0].routes[0].destination = "not-a-cidr".into();
        assert!(route_program(&config, 7).is_err());
    }

    #[tokio::test]
    async fn started_leading_binds_addresses_then_routes() {
        let mut links = MockLinkOps::new();
        links
            .expect_add_address()
            .withf(|&index, addr| index == 7 && *addr == "10.0.1.1/24".parse::<ipnet::Ipv4Net>().unwrap())
            .times(1)
            .returning(|_, _| Ok(()));
        links.expect_add_route().times(2).returning(|_| Ok(()));

        on_started_leading(&config(), &links, 7).await.unwrap();
    }

    #[tokio::test]
    async fn stopped_leading_unbinds_the_gateway_address() {
        let mut links = MockLinkOps::new();
        links
            .expect_remove_address()
            .withf(|&index, addr| index == 7 && *addr == "10.0.1.1/24".parse::<ipnet::Ipv4Net>().unwrap())
            .times(1)
            .returning(|_, _| Ok(()));

        on_stopped_leading(&config(), &links, 7).await.unwrap();
    }
}
