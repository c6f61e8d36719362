//! Per-node manager agent
//!
//! One agent runs inside every instance of a network's manager DaemonSet.
//! It serves the control endpoint workers and the operator talk to
//! (`/pid`, `/ready`, `/macvlan`, `/metrics` on port 61410), watches for its
//! VLAN interface to appear, and, when the network declares gateways, takes
//! part in the per-network leader election that owns the gateway address.
//!
//! # Modules
//!
//! - [`server`] - the HTTP control surface
//! - [`watcher`] - the /sys/class/net polling loop
//! - [`gateway`] - gateway leader election and callbacks
//! - [`netlink`] - the LinkOps seam over rtnetlink and procfs

pub mod gateway;
pub mod netlink;
pub mod server;
pub mod watcher;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::crd::{Gateway, VlanNetworkPool};
use crate::{Error, Result, MANAGER_PORT};

pub use netlink::{LinkOps, RouteSpec, RtnetlinkOps};

// =============================================================================
// Wire protocol
// =============================================================================

/// Response of `GET /pid`
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct PidResponse {
    /// Root process id of the manager
    pub pid: i64,
}

/// Body of `POST /macvlan`
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct MacvlanRequest {
    /// Inode of the requesting pod's network namespace
    pub ns_id: i64,
}

/// Response of `POST /macvlan`
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct MacvlanResponse {
    /// VLAN id the macvlan was created for
    pub vlan_id: u16,
}

// =============================================================================
// Configuration and state
// =============================================================================

/// Environment contract of the manager container, set by the operator
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Name of the owning network
    pub network: String,
    /// Namespace holding the leader election lease
    pub namespace: String,
    /// Name of the leader election lease
    pub lock_name: String,
    /// VLAN id served by this manager
    pub vlan_id: u16,
    /// Declared pools, for the gateway route program
    pub pools: Vec<VlanNetworkPool>,
    /// Declared gateways; empty disables leader election
    pub gateways: Vec<Gateway>,
}

impl AgentConfig {
    /// Parse the manager environment; missing required values are fatal
    pub fn from_env() -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::unrecoverable(format!("required env variable {name} is not set"))
                })
        };

        let vlan_id: u16 = required("VLAN_ID")?
            .parse()
            .map_err(|e| Error::parsing("VLAN_ID env variable", e))?;
        let pools = match std::env::var("POOLS") {
            Ok(raw) if !raw.is_empty() => {
                serde_json::from_str(&raw).map_err(|e| Error::parsing("POOLS env variable", e))?
            }
            _ => vec![],
        };
        let gateways = match std::env::var("GATEWAYS") {
            Ok(raw) if !raw.is_empty() => serde_json::from_str(&raw)
                .map_err(|e| Error::parsing("GATEWAYS env variable", e))?,
            _ => vec![],
        };

        Ok(Self {
            network: required("OWNER_NETWORK")?,
            namespace: required("NAMESPACE")?,
            lock_name: required("LOCK_NAME")?,
            vlan_id,
            pools,
            gateways,
        })
    }
}

/// Process-local agent state shared between tasks and request handlers
pub struct AgentState {
    /// VLAN id served by this manager
    pub vlan_id: u16,
    /// Set once the VLAN interface was found and brought up
    pub ready: AtomicBool,
    /// Link index of the VLAN interface; 0 until discovered
    pub vlan_index: AtomicU32,
    /// Prometheus metrics of this instance
    pub metrics: Metrics,
}

impl AgentState {
    /// Fresh state for one manager instance
    pub fn new(vlan_id: u16, metrics: Metrics) -> Self {
        Self {
            vlan_id,
            ready: AtomicBool::new(false),
            vlan_index: AtomicU32::new(0),
            metrics,
        }
    }

    /// Mark the VLAN interface as discovered and up
    pub fn mark_ready(&self, link_index: u32) {
        self.vlan_index.store(link_index, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
    }

    /// True once the VLAN interface is up
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Metrics of one manager instance
pub struct Metrics {
    registry: Registry,
    leader_changes: IntCounter,
    seconds_since_leader_change: Gauge,
    bytes_in: GaugeVec,
    bytes_out: GaugeVec,
    packets_in: GaugeVec,
    packets_out: GaugeVec,
    last_change: Mutex<Option<Instant>>,
}

impl Metrics {
    /// Create the metric family for one network's manager
    pub fn new(network: &str) -> Result<Self> {
        let labels = std::collections::HashMap::from([(
            "network".to_string(),
            network.to_string(),
        )]);
        let registry = Registry::new_custom(Some("vlanman".into()), Some(labels))
            .map_err(|e| Error::internal(format!("building metrics registry: {e}")))?;

        let leader_changes = IntCounter::new(
            "leader_change_cnt",
            "Number of times the leader election changed leaders",
        )
        .map_err(|e| Error::internal(format!("building metric: {e}")))?;
        let seconds_since_leader_change = Gauge::new(
            "seconds_since_leader_change",
            "Seconds since the last leader change",
        )
        .map_err(|e| Error::internal(format!("building metric: {e}")))?;
        let iface = |name: &str, help: &str| {
            GaugeVec::new(Opts::new(name, help), &["interface"])
                .map_err(|e| Error::internal(format!("building metric: {e}")))
        };
        let bytes_in = iface("bytes_in", "Bytes received on the interface")?;
        let bytes_out = iface("bytes_out", "Bytes sent on the interface")?;
        let packets_in = iface("packets_in", "Packets received on the interface")?;
        let packets_out = iface("packets_out", "Packets sent on the interface")?;

        for metric in [
            Box::new(leader_changes.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(seconds_since_leader_change.clone()),
            Box::new(bytes_in.clone()),
            Box::new(bytes_out.clone()),
            Box::new(packets_in.clone()),
            Box::new(packets_out.clone()),
        ] {
            registry
                .register(metric)
                .map_err(|e| Error::internal(format!("registering metric: {e}")))?;
        }

        Ok(Self {
            registry,
            leader_changes,
            seconds_since_leader_change,
            bytes_in,
            bytes_out,
            packets_in,
            packets_out,
            last_change: Mutex::new(None),
        })
    }

    /// Record an observed leadership change
    pub fn leader_changed(&self) {
        self.leader_changes.inc();
        *self.last_change.lock().expect("metrics mutex poisoned") = Some(Instant::now());
    }

    /// Render the exposition text, refreshing interface counters from procfs
    pub fn render(&self) -> String {
        if let Some(changed) = *self.last_change.lock().expect("metrics mutex poisoned") {
            self.seconds_since_leader_change
                .set(changed.elapsed().as_secs_f64());
        }

        if let Ok(devices) = procfs::net::dev_status() {
            for (name, status) in devices {
                if !name.starts_with("vlan") && !name.starts_with("macvlan") {
                    continue;
                }
                self.bytes_in
                    .with_label_values(&[&name])
                    .set(status.recv_bytes as f64);
                self.bytes_out
                    .with_label_values(&[&name])
                    .set(status.sent_bytes as f64);
                self.packets_in
                    .with_label_values(&[&name])
                    .set(status.recv_packets as f64);
                self.packets_out
                    .with_label_values(&[&name])
                    .set(status.sent_packets as f64);
            }
        }

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Run the manager agent until the process exits.
///
/// The watcher, gateway election and HTTP server run as parallel tasks; any
/// fatal initialization failure exits with code 1 so the DaemonSet restarts
/// the instance.
pub async fn run(config: AgentConfig) -> Result<()> {
    let links: Arc<dyn LinkOps> = Arc::new(RtnetlinkOps::connect()?);
    let state = Arc::new(AgentState::new(
        config.vlan_id,
        Metrics::new(&config.network)?,
    ));

    let watcher_state = state.clone();
    let watcher_links = links.clone();
    let watcher_config = config.clone();
    tokio::spawn(async move {
        if let Err(e) = watch_and_lead(watcher_config, watcher_state, watcher_links).await {
            error!(error = %e, "fatal error in interface setup");
            std::process::exit(1);
        }
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], MANAGER_PORT));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::unrecoverable(format!("binding manager endpoint: {e}")))?;
    info!(%addr, network = %config.network, "manager endpoint listening");
    axum::serve(listener, server::router(state, links))
        .await
        .map_err(|e| Error::unrecoverable(format!("manager endpoint: {e}")))
}

/// Wait for the VLAN link, mark the agent ready, then run the gateway
/// election when gateways are declared.
async fn watch_and_lead(
    config: AgentConfig,
    state: Arc<AgentState>,
    links: Arc<dyn LinkOps>,
) -> Result<()> {
    let name = watcher::VlanWatcher::new(config.vlan_id)
        .wait_for_link()
        .await?;
    let index = links
        .link_index(&name)
        .await?
        .ok_or_else(|| Error::unrecoverable(format!("link '{name}' vanished after discovery")))?;
    links.set_link_up(index).await?;
    state.mark_ready(index);
    info!(link = %name, index, "vlan interface up, agent ready");

    if config.gateways.is_empty() {
        info!("no gateways declared, skipping leader election");
        return Ok(());
    }
    gateway::run(config, state, links).await
}
