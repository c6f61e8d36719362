//! VLAN interface creation job
//!
//! Runs once per (network, node) as a host-network, host-pid job created by
//! the operator. It builds `vlan<id>` over the node's physical interface
//! (the declared mapping, or the default-route link when none is mapped)
//! and moves it into the manager pod's network namespace, identified by the
//! PID the operator read from the manager's `/pid` endpoint. A link left
//! half-created is deleted before the job fails.

use std::sync::Arc;

use tracing::info;

use crate::agent::{LinkOps, RtnetlinkOps};
use crate::{vlan_link_name, Error, Result};

/// Environment contract of the interface job, set by the operator
#[derive(Clone, Debug)]
pub struct InterfaceEnv {
    /// Root PID of the manager pod on this node
    pub pid: i32,
    /// VLAN id to create
    pub vlan_id: u16,
    /// Parent interface name; empty means auto-detect
    pub interface: String,
}

impl InterfaceEnv {
    /// Parse the job environment
    pub fn from_env() -> Result<Self> {
        let pid = std::env::var("PID")
            .map_err(|_| Error::unrecoverable("PID env variable is not set"))?
            .parse()
            .map_err(|e| Error::parsing("PID env variable", e))?;
        let vlan_id = std::env::var("ID")
            .map_err(|_| Error::unrecoverable("ID env variable is not set"))?
            .parse()
            .map_err(|e| Error::parsing("ID env variable", e))?;
        Ok(Self {
            pid,
            vlan_id,
            interface: std::env::var("INTERFACE").unwrap_or_default(),
        })
    }
}

/// Create the VLAN link and hand it to the manager's namespace
pub async fn apply(env: &InterfaceEnv, links: &dyn LinkOps) -> Result<()> {
    let parent = if env.interface.is_empty() {
        links
            .default_route_link()
            .await?
            .ok_or_else(|| Error::unrecoverable("default route not found"))?
    } else {
        links
            .link_index(&env.interface)
            .await?
            .ok_or_else(|| {
                Error::unrecoverable(format!("mapped interface '{}' does not exist", env.interface))
            })?
    };

    let name = vlan_link_name(env.vlan_id);
    if let Some(stale) = links.link_index(&name).await? {
        info!(link = %name, "deleting stale vlan link");
        links.delete_link(stale).await?;
    }

    links.create_vlan(&name, parent, env.vlan_id).await?;
    let index = links
        .link_index(&name)
        .await?
        .ok_or_else(|| Error::unrecoverable(format!("link '{name}' missing after creation")))?;

    if let Err(e) = links.set_link_up(index).await {
        let _ = links.delete_link(index).await;
        return Err(e);
    }
    if let Err(e) = links.move_to_netns_pid(index, env.pid).await {
        let _ = links.delete_link(index).await;
        return Err(e);
    }

    info!(link = %name, pid = env.pid, "vlan link moved into manager namespace");
    Ok(())
}

/// Entry point of the `interface` subcommand
pub async fn run() -> Result<()> {
    let env = InterfaceEnv::from_env()?;
    let links: Arc<dyn LinkOps> = Arc::new(RtnetlinkOps::connect()?);
    apply(&env, links.as_ref()).await
}
