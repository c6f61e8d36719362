//! Link operations behind a trait seam
//!
//! The coordination core never talks netlink; everything that does (the
//! manager's macvlan endpoint, the gateway callbacks, the worker and
//! interface entry points) goes through [`LinkOps`], so core tests mock this
//! trait and need no netlink at all. The real implementation drives the
//! kernel through rtnetlink and resolves namespace inodes through procfs.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::route::RouteScope;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Bridge-mode value of the macvlan `mode` attribute
const MACVLAN_MODE_BRIDGE: u32 = 4;

/// A route to install on a link
#[derive(Clone, Debug, PartialEq)]
pub struct RouteSpec {
    /// Destination subnet
    pub destination: Ipv4Net,
    /// Next hop, when the route is not directly connected
    pub gateway: Option<Ipv4Addr>,
    /// Pinned source address
    pub source: Option<Ipv4Addr>,
    /// Output link index
    pub link_index: u32,
    /// Install with link scope
    pub scope_link: bool,
}

/// Kernel link and namespace operations used by the node-side roles
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Index of the named link; Ok(None) when it does not exist
    async fn link_index(&self, name: &str) -> Result<Option<u32>>;

    /// Create an 802.1Q VLAN link over the parent
    async fn create_vlan(&self, name: &str, parent: u32, vlan_id: u16) -> Result<()>;

    /// Create a bridge-mode macvlan link over the parent
    async fn create_macvlan_bridge(&self, name: &str, parent: u32) -> Result<()>;

    /// Bring a link up
    async fn set_link_up(&self, index: u32) -> Result<()>;

    /// Delete a link
    async fn delete_link(&self, index: u32) -> Result<()>;

    /// Add an address to a link; an already-present address is fine
    async fn add_address(&self, index: u32, address: Ipv4Net) -> Result<()>;

    /// Remove an address from a link
    async fn remove_address(&self, index: u32, address: Ipv4Net) -> Result<()>;

    /// Install a route; an already-present route is fine
    async fn add_route(&self, route: &RouteSpec) -> Result<()>;

    /// Move a link into the network namespace of the given process
    async fn move_to_netns_pid(&self, index: u32, pid: i32) -> Result<()>;

    /// Index of the link carrying the IPv4 default route
    async fn default_route_link(&self) -> Result<Option<u32>>;

    /// PID of a process whose network namespace has the given inode
    async fn pid_of_net_namespace(&self, inode: u64) -> Result<i32>;
}

/// Real [`LinkOps`] over an rtnetlink connection
pub struct RtnetlinkOps {
    handle: rtnetlink::Handle,
}

impl RtnetlinkOps {
    /// Open a netlink connection, spawning its IO task
    pub fn connect() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| Error::netlink("opening netlink connection", e))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

fn raw_code(error: &rtnetlink::Error) -> i32 {
    match error {
        rtnetlink::Error::NetlinkError(msg) => msg.raw_code(),
        _ => 0,
    }
}

/// ENODEV
fn is_missing(error: &rtnetlink::Error) -> bool {
    raw_code(error) == -19
}

/// EEXIST
fn is_exists(error: &rtnetlink::Error) -> bool {
    raw_code(error) == -17
}

#[async_trait]
impl LinkOps for RtnetlinkOps {
    async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(Error::netlink(format!("looking up link '{name}'"), e)),
        }
    }

    async fn create_vlan(&self, name: &str, parent: u32, vlan_id: u16) -> Result<()> {
        self.handle
            .link()
            .add()
            .vlan(name.to_string(), parent, vlan_id)
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("creating vlan link '{name}'"), e))
    }

    async fn create_macvlan_bridge(&self, name: &str, parent: u32) -> Result<()> {
        self.handle
            .link()
            .add()
            .macvlan(name.to_string(), parent, MACVLAN_MODE_BRIDGE)
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("creating macvlan link '{name}'"), e))
    }

    async fn set_link_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("bringing link {index} up"), e))
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("deleting link {index}"), e))
    }

    async fn add_address(&self, index: u32, address: Ipv4Net) -> Result<()> {
        match self
            .handle
            .address()
            .add(index, address.addr().into(), address.prefix_len())
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_exists(&e) => Ok(()),
            Err(e) => Err(Error::netlink(
                format!("adding address {address} to link {index}"),
                e,
            )),
        }
    }

    async fn remove_address(&self, index: u32, address: Ipv4Net) -> Result<()> {
        use netlink_packet_route::address::AddressAttribute;

        let mut addresses = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = addresses
            .try_next()
            .await
            .map_err(|e| Error::netlink(format!("listing addresses of link {index}"), e))?
        {
            let matches = msg.attributes.iter().any(|attr| {
                matches!(attr, AddressAttribute::Address(ip) if *ip == std::net::IpAddr::V4(address.addr()))
            });
            if matches {
                self.handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| {
                        Error::netlink(format!("removing address {address} from link {index}"), e)
                    })?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn add_route(&self, route: &RouteSpec) -> Result<()> {
        let mut request = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(route.destination.addr(), route.destination.prefix_len())
            .output_interface(route.link_index);
        if let Some(gateway) = route.gateway {
            request = request.gateway(gateway);
        }
        if let Some(source) = route.source {
            request = request.pref_source(source);
        }
        if route.scope_link {
            request = request.scope(RouteScope::Link);
        }
        match request.execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_exists(&e) => Ok(()),
            Err(e) => Err(Error::netlink(
                format!("installing route to {}", route.destination),
                e,
            )),
        }
    }

    async fn move_to_netns_pid(&self, index: u32, pid: i32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .setns_by_pid(pid as u32)
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("moving link {index} into netns of {pid}"), e))
    }

    async fn default_route_link(&self) -> Result<Option<u32>> {
        use netlink_packet_route::route::RouteAttribute;

        let mut routes = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        while let Some(msg) = routes
            .try_next()
            .await
            .map_err(|e| Error::netlink("listing routes", e))?
        {
            if msg.header.destination_prefix_length != 0 {
                continue;
            }
            for attr in &msg.attributes {
                if let RouteAttribute::Oif(index) = attr {
                    return Ok(Some(*index));
                }
            }
        }
        Ok(None)
    }

    async fn pid_of_net_namespace(&self, inode: u64) -> Result<i32> {
        tokio::task::spawn_blocking(move || {
            let processes = procfs::process::all_processes()
                .map_err(|e| Error::netlink("reading the process table", e))?;
            for process in processes.flatten() {
                let Ok(namespaces) = process.namespaces() else {
                    continue;
                };
                let net = namespaces
                    .0
                    .get(std::ffi::OsStr::new("net"))
                    .map(|ns| ns.identifier);
                if net == Some(inode) {
                    return Ok(process.pid());
                }
            }
            Err(Error::unrecoverable(format!(
                "no process owns a network namespace with inode {inode}"
            )))
        })
        .await
        .map_err(|e| Error::unrecoverable(format!("namespace lookup task failed: {e}")))?
    }
}
