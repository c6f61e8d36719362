//! IP address management for VlanNetwork pools
//!
//! All IPAM state lives in the VlanNetwork status subresource: `free_ips`
//! holds unassigned addresses per pool, `pending_ips` the addresses handed
//! out by admission but not yet observed on a running pod. This module owns
//! the two operations that touch that state, both strictly serialized by the
//! cluster-wide lease:
//!
//! - [`refresh_all`] rebuilds every network's status from the declared pools
//!   and the observed worker pods, reclaiming pending entries that were
//!   either observed or timed out.
//! - [`allocate`] hands the first free address of a pool to an admission
//!   request and records it as pending.
//!
//! Status is always re-derived from the cluster; there is no in-process
//! cache to invalidate.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use crate::crd::{bare_ip, VlanNetwork};
use crate::lock::Locker;
use crate::store::Store;
use crate::{Error, Result, PENDING_TIMEOUT, UPDATE_STATUS_MAX_RETRIES};

/// Read the assigned address from a worker pod's init container env.
///
/// Admission records the assignment as `MACVLAN_IP` / `MACVLAN_SUBNET` on the
/// injected init container; a pod carrying those is the authoritative sign
/// that the address is in use.
pub fn extract_macvlan_ip(pod: &Pod) -> Option<String> {
    let spec = pod.spec.as_ref()?;
    for container in spec.init_containers.as_deref().unwrap_or_default() {
        let mut ip = None;
        for env in container.env.as_deref().unwrap_or_default() {
            if env.name == "MACVLAN_IP" {
                ip = env.value.clone();
            }
        }
        if let Some(ip) = ip {
            if !ip.is_empty() {
                return Some(ip);
            }
        }
    }
    None
}

/// The set of bare addresses currently observed on the given pods
pub fn observed_ips(pods: &[Pod]) -> BTreeSet<String> {
    pods.iter()
        .filter_map(extract_macvlan_ip)
        .map(|ip| bare_ip(&ip).to_string())
        .collect()
}

/// Rebuild one network's status in place from its declared pools and the
/// observed addresses. Returns the time until the next pending entry would
/// expire, or None when nothing is pending.
///
/// Postconditions every status write preserves:
/// - every key of `free_ips` / `pending_ips` names a declared pool,
/// - free, pending, and observed addresses partition the declared set,
/// - pending entries older than the timeout are gone.
pub fn rebuild_status(
    network: &mut VlanNetwork,
    observed: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let spec_pools = network.spec.pools.clone();
    let status = network.status.get_or_insert_with(Default::default);

    // Drop state for pools that are no longer declared.
    let declared: BTreeSet<&str> = spec_pools.iter().map(|p| p.name.as_str()).collect();
    status.free_ips.retain(|name, _| declared.contains(name.as_str()));
    status.pending_ips.retain(|name, _| declared.contains(name.as_str()));

    for pool in &spec_pools {
        let pending = status.pending_ips.entry(pool.name.clone()).or_default();

        // Reap pending entries: observed on a pod, unparseable, or timed out.
        pending.retain(|ip, stamp| {
            if observed.contains(bare_ip(ip)) {
                debug!(pool = %pool.name, ip = %ip, "pending address observed on a pod");
                return false;
            }
            match DateTime::parse_from_rfc3339(stamp) {
                Ok(ts) => {
                    let deadline = ts.with_timezone(&Utc)
                        + chrono::Duration::from_std(PENDING_TIMEOUT).unwrap_or_default();
                    if now > deadline {
                        info!(pool = %pool.name, ip = %ip, "pending address timed out, reclaiming");
                        false
                    } else {
                        true
                    }
                }
                Err(e) => {
                    warn!(pool = %pool.name, ip = %ip, error = %e, "dropping unparseable pending stamp");
                    false
                }
            }
        });

        // Free = declared minus pending minus observed, in declared order.
        let pending_keys: BTreeSet<String> = pending.keys().cloned().collect();
        let free = pool
            .addresses
            .iter()
            .filter(|addr| {
                let bare = bare_ip(addr);
                !pending_keys.contains(bare) && !observed.contains(bare)
            })
            .cloned()
            .collect();
        status.free_ips.insert(pool.name.clone(), free);
    }

    // Wake up when the oldest pending entry would expire.
    status
        .pending_ips
        .values()
        .flat_map(|m| m.values())
        .filter_map(|stamp| DateTime::parse_from_rfc3339(stamp).ok())
        .map(|ts| {
            let deadline = ts.with_timezone(&Utc)
                + chrono::Duration::from_std(PENDING_TIMEOUT).unwrap_or_default();
            (deadline - now).to_std().unwrap_or(Duration::ZERO)
        })
        .min()
}

/// Refresh the status of every declared network under the cluster-wide lock.
///
/// Returns the shortest time until a pending entry somewhere would expire,
/// which the reconciler uses as its next wake-up.
pub async fn refresh_all(store: &dyn Store, locker: &dyn Locker) -> Result<Option<Duration>> {
    locker.lock().await?;
    let result = refresh_all_locked(store).await;
    locker.unlock().await;
    result
}

async fn refresh_all_locked(store: &dyn Store) -> Result<Option<Duration>> {
    let networks = store.list_networks().await?;
    let mut requeue: Option<Duration> = None;

    for network in networks {
        let name = network.metadata.name.clone().unwrap_or_default();

        let mut current = network;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let pods = store.list_worker_pods(&name).await?;
            let observed = observed_ips(&pods);
            let rq = rebuild_status(&mut current, &observed, Utc::now());

            match store.update_network_status(&current).await {
                Ok(_) => {
                    requeue = match (requeue, rq) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    break;
                }
                Err(e) if e.is_conflict() && attempt <= UPDATE_STATUS_MAX_RETRIES => {
                    debug!(
                        network = %name,
                        tries = format!("{attempt}/{UPDATE_STATUS_MAX_RETRIES}"),
                        "status update conflicted, refetching"
                    );
                    current = store.get_network(&name).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(requeue)
}

/// Allocate the first free address of `pool` on `network_name` and record it
/// as pending. Runs under the cluster-wide lock; `resource` identifies the
/// requesting pod in errors.
///
/// Allocation strictly follows declared address order, so concurrent
/// admissions serialized by the lock receive distinct, deterministic
/// addresses. With `dry_run` the scan happens but nothing is persisted;
/// callers pass the no-op locker alongside it.
pub async fn allocate(
    store: &dyn Store,
    locker: &dyn Locker,
    resource: &str,
    network_name: &str,
    pool_name: &str,
    dry_run: bool,
) -> Result<String> {
    locker.lock().await?;
    let result = allocate_locked(store, resource, network_name, pool_name, dry_run).await;
    locker.unlock().await;
    result
}

async fn allocate_locked(
    store: &dyn Store,
    resource: &str,
    network_name: &str,
    pool_name: &str,
    dry_run: bool,
) -> Result<String> {
    let mut network = store.get_network(network_name).await?;
    let status = network.status.get_or_insert_with(Default::default);

    let pending = status.pending_ips.entry(pool_name.to_string()).or_default();
    let free = status.free_ips.entry(pool_name.to_string()).or_default();

    let chosen_at = free.iter().position(|addr| !pending.contains_key(bare_ip(addr)));
    let Some(idx) = chosen_at else {
        return Err(Error::NoIpInPool {
            resource: resource.to_string(),
            pool: pool_name.to_string(),
            network: network_name.to_string(),
        });
    };

    let address = free.remove(idx);
    pending.insert(bare_ip(&address).to_string(), Utc::now().to_rfc3339());

    if !dry_run {
        store.update_network_status(&network).await?;
    }
    info!(
        network = network_name,
        pool = pool_name,
        ip = %address,
        pod = resource,
        "allocated address"
    );
    Ok(address)
}
