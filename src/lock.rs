//! Cluster-wide mutex backed by a renewable Lease
//!
//! Every read-modify-write of a VlanNetwork's status, whether from the
//! reconciler or from an admission webhook replica, runs under this lock.
//! The lock is a `coordination.k8s.io/v1` Lease claimed by compare-and-swap
//! on the object's resourceVersion: whoever replaces the holder first wins,
//! everyone else sees a 409 and keeps waiting.
//!
//! Dry-run admission requests must not leave side effects, so a no-op
//! variant with identical signatures stands in for the real lock there.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Error, Result, LOCK_LEASE_TTL};

/// Attempts granted to lease creation when constructors race
const CONSTRUCT_RETRIES: u32 = 3;

/// Interval between holder renewals while the lock is held
const RENEW_INTERVAL: Duration = Duration::from_secs(2);

/// Delay between claim attempts while another holder has the lease
const CONTENTION_DELAY: Duration = Duration::from_millis(100);

/// A mutual-exclusion primitive guarding VlanNetwork status writes
#[async_trait]
pub trait Locker: Send + Sync {
    /// Block until the lock is held by this process
    async fn lock(&self) -> Result<()>;

    /// Release the lock; idempotent within a single acquisition
    async fn unlock(&self);
}

/// No-op locker used for dry-run admission requests
pub struct NoopLock;

#[async_trait]
impl Locker for NoopLock {
    async fn lock(&self) -> Result<()> {
        Ok(())
    }

    async fn unlock(&self) {}
}

/// Real lease-backed lock
///
/// Construction ensures the Lease object exists (retrying creation races
/// with randomized backoff); `lock` claims the holder field, spawning a
/// renewal task that keeps the claim fresh until `unlock`.
pub struct LeaseLock {
    api: Api<Lease>,
    name: String,
    identity: String,
    ttl: Duration,
    renewal: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LeaseLock {
    /// Create the lock, ensuring its Lease object exists
    pub async fn new(
        client: Client,
        namespace: &str,
        name: &str,
        identity: &str,
    ) -> Result<Self> {
        let api: Api<Lease> = Api::namespaced(client, namespace);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match ensure_lease(&api, namespace, name).await {
                Ok(()) => break,
                Err(e) if attempt < CONSTRUCT_RETRIES => {
                    let backoff = rand::thread_rng().gen_range(100..=1000);
                    warn!(
                        lease = name,
                        error = %e,
                        backoff_ms = backoff,
                        "lease creation raced, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            api,
            name: name.to_string(),
            identity: identity.to_string(),
            ttl: LOCK_LEASE_TTL,
            renewal: tokio::sync::Mutex::new(None),
        })
    }

    /// Try once to claim the holder field; Ok(false) means contended
    async fn try_claim(&self) -> Result<bool> {
        let mut lease = self.api.get(&self.name).await?;
        let now = Utc::now();

        let spec = lease.spec.get_or_insert_with(Default::default);
        let holder = spec.holder_identity.as_deref();
        let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
            (Some(rt), Some(secs)) => now > rt.0 + chrono::Duration::seconds(secs as i64),
            _ => true,
        };

        if holder.is_some() && holder != Some(&self.identity) && !expired {
            return Ok(false);
        }

        spec.holder_identity = Some(self.identity.clone());
        spec.lease_duration_seconds = Some(self.ttl.as_secs() as i32);
        spec.acquire_time = Some(MicroTime(now));
        spec.renew_time = Some(MicroTime(now));

        // The replace carries the resourceVersion we read; losing the race
        // surfaces as a 409 and we go back to waiting.
        match self.api.replace(&self.name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

async fn renew_lease(api: &Api<Lease>, name: &str, identity: &str) -> Result<()> {
    let mut lease = api.get(name).await?;
    let spec = lease.spec.get_or_insert_with(Default::default);
    if spec.holder_identity.as_deref() != Some(identity) {
        return Err(Error::unrecoverable(format!(
            "lease '{name}' was taken over while held"
        )));
    }
    spec.renew_time = Some(MicroTime(Utc::now()));
    api.replace(name, &PostParams::default(), &lease).await?;
    Ok(())
}

async fn release_lease(api: &Api<Lease>, name: &str, identity: &str) {
    let mut lease = match api.get(name).await {
        Ok(l) => l,
        Err(e) => {
            warn!(lease = name, error = %e, "failed to fetch lease for release");
            return;
        }
    };
    let spec = lease.spec.get_or_insert_with(Default::default);
    if spec.holder_identity.as_deref() != Some(identity) {
        // Already released, or expired and taken over.
        return;
    }
    spec.holder_identity = None;
    spec.acquire_time = None;
    spec.renew_time = None;
    if let Err(e) = api.replace(name, &PostParams::default(), &lease).await {
        warn!(lease = name, error = %e, "failed to release lease");
    }
}

#[async_trait]
impl Locker for LeaseLock {
    async fn lock(&self) -> Result<()> {
        loop {
            match self.try_claim().await {
                Ok(true) => break,
                Ok(false) => {
                    debug!(lease = %self.name, "lease held by another process, waiting");
                    tokio::time::sleep(CONTENTION_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }

        let api = self.api.clone();
        let name = self.name.clone();
        let identity = self.identity.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEW_INTERVAL).await;
                if let Err(e) = renew_lease(&api, &name, &identity).await {
                    warn!(lease = %name, error = %e, "lease renewal failed");
                    return;
                }
            }
        });
        *self.renewal.lock().await = Some(handle);
        Ok(())
    }

    async fn unlock(&self) {
        if let Some(handle) = self.renewal.lock().await.take() {
            handle.abort();
            release_lease(&self.api, &self.name, &self.identity).await;
        }
        // A second unlock finds no renewal task and does nothing.
    }
}

async fn ensure_lease(api: &Api<Lease>, namespace: &str, name: &str) -> Result<()> {
    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec::default()),
    };
    match api.create(&PostParams::default(), &lease).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_lock_is_free_and_idempotent() {
        let lock = NoopLock;
        lock.lock().await.unwrap();
        lock.unlock().await;
        lock.unlock().await;
    }
}
