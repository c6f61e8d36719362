//! Admission webhooks for vlanman
//!
//! Two synchronous admission handlers run inside the operator process:
//!
//! - the mutating handler (`/mutating`) intercepts pod creation, allocates a
//!   pool address under the cluster-wide lock, and injects the `init-vlan`
//!   container plus routing configuration as a JSON patch,
//! - the validating handler (`/validating`) gates VlanNetwork creation,
//!   update and deletion.
//!
//! Both speak the AdmissionReview v1 envelope over TLS on port 8443, with
//! the certificate pair mounted at `/etc/webhook/certs`.

pub mod mutate;
pub mod validate;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{routing::post, Router};
use tracing::info;

use crate::config::OperatorConfig;
use crate::lock::{Locker, NoopLock};
use crate::store::Store;
use crate::{Result, WEBHOOK_CERT_DIR, WEBHOOK_PORT};

/// Shared state for admission handlers
pub struct WebhookState {
    /// Cluster access
    pub store: Arc<dyn Store>,
    /// Real cluster-wide locker used by non-dry-run requests
    pub locker: Arc<dyn Locker>,
    /// Operator environment (worker image, namespace)
    pub config: OperatorConfig,
}

impl WebhookState {
    /// Pick the locker for a request: dry runs must not touch the lease
    pub fn locker_for(&self, dry_run: bool) -> Arc<dyn Locker> {
        if dry_run {
            Arc::new(NoopLock)
        } else {
            self.locker.clone()
        }
    }
}

/// Build the admission router
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutating", post(mutate::handler))
        .route("/validating", post(validate::handler))
        .with_state(state)
}

/// Serve the admission endpoints over TLS until the process exits
pub async fn serve(state: Arc<WebhookState>) -> Result<()> {
    let cert_dir = Path::new(WEBHOOK_CERT_DIR);
    let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
        cert_dir.join("tls.crt"),
        cert_dir.join("tls.key"),
    )
    .await
    .map_err(|e| crate::Error::unrecoverable(format!("loading webhook TLS keypair: {e}")))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(%addr, "admission webhook server listening");
    axum_server::bind_rustls(addr, tls)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| crate::Error::unrecoverable(format!("webhook server: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::lock::NoopLock;
    use crate::store::MockStore;
    use axum::http::StatusCode;
    use tower::util::ServiceExt;

    fn state() -> Arc<WebhookState> {
        Arc::new(WebhookState {
            store: Arc::new(MockStore::new()),
            locker: Arc::new(NoopLock),
            config: OperatorConfig::for_tests(),
        })
    }

    #[tokio::test]
    async fn unknown_paths_are_not_served() {
        let app = webhook_router(state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/defaulting")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn dry_run_requests_get_the_noop_locker() {
        let state = state();
        // Both paths hand back a locker with the same interface; the dry-run
        // one must not be the shared lease lock.
        let real = state.locker_for(false);
        let noop = state.locker_for(true);
        assert!(Arc::ptr_eq(&real, &state.locker));
        assert!(!Arc::ptr_eq(&noop, &state.locker));
    }
}
