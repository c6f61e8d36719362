//! HTTP control surface of the manager agent
//!
//! Served on port 61410 inside every manager pod:
//!
//! - `GET /pid` reports the manager's root process id, which the operator
//!   needs to move the VLAN interface into this pod's namespace,
//! - `GET /ready` is 200 once the VLAN interface is up,
//! - `POST /macvlan` creates the per-namespace macvlan for a worker,
//! - `GET /metrics` is the Prometheus exposition.
//!
//! Failed macvlan requests reply 500 with an empty body after tearing down
//! whatever was partially created.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info};

use super::{AgentState, LinkOps, MacvlanRequest, MacvlanResponse, PidResponse};
use crate::{macvlan_link_name, vlan_link_name, Error, Result};

/// Shared state of the request handlers
#[derive(Clone)]
pub struct ServerState {
    agent: Arc<AgentState>,
    links: Arc<dyn LinkOps>,
}

/// Build the agent router
pub fn router(agent: Arc<AgentState>, links: Arc<dyn LinkOps>) -> Router {
    Router::new()
        .route("/pid", get(pid))
        .route("/ready", get(ready))
        .route("/macvlan", post(macvlan))
        .route("/metrics", get(metrics))
        .with_state(ServerState { agent, links })
}

async fn pid() -> Json<PidResponse> {
    let pid = std::process::id() as i64;
    info!(pid, "reporting manager pid");
    Json(PidResponse { pid })
}

async fn ready(State(state): State<ServerState>) -> StatusCode {
    if state.agent.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn metrics(State(state): State<ServerState>) -> String {
    state.agent.metrics.render()
}

async fn macvlan(
    State(state): State<ServerState>,
    Json(request): Json<MacvlanRequest>,
) -> Response {
    match create_macvlan(&state, request.ns_id).await {
        Ok(vlan_id) => (StatusCode::OK, Json(MacvlanResponse { vlan_id })).into_response(),
        Err(e) => {
            error!(ns_id = request.ns_id, error = %e, "macvlan request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Create `macvlan<id>` over `vlan<id>` and move it into the namespace with
/// the given inode. Partially created links are deleted before erroring.
async fn create_macvlan(state: &ServerState, ns_id: i64) -> Result<u16> {
    let vlan_id = state.agent.vlan_id;
    let vlan_name = vlan_link_name(vlan_id);
    let parent = state
        .links
        .link_index(&vlan_name)
        .await?
        .ok_or_else(|| Error::unrecoverable(format!("link '{vlan_name}' does not exist")))?;

    // A macvlan left behind by a crashed worker is stale; replace it.
    let name = macvlan_link_name(vlan_id);
    if let Some(stale) = state.links.link_index(&name).await? {
        info!(link = %name, "deleting stale macvlan");
        state.links.delete_link(stale).await?;
    }

    state.links.create_macvlan_bridge(&name, parent).await?;
    let index = state
        .links
        .link_index(&name)
        .await?
        .ok_or_else(|| Error::unrecoverable(format!("link '{name}' missing after creation")))?;

    let teardown = |e: Error| async move {
        if let Err(cleanup) = state.links.delete_link(index).await {
            error!(link = %macvlan_link_name(vlan_id), error = %cleanup, "macvlan cleanup failed");
        }
        e
    };

    if let Err(e) = state.links.set_link_up(index).await {
        return Err(teardown(e).await);
    }
    let pid = match state.links.pid_of_net_namespace(ns_id as u64).await {
        Ok(pid) => pid,
        Err(e) => return Err(teardown(e).await),
    };
    if let Err(e) = state.links.move_to_netns_pid(index, pid).await {
        return Err(teardown(e).await);
    }

    info!(link = %name, pid, "macvlan moved into worker namespace");
    Ok(vlan_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::netlink::MockLinkOps;
    use crate::agent::Metrics;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn agent(ready: bool) -> Arc<AgentState> {
        let state = AgentState::new(100, Metrics::new("n1").unwrap());
        if ready {
            state.mark_ready(2);
        }
        Arc::new(state)
    }

    async fn body_of(response: axum::response::Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    fn post_macvlan(ns_id: i64) -> axum::http::Request<axum::body::Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/macvlan")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::to_vec(&MacvlanRequest { ns_id }).unwrap(),
            ))
            .unwrap()
    }

    fn get_request(uri: &str) -> axum::http::Request<axum::body::Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn pid_reports_this_process() {
        let app = router(agent(true), Arc::new(MockLinkOps::new()));
        let response = app.oneshot(get_request("/pid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: PidResponse = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(body.pid, std::process::id() as i64);
    }

    #[tokio::test]
    async fn ready_reflects_the_interface_state() {
        let app = router(agent(false), Arc::new(MockLinkOps::new()));
        let response = app.oneshot(get_request("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let app = router(agent(true), Arc::new(MockLinkOps::new()));
        let response = app.oneshot(get_request("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn macvlan_creates_and_moves_the_link() {
        let mut links = MockLinkOps::new();
        links.expect_link_index().returning(|name| match name {
            "vlan100" => Ok(Some(2)),
            "macvlan100" => Ok(Some(5)),
            _ => Ok(None),
        });
        links
            .expect_delete_link()
            .withf(|&index| index == 5)
            .times(1)
            .returning(|_| Ok(()));
        links
            .expect_create_macvlan_bridge()
            .withf(|name, parent| name == "macvlan100" && *parent == 2)
            .times(1)
            .returning(|_, _| Ok(()));
        links.expect_set_link_up().returning(|_| Ok(()));
        links
            .expect_pid_of_net_namespace()
            .withf(|&inode| inode == 4026532622)
            .returning(|_| Ok(4242));
        links
            .expect_move_to_netns_pid()
            .withf(|_, &pid| pid == 4242)
            .times(1)
            .returning(|_, _| Ok(()));

        let app = router(agent(true), Arc::new(links));
        let response = app.oneshot(post_macvlan(4026532622)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: MacvlanResponse = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(body.vlan_id, 100);
    }

    #[tokio::test]
    async fn failed_macvlan_is_torn_down_and_replies_empty_500() {
        let mut links = MockLinkOps::new();
        links.expect_link_index().returning(|name| match name {
            "vlan100" => Ok(Some(2)),
            "macvlan100" => Ok(Some(7)),
            _ => Ok(None),
        });
        // First delete clears the stale link; second is the teardown.
        links.expect_delete_link().times(2).returning(|_| Ok(()));
        links
            .expect_create_macvlan_bridge()
            .returning(|_, _| Ok(()));
        links
            .expect_set_link_up()
            .returning(|_| Err(Error::netlink("bringing link up", "EPERM")));

        let app = router(agent(true), Arc::new(links));
        let response = app.oneshot(post_macvlan(1)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn macvlan_without_the_vlan_link_fails() {
        let mut links = MockLinkOps::new();
        links.expect_link_index().returning(|_| Ok(None));

        let app = router(agent(true), Arc::new(links));
        let response = app.oneshot(post_macvlan(1)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn metrics_render_the_exposition_text() {
        let state = agent(true);
        state.metrics.leader_changed();
        let app = router(state, Arc::new(MockLinkOps::new()));
        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_of(response).await).unwrap();
        assert!(text.contains("vlanman_leader_change_cnt"));
    }
}
