//! Operator environment configuration
//!
//! The operator deployment injects everything the reconciler needs to
//! materialize manager DaemonSets, interface jobs and worker init containers:
//! which images to run, how to pull them, and where the operator lives.

use std::env;

use crate::{Error, Result};

/// Environment-derived configuration of the operator process
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace the operator, managers, services and jobs live in
    pub namespace: String,
    /// Image of the per-node manager container
    pub manager_image: String,
    /// Pull policy of the manager image
    pub manager_pull_policy: String,
    /// Image of the one-shot interface job
    pub interface_image: String,
    /// Pull policy of the interface image
    pub interface_pull_policy: String,
    /// Image of the worker init container injected by admission
    pub worker_image: String,
    /// Pull policy of the worker init image
    pub worker_pull_policy: String,
    /// Service account the manager pods run under
    pub service_account: String,
    /// Seconds a finished interface job lingers before garbage collection
    pub job_ttl_seconds: Option<i32>,
}

impl OperatorConfig {
    /// Read the configuration from the process environment.
    ///
    /// Missing required variables are fatal; the deployment manifest is
    /// expected to set them all.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            namespace: required("NAMESPACE_NAME")?,
            manager_image: required("MANAGER_POD_IMAGE")?,
            manager_pull_policy: pull_policy("MANAGER_PULL_POLICY"),
            interface_image: required("INTERFACE_POD_IMAGE")?,
            interface_pull_policy: pull_policy("INTERFACE_PULL_POLICY"),
            worker_image: required("WORKER_IMAGE")?,
            worker_pull_policy: pull_policy("WORKER_PULL_POLICY"),
            service_account: required("SERVICE_ACCOUNT_NAME")?,
            job_ttl_seconds: env::var("JOB_TTL").ok().and_then(|v| v.parse().ok()),
        })
    }
}

fn required(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::unrecoverable(format!(
            "required environment variable {name} is not set"
        ))),
    }
}

fn pull_policy(name: &str) -> String {
    match env::var(name).as_deref() {
        Ok("Always") => "Always".to_string(),
        Ok("Never") => "Never".to_string(),
        _ => "IfNotPresent".to_string(),
    }
}

#[cfg(test)]
impl OperatorConfig {
    /// Fixed configuration for tests
    pub fn for_tests() -> Self {
        Self {
            namespace: "vlanman-system".into(),
            manager_image: "vlanman/manager:test".into(),
            manager_pull_policy: "IfNotPresent".into(),
            interface_image: "vlanman/interface:test".into(),
            interface_pull_policy: "IfNotPresent".into(),
            worker_image: "vlanman/worker:test".into(),
            worker_pull_policy: "IfNotPresent".into(),
            service_account: "vlanman-manager".into(),
            job_ttl_seconds: Some(60),
        }
    }
}
