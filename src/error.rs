//! Error types for the vlanman operator

use thiserror::Error;

/// Main error type for vlanman operations
///
/// Admission paths turn these into denial messages, so the Display output of
/// the admission-facing variants is user-visible text.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Malformed request body, env value, JSON document, CIDR, or integer
    #[error("error parsing {what}: {reason}")]
    Parsing {
        /// What was being parsed
        what: String,
        /// Why parsing failed
        reason: String,
    },

    /// An HTTP call to a manager pod failed
    #[error("error requesting {action} from manager: {source}")]
    Request {
        /// The call being made
        action: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// A pod carries only one of the two required annotations
    #[error("At least one of the required annotations is missing on resource: {resource}")]
    MissingAnnotation {
        /// `name@namespace` of the offending pod
        resource: String,
    },

    /// The referenced pool has no unassigned address left
    #[error("No free IP addresses found in pool {pool} for network {network} (requested by {resource})")]
    NoIpInPool {
        /// `name@namespace` of the requesting pod
        resource: String,
        /// Pool that was scanned
        pool: String,
        /// Network owning the pool
        network: String,
    },

    /// The referenced network has no manager pods yet
    #[error("Pod {resource} belongs to a network ({network}) with no existing manager pods (check controller logs)")]
    NoManagerPods {
        /// `name@namespace` of the requesting pod
        resource: String,
        /// Network without managers
        network: String,
    },

    /// A manager pod exists but has not been assigned an IP yet
    #[error("This pod's ({resource}) manager ({manager}) is not ready yet, try again")]
    ManagerNotReady {
        /// `name@namespace` of the requesting pod
        resource: String,
        /// `name@namespace` of the manager pod
        manager: String,
    },

    /// The executor gave up waiting for a DaemonSet to become available
    #[error(
        "Timeout waiting for '{name}' daemonset to become available after {attempts} tries \
         ({ready} Ready, {total} Total). {}",
        cleanup_message(.cleanup_success, .cleanup_error)
    )]
    DaemonSetTimeout {
        /// Network whose DaemonSet timed out
        name: String,
        /// Attempts granted before giving up
        attempts: u32,
        /// Instances that were ready when we gave up
        ready: i32,
        /// Instances desired in total
        total: i32,
        /// Whether the cleanup delete succeeded
        cleanup_success: bool,
        /// Cleanup failure detail when it did not
        cleanup_error: Option<String>,
    },

    /// The executor gave up waiting for a manager pod
    #[error(
        "Timeout waiting for daemon '{name}' to become ready after {attempts} tries. {}",
        cleanup_message(.cleanup_success, .cleanup_error)
    )]
    DaemonPodTimeout {
        /// Pod that never became ready
        name: String,
        /// Attempts granted before giving up
        attempts: u32,
        /// Whether cleanup succeeded
        cleanup_success: bool,
        /// Cleanup failure detail when it did not
        cleanup_error: Option<String>,
    },

    /// Admission received an object of an unexpected kind
    #[error("Type mismatch in {context}, expected {expected} but got: {got}")]
    TypeMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Kind the handler expected
        expected: String,
        /// Kind the request carried
        got: String,
    },

    /// A validation rule rejected the request; Display is the denial reason
    #[error("{0}")]
    Validation(String),

    /// An invariant was violated; surface, log, and requeue
    #[error("Unrecoverable error: {context}")]
    Unrecoverable {
        /// What went wrong
        context: String,
    },

    /// Programmer error, e.g. a selector that fails to compile
    #[error("Internal error, please open an issue with this message. Context: {context}")]
    Internal {
        /// What went wrong
        context: String,
    },

    /// A netlink operation on the node failed
    #[error("netlink error while {context}: {reason}")]
    Netlink {
        /// The operation being performed
        context: String,
        /// Failure detail
        reason: String,
    },

    /// One reconcile pass collected several action failures
    #[error("{} unrecoverable errors encountered: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn cleanup_message(success: &bool, error: &Option<String>) -> String {
    if *success {
        "Cleaned up successfully.".to_string()
    } else {
        format!("Cleanup failed: {}", error.as_deref().unwrap_or("unknown error"))
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(" |+| ")
}

impl Error {
    /// Create a parsing error
    pub fn parsing(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Parsing {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a validation denial with the given reason
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unrecoverable error with the given context
    pub fn unrecoverable(context: impl Into<String>) -> Self {
        Self::Unrecoverable {
            context: context.into(),
        }
    }

    /// Create an internal error with the given context
    pub fn internal(context: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
        }
    }

    /// Create a netlink error
    pub fn netlink(context: impl Into<String>, reason: impl ToString) -> Self {
        Self::Netlink {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// True when this wraps an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// True when this wraps a missing object (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// True when this wraps an already-existing object (HTTP 409 AlreadyExists)
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.reason == "AlreadyExists")
    }
}
