//! Error types for the nodeops operator
//!
//! Errors are structured with fields so that the reconciler can turn them into
//! status conditions and events without re-deriving context. Each variant
//! knows whether retrying can help and which condition reason it maps to.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for nodeops operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error not attributable to a single dependent object
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The ManagedNode spec cannot produce valid dependent objects
    #[error("validation error for {node}: {message}")]
    Validation {
        /// Name of the node with invalid configuration
        node: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.networking.p2p.port")
        field: Option<String>,
    },

    /// A write lost an optimistic-concurrency race (HTTP 409)
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// Name of the object being written
        name: String,
        /// Message returned by the API server
        message: String,
    },

    /// The API server rejected a create or update of a dependent object
    #[error("failed to apply {kind} {name}: {message}")]
    Apply {
        /// Kind of the object being applied
        kind: String,
        /// Name of the object being applied
        name: String,
        /// Description of what failed
        message: String,
    },

    /// The node's own status endpoint could not be read
    #[error("status poll of {endpoint} failed: {message}")]
    Poll {
        /// URL that was polled
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// Deleting dependent objects during finalization failed
    #[error("cleanup of {node} failed: {message}")]
    Cleanup {
        /// Name of the node being finalized
        node: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "render")
        context: String,
    },
}

impl Error {
    /// Create a validation error without node context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            node: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with node context
    pub fn validation_for(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            node: node.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with node context and field path
    pub fn validation_for_field(
        node: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            node: node.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error for the given object
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an apply error for the given object
    pub fn apply(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a status poll error
    pub fn poll(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Poll {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a cleanup error
    pub fn cleanup(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cleanup {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube-rs error raised while writing a dependent object
    ///
    /// 409 responses become [`Error::Conflict`] so callers can retry with a
    /// fresh read; everything else is an [`Error::Apply`].
    pub fn from_write(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 409 => {
                Self::conflict(kind, name, resp.message.clone())
            }
            other => Self::apply(kind, name, other.to_string()),
        }
    }

    /// Returns true if this error is a resource-version conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 409,
            _ => false,
        }
    }

    /// Returns true if retrying the reconcile can succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation { .. } | Self::Serialization { .. } => false,
            Self::Kube { .. }
            | Self::Conflict { .. }
            | Self::Apply { .. }
            | Self::Poll { .. }
            | Self::Cleanup { .. }
            | Self::Internal { .. } => true,
        }
    }

    /// Machine-readable reason used for status conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Kube { .. } => "KubeError",
            Self::Validation { .. } => "InvalidSpec",
            Self::Conflict { .. } => "Conflict",
            Self::Apply { .. } => "ApplyFailed",
            Self::Poll { .. } => "PollFailed",
            Self::Cleanup { .. } => "CleanupFailed",
            Self::Serialization { .. } => "SerializationFailed",
            Self::Internal { .. } => "InternalError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: How failures steer the control loop
    // ==========================================================================

    /// Story: a typo in the spec parks the node until someone fixes it
    ///
    /// Validation errors are permanent, so the reconciler must not hammer the
    /// API server retrying them. The field path points the operator at the fix.
    #[test]
    fn story_invalid_spec_is_permanent() {
        let err = Error::validation_for_field(
            "validator-0",
            "spec.networking.p2p.port",
            "port collides with rpc",
        );

        assert!(!err.is_retryable());
        assert_eq!(err.reason(), "InvalidSpec");
        assert_eq!(
            err.to_string(),
            "validation error for validator-0: port collides with rpc"
        );
        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.networking.p2p.port"))
            }
            _ => panic!("expected validation error"),
        }
    }

    /// Story: two writers race on the same ConfigMap
    ///
    /// The API server answers 409 to the loser. That must be recognizable as a
    /// conflict so the apply layer re-reads and tries again.
    #[test]
    fn story_stale_write_is_a_conflict() {
        let err = Error::from_write("ConfigMap", "node-a-config", api_error(409, "stale"));
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert_eq!(err.reason(), "Conflict");
    }

    /// Story: quota rejection is transient, not a spec problem
    #[test]
    fn story_quota_rejection_is_retryable_apply_failure() {
        let err = Error::from_write(
            "PersistentVolumeClaim",
            "node-a-data",
            api_error(403, "exceeded quota"),
        );
        assert!(!err.is_conflict());
        assert!(err.is_retryable());
        assert_eq!(err.reason(), "ApplyFailed");
        assert!(err.to_string().contains("node-a-data"));
    }

    /// Story: cleanup failures keep the finalizer and keep retrying
    #[test]
    fn story_cleanup_failures_retry_forever() {
        let err = Error::cleanup("node-a", "delete deployment: connection reset");
        assert!(err.is_retryable());
        assert_eq!(err.reason(), "CleanupFailed");
    }

    #[test]
    fn raw_kube_conflict_is_detected() {
        let err: Error = api_error(409, "conflict").into();
        assert!(err.is_conflict());
        assert_eq!(err.reason(), "KubeError");
    }

    #[test]
    fn serde_errors_are_permanent() {
        let parse = serde_json::from_str::<u64>("not-a-number").unwrap_err();
        let err: Error = parse.into();
        assert!(!err.is_retryable());
        assert_eq!(err.reason(), "SerializationFailed");
    }

    #[test]
    fn validation_without_context_uses_unknown() {
        match Error::validation("missing tag") {
            Error::Validation { node, .. } => assert_eq!(node, UNKNOWN_CONTEXT),
            _ => panic!("expected validation error"),
        }
    }
}
