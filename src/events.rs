//! Kubernetes Events emitted for ManagedNodes
//!
//! Every event the controller can raise is a [`NodeEvent`] variant, so the
//! reason, action and severity shown by `kubectl describe mnode` come from one
//! place. Publishing never fails the reconcile: a rejected event is logged and
//! dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::crd::NodePhase;

/// Something worth telling the node's owner about
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// Finalizer attached to a new node
    FinalizerAdded,
    /// The node moved to a new phase
    PhaseChanged {
        /// Phase before this pass
        from: NodePhase,
        /// Phase after this pass
        to: NodePhase,
    },
    /// The spec cannot be compiled
    InvalidSpec(String),
    /// A dependent object could not be written
    ApplyFailed(String),
    /// A new image started rolling out
    UpgradeStarted {
        /// Image being rolled out
        image: String,
    },
    /// An image change waits for the upgrade strategy to allow it
    UpgradeHeld {
        /// Image that is not rolled out yet
        image: String,
    },
    /// Dependents deleted and finalizer released
    CleanupComplete,
    /// Deleting dependents failed; the finalizer stays
    CleanupFailed(String),
}

impl NodeEvent {
    /// REASON column of `kubectl get events`
    pub fn reason(&self) -> &'static str {
        match self {
            Self::FinalizerAdded => "FinalizerAdded",
            Self::PhaseChanged { .. } => "PhaseChanged",
            Self::InvalidSpec(_) => "InvalidSpec",
            Self::ApplyFailed(_) => "ApplyFailed",
            Self::UpgradeStarted { .. } => "UpgradeStarted",
            Self::UpgradeHeld { .. } => "UpgradeHeld",
            Self::CleanupComplete => "CleanupComplete",
            Self::CleanupFailed(_) => "CleanupFailed",
        }
    }

    /// What the controller was doing
    pub fn action(&self) -> &'static str {
        match self {
            Self::FinalizerAdded | Self::PhaseChanged { .. } | Self::InvalidSpec(_) => "Reconcile",
            Self::ApplyFailed(_) => "Apply",
            Self::UpgradeStarted { .. } | Self::UpgradeHeld { .. } => "Upgrade",
            Self::CleanupComplete | Self::CleanupFailed(_) => "Delete",
        }
    }

    /// Failures are warnings, everything else is normal
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::InvalidSpec(_) | Self::ApplyFailed(_) | Self::CleanupFailed(_)
        )
    }

    /// Human-readable message
    pub fn note(&self) -> Option<String> {
        match self {
            Self::FinalizerAdded | Self::CleanupComplete => None,
            Self::PhaseChanged { from, to } => Some(format!("{from} -> {to}")),
            Self::InvalidSpec(msg) | Self::ApplyFailed(msg) | Self::CleanupFailed(msg) => {
                Some(msg.clone())
            }
            Self::UpgradeStarted { image } => Some(format!("rolling out {image}")),
            Self::UpgradeHeld { image } => Some(format!(
                "{image} waits for the upgrade strategy to allow a rollout"
            )),
        }
    }
}

/// Sink for [`NodeEvent`]s
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Attach `event` to the node behind `node_ref`
    async fn publish(&self, node_ref: &ObjectReference, event: NodeEvent);
}

/// Publishes through the Events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as instance when known
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, node_ref: &ObjectReference, event: NodeEvent) {
        let reason = event.reason();
        let kube_event = Event {
            type_: if event.is_warning() {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: reason.to_string(),
            note: event.note(),
            action: event.action().to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&kube_event, node_ref).await {
            warn!(reason, error = %e, "Failed to publish event");
        }
    }
}

/// Drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _node_ref: &ObjectReference, _event: NodeEvent) {}
}
