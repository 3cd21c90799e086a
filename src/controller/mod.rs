//! Controller for ManagedNode resources
//!
//! Controllers follow the Kubernetes controller pattern with observe-diff-act
//! loops: [`node`] drives one reconcile, [`apply`] converges single objects,
//! [`status`] projects status and [`client`] is the API seam. [`runner`]
//! wires the controller and its owned-object watches.

pub mod apply;
pub mod client;
#[cfg(test)]
mod fake;
mod node;
pub mod runner;
pub mod status;

pub use apply::{ApplyOptions, ApplyOutcome};
pub use client::{Dependent, DependentKind, KubeClient, KubeClientImpl, FIELD_MANAGER};
pub use node::{
    cleanup, error_policy, reconcile, reconcile_node, Context, ContextBuilder, ReconcileOutcome,
    CONTROLLER_NAME, DEFAULT_POLL_TIMEOUT, DEFAULT_REQUEUE_INTERVAL, NODE_FINALIZER,
};
pub use runner::{evict_departed, node_controller};
