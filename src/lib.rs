//! nodeops - Kubernetes operator for Axelar blockchain nodes
//!
//! A `ManagedNode` custom resource describes one full node, validator or
//! archive node. The controller turns it into a ConfigMap with the rendered
//! node configuration, an optional key Secret, data volumes, a Service and a
//! Deployment, then polls the running node and reports sync progress back on
//! the resource status.
//!
//! # Modules
//!
//! - [`crd`] - The ManagedNode resource and its nested types
//! - [`compiler`] - Pure generation of dependent objects from a spec
//! - [`controller`] - Reconcile loop, apply logic and status projection
//! - [`probe`] - HTTP polling of the node's RPC and metrics endpoints
//! - [`events`], [`metrics`], [`telemetry`] - Observability
//! - [`leader`], [`health`] - Running as a highly available pod
//! - [`retry`] - Backoff helpers
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod compiler;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod health;
pub mod leader;
pub mod metrics;
pub mod probe;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
