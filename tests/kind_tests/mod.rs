//! Integration tests against a live API server
//!
//! - `crd_operations`: the ManagedNode schema as the API server stores it
//! - `node_lifecycle`: reconcile passes driven by hand against real objects,
//!   from first sight through deletion

mod crd_operations;
mod helpers;
mod node_lifecycle;
