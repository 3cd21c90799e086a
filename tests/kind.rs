//! End-to-end tests for the nodeops controller
//!
//! These tests require a Kubernetes cluster reachable through the current
//! kubeconfig (a kind cluster works). They are ignored by default:
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod kind_tests;
