//! Stories about ManagedNode objects as stored by the API server

use kube::api::{Api, Patch, PatchParams};

use nodeops::crd::{ManagedNode, ManagedNodeSpec, Network, NodeKind};

use super::helpers::{create_node, ensure_test_cluster, force_delete};

const NAMESPACE: &str = "nodeops-crd-test";

/// Story: an operator applies a minimal manifest and gets the documented defaults
#[tokio::test]
#[ignore = "requires a cluster - run with: cargo test --test kind -- --ignored"]
async fn story_minimal_manifest_is_defaulted() {
    let client = ensure_test_cluster(NAMESPACE)
        .await
        .expect("failed to set up cluster");
    let api: Api<ManagedNode> = Api::namespaced(client, NAMESPACE);

    let raw = serde_json::json!({
        "apiVersion": "nodeops.dev/v1alpha1",
        "kind": "ManagedNode",
        "metadata": { "name": "observer-min" },
        "spec": { "kind": "observer" }
    });
    let _ = force_delete(&api, "observer-min").await;
    api.patch(
        "observer-min",
        &PatchParams::apply("nodeops-tests"),
        &Patch::Apply(&raw),
    )
    .await
    .expect("apply failed");

    let stored = api.get("observer-min").await.expect("get failed");
    assert_eq!(stored.spec.kind, NodeKind::Observer);
    assert_eq!(stored.spec.network, Network::Testnet);
    assert_eq!(stored.spec.image.repository, "axelarnet/axelar-core");

    force_delete(&api, "observer-min").await.expect("cleanup failed");
}

/// Story: status is a subresource, so spec writers cannot clobber it
#[tokio::test]
#[ignore = "requires a cluster - run with: cargo test --test kind -- --ignored"]
async fn story_status_is_a_subresource() {
    let client = ensure_test_cluster(NAMESPACE)
        .await
        .expect("failed to set up cluster");
    let api: Api<ManagedNode> = Api::namespaced(client, NAMESPACE);

    create_node(
        &api,
        "sentry-status",
        ManagedNodeSpec {
            kind: NodeKind::Sentry,
            ..Default::default()
        },
    )
    .await
    .expect("create failed");

    let patch = serde_json::json!({ "status": { "phase": "Running", "message": "hello" } });
    api.patch_status(
        "sentry-status",
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .expect("status patch failed");

    let spec_patch = serde_json::json!({ "spec": { "moniker": "renamed" } });
    api.patch(
        "sentry-status",
        &PatchParams::default(),
        &Patch::Merge(&spec_patch),
    )
    .await
    .expect("spec patch failed");

    let stored = api.get("sentry-status").await.expect("get failed");
    assert_eq!(stored.spec.moniker, "renamed");
    let status = stored.status.expect("status should survive spec writes");
    assert_eq!(status.message.as_deref(), Some("hello"));

    force_delete(&api, "sentry-status").await.expect("cleanup failed");
}
