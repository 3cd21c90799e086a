//! Stories about the controller driving a ManagedNode through its life
//!
//! Passes are invoked directly with `reconcile_node` so each step can be
//! asserted on without waiting for a running controller.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use kube::api::{Api, DeleteParams};
use kube::{Client, ResourceExt};

use nodeops::controller::{reconcile_node, Context, ReconcileOutcome, NODE_FINALIZER};
use nodeops::crd::{ManagedNode, ManagedNodeSpec, NodeKind, NodePhase};

use super::helpers::{create_node, ensure_test_cluster, force_delete};

const NAMESPACE: &str = "nodeops-lifecycle-test";

fn context(client: &Client) -> Context {
    Context::builder(client.clone())
        .poll_timeout(Duration::from_secs(1))
        .build()
        .expect("context should build")
}

async fn pass(api: &Api<ManagedNode>, ctx: &Context, name: &str) -> ReconcileOutcome {
    let node = api.get(name).await.expect("node should exist");
    reconcile_node(&node, ctx).await.expect("reconcile failed")
}

/// Story: a new validator gets its finalizer, then its full object set
#[tokio::test]
#[ignore = "requires a cluster - run with: cargo test --test kind -- --ignored"]
async fn story_validator_is_materialized() {
    let client = ensure_test_cluster(NAMESPACE)
        .await
        .expect("failed to set up cluster");
    let api: Api<ManagedNode> = Api::namespaced(client.clone(), NAMESPACE);
    let ctx = context(&client);
    let name = "val-kind";

    create_node(
        &api,
        name,
        ManagedNodeSpec {
            kind: NodeKind::Validator,
            ..Default::default()
        },
    )
    .await
    .expect("create failed");

    assert_eq!(pass(&api, &ctx, name).await, ReconcileOutcome::RequeueNow);
    let node = api.get(name).await.expect("get failed");
    assert!(node.finalizers().iter().any(|f| f == NODE_FINALIZER));
    assert_eq!(
        node.status.as_ref().map(|s| s.phase),
        Some(NodePhase::Pending)
    );

    assert!(matches!(
        pass(&api, &ctx, name).await,
        ReconcileOutcome::RequeueAfter(_)
    ));

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), NAMESPACE);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), NAMESPACE);
    let claims: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), NAMESPACE);
    let services: Api<Service> = Api::namespaced(client.clone(), NAMESPACE);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), NAMESPACE);

    assert!(config_maps.get_opt("val-kind-config").await.unwrap().is_some());
    assert!(secrets.get_opt("val-kind-secrets").await.unwrap().is_some());
    assert!(claims.get_opt("val-kind-data").await.unwrap().is_some());
    assert!(claims.get_opt("val-kind-shared").await.unwrap().is_some());
    assert!(services.get_opt("val-kind-service").await.unwrap().is_some());
    let deployment = deployments
        .get("val-kind")
        .await
        .expect("deployment should exist");
    let containers = deployment
        .spec
        .and_then(|s| s.template.spec)
        .map(|p| p.containers.len())
        .unwrap_or_default();
    assert!(containers > 1, "validator should run sidecars");

    // A second converged pass leaves the objects alone
    let before = deployments.get("val-kind").await.unwrap().metadata.generation;
    pass(&api, &ctx, name).await;
    let after = deployments.get("val-kind").await.unwrap().metadata.generation;
    assert_eq!(before, after);

    force_delete(&api, name).await.expect("cleanup failed");
}

/// Story: deleting a node removes everything the controller made
#[tokio::test]
#[ignore = "requires a cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deletion_cleans_up_dependents() {
    let client = ensure_test_cluster(NAMESPACE)
        .await
        .expect("failed to set up cluster");
    let api: Api<ManagedNode> = Api::namespaced(client.clone(), NAMESPACE);
    let ctx = context(&client);
    let name = "obs-kind";

    create_node(&api, name, ManagedNodeSpec::default())
        .await
        .expect("create failed");
    pass(&api, &ctx, name).await;
    pass(&api, &ctx, name).await;

    api.delete(name, &DeleteParams::default())
        .await
        .expect("delete failed");
    assert_eq!(pass(&api, &ctx, name).await, ReconcileOutcome::Done);

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), NAMESPACE);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), NAMESPACE);
    assert!(config_maps.get_opt("obs-kind-config").await.unwrap().is_none());
    assert!(deployments.get_opt("obs-kind").await.unwrap().is_none());

    for _ in 0..20 {
        if api.get_opt(name).await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("ManagedNode should be gone once the finalizer is removed");
}
