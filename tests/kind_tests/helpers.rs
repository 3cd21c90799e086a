//! Shared setup for integration tests

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, CustomResourceExt};

use nodeops::crd::{ManagedNode, ManagedNodeSpec};

/// Connect to the cluster, install the CRD and create `namespace`
pub async fn ensure_test_cluster(namespace: &str) -> anyhow::Result<Client> {
    let client = Client::try_default().await?;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = ManagedNode::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();
    crds.patch(
        &name,
        &PatchParams::apply("nodeops-tests").force(),
        &Patch::Apply(&crd),
    )
    .await?;
    // Give the API server a moment to start serving the new type
    tokio::time::sleep(Duration::from_secs(2)).await;

    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(client)
}

/// Create a ManagedNode, replacing any leftover from an earlier run
pub async fn create_node(
    api: &Api<ManagedNode>,
    name: &str,
    spec: ManagedNodeSpec,
) -> anyhow::Result<ManagedNode> {
    if api.get_opt(name).await?.is_some() {
        force_delete(api, name).await?;
    }
    let node = ManagedNode::new(name, spec);
    Ok(api.create(&PostParams::default(), &node).await?)
}

/// Strip finalizers and delete, for test cleanup
pub async fn force_delete(api: &Api<ManagedNode>, name: &str) -> anyhow::Result<()> {
    let patch = serde_json::json!({ "metadata": { "finalizers": null } });
    let _ = api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await;
    let _ = api.delete(name, &Default::default()).await;
    for _ in 0..20 {
        if api.get_opt(name).await?.is_none() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    anyhow::bail!("ManagedNode {name} was not removed")
}
