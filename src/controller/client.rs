//! Kubernetes access for the node controller
//!
//! The reconciler talks to the API server only through [`KubeClient`], so
//! tests can swap in mocks or an in-memory cluster. Dependent objects travel
//! as the closed [`Dependent`] enum rather than through generic methods,
//! which keeps the trait object-safe and mockable.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::crd::{ManagedNode, ManagedNodeStatus};
use crate::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "nodeops-controller";

/// Kinds of objects a ManagedNode owns
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependentKind {
    /// Node configuration
    ConfigMap,
    /// Keyring passphrases
    Secret,
    /// Data and shared volumes
    PersistentVolumeClaim,
    /// Network-facing endpoints
    Service,
    /// The node pod
    Deployment,
}

impl DependentKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::Service => "Service",
            Self::Deployment => "Deployment",
        }
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dependent object of any owned kind
#[derive(Clone, Debug, PartialEq)]
pub enum Dependent {
    /// ConfigMap
    ConfigMap(ConfigMap),
    /// Secret
    Secret(Secret),
    /// PersistentVolumeClaim
    Claim(PersistentVolumeClaim),
    /// Service
    Service(Service),
    /// Deployment
    Deployment(Deployment),
}

impl Dependent {
    /// Kind of the wrapped object
    pub fn kind(&self) -> DependentKind {
        match self {
            Self::ConfigMap(_) => DependentKind::ConfigMap,
            Self::Secret(_) => DependentKind::Secret,
            Self::Claim(_) => DependentKind::PersistentVolumeClaim,
            Self::Service(_) => DependentKind::Service,
            Self::Deployment(_) => DependentKind::Deployment,
        }
    }

    /// Metadata of the wrapped object
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::ConfigMap(o) => &o.metadata,
            Self::Secret(o) => &o.metadata,
            Self::Claim(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::Deployment(o) => &o.metadata,
        }
    }

    /// Mutable metadata of the wrapped object
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::ConfigMap(o) => &mut o.metadata,
            Self::Secret(o) => &mut o.metadata,
            Self::Claim(o) => &mut o.metadata,
            Self::Service(o) => &mut o.metadata,
            Self::Deployment(o) => &mut o.metadata,
        }
    }

    /// Name of the wrapped object
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }
}

/// Trait abstracting Kubernetes operations for the node controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a dependent object; `None` when it does not exist
    async fn get(
        &self,
        namespace: &str,
        kind: DependentKind,
        name: &str,
    ) -> Result<Option<Dependent>, Error>;

    /// Create a dependent object
    ///
    /// A 409 (already exists) surfaces as [`Error::Conflict`].
    async fn create(&self, namespace: &str, object: &Dependent) -> Result<(), Error>;

    /// Replace a dependent object
    ///
    /// The object must carry the resourceVersion it was read at; a stale
    /// version surfaces as [`Error::Conflict`].
    async fn replace(&self, namespace: &str, object: &Dependent) -> Result<(), Error>;

    /// Delete a dependent object
    ///
    /// Returns false when the object was already gone.
    async fn delete(&self, namespace: &str, kind: DependentKind, name: &str)
        -> Result<bool, Error>;

    /// Add `finalizer` to a ManagedNode unless it is already present
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove `finalizer` from a ManagedNode; a missing node is not an error
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Merge-patch the status subresource of a ManagedNode
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ManagedNodeStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create_one<K>(&self, namespace: &str, object: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + fmt::Debug,
    {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api::<K>(namespace)
            .create(&params, object)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_write(K::kind(&()).as_ref(), &object.name_any(), e))
    }

    async fn replace_one<K>(&self, namespace: &str, object: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + fmt::Debug,
    {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let name = object.name_any();
        self.api::<K>(namespace)
            .replace(&name, &params, object)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_write(K::kind(&()).as_ref(), &name, e))
    }

    async fn delete_one<K>(&self, namespace: &str, name: &str) -> Result<bool, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut Vec<String>) -> bool,
    ) -> Result<(), Error> {
        let api: Api<ManagedNode> = self.api(namespace);
        let Some(node) = api.get_opt(name).await? else {
            debug!(node = %name, "ManagedNode gone, no finalizer to change");
            return Ok(());
        };

        let mut finalizers = node.finalizers().to_vec();
        if !edit(&mut finalizers) {
            return Ok(());
        }

        // resourceVersion makes the merge patch fail with 409 if the list
        // changed since it was read
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": node.resource_version(),
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_write("ManagedNode", name, e))?;
        Ok(())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get(
        &self,
        namespace: &str,
        kind: DependentKind,
        name: &str,
    ) -> Result<Option<Dependent>, Error> {
        Ok(match kind {
            DependentKind::ConfigMap => self
                .get_opt::<ConfigMap>(namespace, name)
                .await?
                .map(Dependent::ConfigMap),
            DependentKind::Secret => self
                .get_opt::<Secret>(namespace, name)
                .await?
                .map(Dependent::Secret),
            DependentKind::PersistentVolumeClaim => self
                .get_opt::<PersistentVolumeClaim>(namespace, name)
                .await?
                .map(Dependent::Claim),
            DependentKind::Service => self
                .get_opt::<Service>(namespace, name)
                .await?
                .map(Dependent::Service),
            DependentKind::Deployment => self
                .get_opt::<Deployment>(namespace, name)
                .await?
                .map(Dependent::Deployment),
        })
    }

    async fn create(&self, namespace: &str, object: &Dependent) -> Result<(), Error> {
        match object {
            Dependent::ConfigMap(o) => self.create_one(namespace, o).await,
            Dependent::Secret(o) => self.create_one(namespace, o).await,
            Dependent::Claim(o) => self.create_one(namespace, o).await,
            Dependent::Service(o) => self.create_one(namespace, o).await,
            Dependent::Deployment(o) => self.create_one(namespace, o).await,
        }
    }

    async fn replace(&self, namespace: &str, object: &Dependent) -> Result<(), Error> {
        match object {
            Dependent::ConfigMap(o) => self.replace_one(namespace, o).await,
            Dependent::Secret(o) => self.replace_one(namespace, o).await,
            Dependent::Claim(o) => self.replace_one(namespace, o).await,
            Dependent::Service(o) => self.replace_one(namespace, o).await,
            Dependent::Deployment(o) => self.replace_one(namespace, o).await,
        }
    }

    async fn delete(
        &self,
        namespace: &str,
        kind: DependentKind,
        name: &str,
    ) -> Result<bool, Error> {
        match kind {
            DependentKind::ConfigMap => self.delete_one::<ConfigMap>(namespace, name).await,
            DependentKind::Secret => self.delete_one::<Secret>(namespace, name).await,
            DependentKind::PersistentVolumeClaim => {
                self.delete_one::<PersistentVolumeClaim>(namespace, name)
                    .await
            }
            DependentKind::Service => self.delete_one::<Service>(namespace, name).await,
            DependentKind::Deployment => self.delete_one::<Deployment>(namespace, name).await,
        }
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.patch_finalizers(namespace, name, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                return false;
            }
            finalizers.push(finalizer.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.patch_finalizers(namespace, name, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ManagedNodeStatus,
    ) -> Result<(), Error> {
        let api: Api<ManagedNode> = self.api(namespace);

        let status_patch = serde_json::json!({
            "status": status
        });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }
}
