//! Node compiler for nodeops
//!
//! Compiles a ManagedNode into the Kubernetes objects that run it. Every
//! generator is a pure function of the spec: the same ManagedNode always
//! compiles to the same objects, so the reconciler can compare desired and
//! observed state field by field.
//!
//! # Output
//!
//! | Object | Name | Generator |
//! |---|---|---|
//! | ConfigMap | `<name>-config` | [`config`] |
//! | Secret | `<name>-secrets` | [`credentials`] |
//! | PersistentVolumeClaim | `<name>-data`, `<name>-shared` | [`storage`] |
//! | Service | `<name>-service` | [`service`] |
//! | Deployment | `<name>` | [`workload`] |

pub mod config;
pub mod credentials;
pub mod quantity;
pub mod service;
pub mod storage;
pub mod workload;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::ManagedNode;
use crate::Error;

/// Value of `app.kubernetes.io/managed-by` on every generated object
pub const MANAGED_BY: &str = "nodeops";

/// Value of `app.kubernetes.io/name` on every generated object
pub const APP_NAME: &str = "managed-node";

/// Label carrying the node kind
pub const KIND_LABEL: &str = "nodeops.dev/kind";

/// Deterministic names of a node's dependent objects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectNames {
    /// Deployment
    pub workload: String,
    /// ConfigMap
    pub config: String,
    /// Operator-generated Secret
    pub secrets: String,
    /// Chain data claim
    pub data: String,
    /// Shared scratch claim
    pub shared: String,
    /// Service
    pub service: String,
}

impl ObjectNames {
    /// Names for the node called `name`
    pub fn for_node(name: &str) -> Self {
        Self {
            workload: name.to_string(),
            config: format!("{name}-config"),
            secrets: format!("{name}-secrets"),
            data: format!("{name}-data"),
            shared: format!("{name}-shared"),
            service: format!("{name}-service"),
        }
    }
}

/// Identity shared by every object generated for one node
#[derive(Clone, Debug)]
pub struct NodeIdentity {
    /// ManagedNode name
    pub name: String,
    /// Namespace of the ManagedNode and all its objects
    pub namespace: String,
    /// Controller owner reference back to the ManagedNode
    pub owner: OwnerReference,
    /// Derived object names
    pub names: ObjectNames,
    /// Labels common to all objects
    pub labels: BTreeMap<String, String>,
}

impl NodeIdentity {
    /// Build the identity of a ManagedNode fetched from the API server
    ///
    /// Fails when the object lacks a namespace or uid, which only happens for
    /// objects that were never persisted.
    pub fn of(node: &ManagedNode) -> Result<Self, Error> {
        let name = node.name_any();
        let namespace = node
            .namespace()
            .ok_or_else(|| Error::internal("compile", format!("ManagedNode {name} has no namespace")))?;
        let owner = node
            .controller_owner_ref(&())
            .ok_or_else(|| Error::internal("compile", format!("ManagedNode {name} has no uid")))?;

        let labels = BTreeMap::from([
            ("app".to_string(), name.clone()),
            ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
            ("app.kubernetes.io/instance".to_string(), name.clone()),
            (
                "app.kubernetes.io/managed-by".to_string(),
                MANAGED_BY.to_string(),
            ),
            (KIND_LABEL.to_string(), node.spec.kind.to_string()),
        ]);

        Ok(Self {
            names: ObjectNames::for_node(&name),
            name,
            namespace,
            owner,
            labels,
        })
    }

    /// Labels used to select the node's pod
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.name.clone())])
    }

    /// Metadata for a dependent object called `object_name`
    pub fn object_meta(&self, object_name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(object_name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels.clone()),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }
}

/// Every object a ManagedNode compiles to, in apply order
#[derive(Clone, Debug)]
pub struct CompiledNode {
    /// Node configuration files and chain ID
    pub config_map: ConfigMap,
    /// Keyring passphrases; `None` when credentials are supplied externally
    pub credentials: Option<Secret>,
    /// Chain data claim
    pub data_claim: PersistentVolumeClaim,
    /// Shared scratch claim
    pub shared_claim: PersistentVolumeClaim,
    /// Network-facing Service
    pub service: Service,
    /// Single-replica Deployment
    pub deployment: Deployment,
}

/// Compiles ManagedNodes into Kubernetes objects
pub struct NodeCompiler;

impl NodeCompiler {
    /// Validate the spec and generate all dependent objects
    pub fn compile(node: &ManagedNode) -> Result<CompiledNode, Error> {
        let identity = NodeIdentity::of(node)?;
        let spec = &node.spec;
        spec.validate(&identity.name)?;

        let config_map = config::generate(spec, &identity)?;
        let credentials = credentials::generate(spec, &identity);
        let (data_claim, shared_claim) = storage::generate(spec, &identity);
        let service = service::generate(spec, &identity);
        let deployment = workload::generate(spec, &identity);

        Ok(CompiledNode {
            config_map,
            credentials,
            data_claim,
            shared_claim,
            service,
            deployment,
        })
    }
}
