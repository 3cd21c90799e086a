//! Storage generator
//!
//! Two ReadWriteOnce claims per node: chain data sized from the spec, and a
//! small fixed-size scratch volume shared by the node and its sidecars for
//! genesis files, peer lists and signer seed material.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::NodeIdentity;
use crate::crd::ManagedNodeSpec;

/// Size of the shared scratch claim, independent of the spec
pub const SHARED_CLAIM_SIZE: &str = "10Gi";

fn claim(
    identity: &NodeIdentity,
    name: &str,
    size: &str,
    storage_class: Option<&str>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: identity.object_meta(name),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class.map(str::to_string),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the data and shared claims, in that order
pub fn generate(
    spec: &ManagedNodeSpec,
    identity: &NodeIdentity,
) -> (PersistentVolumeClaim, PersistentVolumeClaim) {
    let storage_class = spec.storage.storage_class.as_deref();
    (
        claim(identity, &identity.names.data, &spec.storage.size, storage_class),
        claim(identity, &identity.names.shared, SHARED_CLAIM_SIZE, storage_class),
    )
}
