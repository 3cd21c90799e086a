//! Credentials generator
//!
//! Produces the node's keyring passphrases. Placeholders are generated only
//! when the operator owns the credentials; with an external secret provider
//! the Secret is expected to exist already and nothing is generated.
//! The reconciler creates this Secret once and never rewrites it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;

use super::{NodeIdentity, ObjectNames};
use crate::crd::ManagedNodeSpec;

/// Secret key holding the keyring passphrase
pub const KEYRING_PASSWORD_KEY: &str = "keyring-password";

/// Secret key holding the threshold-signer passphrase
pub const SIGNER_PASSWORD_KEY: &str = "signer-password";

const KEYRING_PLACEHOLDER: &str = "change-me-keyring-password";
const SIGNER_PLACEHOLDER: &str = "change-me-signer-password";

/// Name of the Secret the node's containers read passphrases from
pub fn secret_name(spec: &ManagedNodeSpec, names: &ObjectNames) -> String {
    let secrets = &spec.security.secret_management;
    match (&secrets.secret_name, secrets.provider.is_external()) {
        (Some(name), true) => name.clone(),
        _ => names.secrets.clone(),
    }
}

/// Keys the node's containers read from its Secret
pub fn required_keys(spec: &ManagedNodeSpec) -> Vec<&'static str> {
    let mut keys = vec![KEYRING_PASSWORD_KEY];
    if spec.runs_signing_sidecars() {
        keys.push(SIGNER_PASSWORD_KEY);
    }
    keys
}

/// Required keys present in neither `data` nor `stringData` of `secret`
pub fn missing_keys(spec: &ManagedNodeSpec, secret: &Secret) -> Vec<&'static str> {
    let has = |key: &str| {
        secret.data.as_ref().is_some_and(|d| d.contains_key(key))
            || secret.string_data.as_ref().is_some_and(|d| d.contains_key(key))
    };
    required_keys(spec).into_iter().filter(|key| !has(key)).collect()
}

/// Generate the operator-owned credentials Secret, if the operator owns one
pub fn generate(spec: &ManagedNodeSpec, identity: &NodeIdentity) -> Option<Secret> {
    if spec.security.secret_management.provider.is_external() {
        return None;
    }

    let mut data = BTreeMap::from([(
        KEYRING_PASSWORD_KEY.to_string(),
        KEYRING_PLACEHOLDER.to_string(),
    )]);
    if spec.kind.is_validator() {
        data.insert(
            SIGNER_PASSWORD_KEY.to_string(),
            SIGNER_PLACEHOLDER.to_string(),
        );
    }

    Some(Secret {
        metadata: identity.object_meta(&identity.names.secrets),
        type_: Some("Opaque".to_string()),
        string_data: Some(data),
        ..Default::default()
    })
}
