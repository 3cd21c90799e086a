//! Workload generator
//!
//! One Deployment per node, always a single replica with the `Recreate`
//! strategy: the node owns its data volume and consensus identity, and two
//! pods running at once would double-sign or corrupt the store.
//!
//! The container set is decided by [`NodeKind::container_set`]. Validators
//! with signing enabled run three containers:
//!
//! | Container | Image | Volumes |
//! |---|---|---|
//! | `node` | node image | data, shared, config |
//! | `bridge` | node image | data, shared |
//! | `signer` | signer image | shared |

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::credentials::{self, KEYRING_PASSWORD_KEY, SIGNER_PASSWORD_KEY};
use super::quantity::{resource_amounts, ResourceAmounts};
use super::service::{named_ports, scrape_annotations};
use super::NodeIdentity;
use crate::crd::{default_signer_image, ImageSpec, ManagedNodeSpec, NodeKind};

/// Primary container name
pub const NODE_CONTAINER: &str = "node";
/// Cross-chain participation sidecar name
pub const BRIDGE_CONTAINER: &str = "bridge";
/// Threshold-signing sidecar name
pub const SIGNER_CONTAINER: &str = "signer";
/// Internal port the signer listens on
pub const SIGNER_PORT: u16 = 50051;
/// Health path served on the metrics port
pub const HEALTH_PATH: &str = "/health";
/// The only update strategy a node Deployment may use
pub const UPDATE_STRATEGY: &str = "Recreate";

const NODE_HOME: &str = "/home/axelard";
const DATA_MOUNT: &str = "/home/axelard/.axelar";
const SHARED_MOUNT: &str = "/home/axelard/shared";
const CONFIG_MOUNT: &str = "/home/axelard/config";
const SIGNER_MNEMONIC_PATH: &str = "/home/axelard/shared/tofnd.txt";
const SIGNER_STATE_DIR: &str = "/home/axelard/shared/tofnd";

const DATA_VOLUME: &str = "data";
const SHARED_VOLUME: &str = "shared";
const CONFIG_VOLUME: &str = "config";

/// Seconds the bridge waits for the node RPC before starting
const BRIDGE_START_DELAY_SECS: u32 = 60;

const READINESS_INITIAL_DELAY_SECS: i32 = 60;
const READINESS_PERIOD_SECS: i32 = 10;
const LIVENESS_INITIAL_DELAY_SECS: i32 = 120;
const LIVENESS_PERIOD_SECS: i32 = 30;

/// Inputs shared by every container constructor
pub struct ContainerInputs<'a> {
    /// The node spec
    pub spec: &'a ManagedNodeSpec,
    /// Secret holding the passphrases
    pub secret_name: String,
}

impl NodeKind {
    /// Containers a node of this kind runs, primary first
    pub fn container_set(self, inputs: &ContainerInputs<'_>) -> Vec<Container> {
        match self {
            NodeKind::Validator => {
                let mut containers = vec![node_container(inputs)];
                if inputs.spec.runs_signing_sidecars() {
                    containers.push(bridge_container(inputs));
                    containers.push(signer_container(inputs));
                }
                containers
            }
            NodeKind::Sentry | NodeKind::Seed | NodeKind::Observer => {
                vec![node_container(inputs)]
            }
        }
    }
}

fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn env_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

fn mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn container_port(name: &str, port: u16) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: i32::from(port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn health_probe(port: u16, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::Int(i32::from(port)),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

fn image_fields(image: &ImageSpec) -> (Option<String>, Option<String>) {
    (
        Some(image.reference()),
        Some(image.pull_policy.as_str().to_string()),
    )
}

fn node_container(inputs: &ContainerInputs<'_>) -> Container {
    let spec = inputs.spec;
    let (image, image_pull_policy) = image_fields(&spec.image);
    let metrics_port = spec.monitoring.metrics_endpoint.port;

    Container {
        name: NODE_CONTAINER.to_string(),
        image,
        image_pull_policy,
        command: Some(vec!["startNodeProc".to_string()]),
        env: Some(vec![
            env_value("HOME", NODE_HOME),
            env_value("START_REST", spec.networking.api.enabled.to_string()),
            env_value("NODE_MONIKER", spec.moniker.clone()),
            env_value("CHAIN_ID", spec.resolved_chain_id()),
            env_secret("KEYRING_PASSWORD", &inputs.secret_name, KEYRING_PASSWORD_KEY),
        ]),
        ports: Some(
            named_ports(spec)
                .into_iter()
                .map(|(name, port)| container_port(name, port))
                .collect(),
        ),
        resources: spec.resources.clone(),
        volume_mounts: Some(vec![
            mount(DATA_VOLUME, DATA_MOUNT),
            mount(SHARED_VOLUME, SHARED_MOUNT),
            mount(CONFIG_VOLUME, CONFIG_MOUNT),
        ]),
        readiness_probe: Some(health_probe(
            metrics_port,
            READINESS_INITIAL_DELAY_SECS,
            READINESS_PERIOD_SECS,
        )),
        liveness_probe: Some(health_probe(
            metrics_port,
            LIVENESS_INITIAL_DELAY_SECS,
            LIVENESS_PERIOD_SECS,
        )),
        ..Default::default()
    }
}

fn bridge_container(inputs: &ContainerInputs<'_>) -> Container {
    let (image, image_pull_policy) = image_fields(&inputs.spec.image);
    Container {
        name: BRIDGE_CONTAINER.to_string(),
        image,
        image_pull_policy,
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("sleep {BRIDGE_START_DELAY_SECS} && exec vald-start"),
        ]),
        env: Some(vec![
            env_value("HOME", NODE_HOME),
            env_value("CHAIN_ID", inputs.spec.resolved_chain_id()),
            env_secret("KEYRING_PASSWORD", &inputs.secret_name, KEYRING_PASSWORD_KEY),
        ]),
        volume_mounts: Some(vec![
            mount(DATA_VOLUME, DATA_MOUNT),
            mount(SHARED_VOLUME, SHARED_MOUNT),
        ]),
        ..Default::default()
    }
}

fn signer_container(inputs: &ContainerInputs<'_>) -> Container {
    let signer_image = inputs
        .spec
        .validator_settings()
        .and_then(|v| v.signer_image)
        .unwrap_or_else(default_signer_image);
    let (image, image_pull_policy) = image_fields(&signer_image);

    Container {
        name: SIGNER_CONTAINER.to_string(),
        image,
        image_pull_policy,
        command: Some(vec!["tofnd".to_string()]),
        args: Some(vec![
            "-m".to_string(),
            SIGNER_MNEMONIC_PATH.to_string(),
            "-d".to_string(),
            SIGNER_STATE_DIR.to_string(),
        ]),
        env: Some(vec![env_secret(
            "TOFND_PASSWORD",
            &inputs.secret_name,
            SIGNER_PASSWORD_KEY,
        )]),
        ports: Some(vec![container_port(SIGNER_CONTAINER, SIGNER_PORT)]),
        volume_mounts: Some(vec![mount(SHARED_VOLUME, SHARED_MOUNT)]),
        ..Default::default()
    }
}

fn volumes(identity: &NodeIdentity) -> Vec<Volume> {
    let claim = |volume: &str, claim_name: &str| Volume {
        name: volume.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: None,
        }),
        ..Default::default()
    };

    vec![
        claim(DATA_VOLUME, &identity.names.data),
        claim(SHARED_VOLUME, &identity.names.shared),
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: identity.names.config.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

/// Generate the node's Deployment
pub fn generate(spec: &ManagedNodeSpec, identity: &NodeIdentity) -> Deployment {
    let inputs = ContainerInputs {
        spec,
        secret_name: credentials::secret_name(spec, &identity.names),
    };

    Deployment {
        metadata: identity.object_meta(&identity.names.workload),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(identity.selector_labels()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some(UPDATE_STRATEGY.to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(identity.labels.clone()),
                    annotations: Some(scrape_annotations(spec)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: spec.kind.container_set(&inputs),
                    volumes: Some(volumes(identity)),
                    security_context: spec.security.pod_security_context.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Drift detection
// =============================================================================

/// How an observed Deployment differs from the desired one
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadDrift {
    /// Some container runs a different image
    pub image: bool,
    /// Anything else that matters differs: container fields, pod fields or
    /// the labels and annotations stamped on the pod template
    pub other: bool,
}

impl WorkloadDrift {
    /// True when the Deployment must be replaced
    pub fn any(&self) -> bool {
        self.image || self.other
    }
}

/// Fields of a container compared for drift, image excluded
///
/// Only fields the API server does not default are compared, so a freshly
/// applied Deployment never looks drifted. The same goes for probes: the
/// timeout and thresholds are filled in by the server and left out here.
#[derive(PartialEq)]
struct ContainerShape<'a> {
    name: &'a str,
    image_pull_policy: Option<&'a str>,
    command: Option<&'a Vec<String>>,
    args: Option<&'a Vec<String>>,
    env: Option<&'a Vec<EnvVar>>,
    ports: Vec<(Option<&'a str>, i32)>,
    resources: Option<ResourceAmounts<'a>>,
    mounts: Vec<(&'a str, &'a str)>,
    readiness: Option<ProbeShape<'a>>,
    liveness: Option<ProbeShape<'a>>,
}

#[derive(PartialEq)]
struct ProbeShape<'a> {
    path: Option<&'a str>,
    port: Option<&'a IntOrString>,
    initial_delay: Option<i32>,
    period: Option<i32>,
}

fn probe_shape(p: &Probe) -> ProbeShape<'_> {
    let get = p.http_get.as_ref();
    ProbeShape {
        path: get.and_then(|g| g.path.as_deref()),
        port: get.map(|g| &g.port),
        initial_delay: p.initial_delay_seconds,
        period: p.period_seconds,
    }
}

fn shape(c: &Container) -> ContainerShape<'_> {
    ContainerShape {
        name: &c.name,
        image_pull_policy: c.image_pull_policy.as_deref(),
        command: c.command.as_ref(),
        args: c.args.as_ref(),
        env: c.env.as_ref().filter(|e| !e.is_empty()),
        ports: c
            .ports
            .iter()
            .flatten()
            .map(|p| (p.name.as_deref(), p.container_port))
            .collect(),
        resources: resource_amounts(c.resources.as_ref()),
        mounts: c
            .volume_mounts
            .iter()
            .flatten()
            .map(|m| (m.name.as_str(), m.mount_path.as_str()))
            .collect(),
        readiness: c.readiness_probe.as_ref().map(probe_shape),
        liveness: c.liveness_probe.as_ref().map(probe_shape),
    }
}

fn pod_spec(d: &Deployment) -> Option<&PodSpec> {
    d.spec.as_ref().and_then(|s| s.template.spec.as_ref())
}

fn containers(d: &Deployment) -> &[Container] {
    pod_spec(d).map(|p| p.containers.as_slice()).unwrap_or_default()
}

fn volume_names(d: &Deployment) -> Vec<&str> {
    pod_spec(d)
        .and_then(|p| p.volumes.as_ref())
        .map(|v| v.iter().map(|v| v.name.as_str()).collect())
        .unwrap_or_default()
}

/// Pod security context, with the server's empty default counted as unset
fn pod_security(d: &Deployment) -> Option<&PodSecurityContext> {
    pod_spec(d)
        .and_then(|p| p.security_context.as_ref())
        .filter(|sc| **sc != PodSecurityContext::default())
}

fn template_meta(d: &Deployment) -> Option<&ObjectMeta> {
    d.spec.as_ref().and_then(|s| s.template.metadata.as_ref())
}

/// Every desired template label and annotation is present on the observed one
///
/// Extra keys on the observed template (`kubectl rollout restart` stamps one)
/// are not drift.
fn template_meta_matches(observed: &Deployment, desired: &Deployment) -> bool {
    fn contains(
        have: Option<&BTreeMap<String, String>>,
        want: Option<&BTreeMap<String, String>>,
    ) -> bool {
        want.into_iter()
            .flatten()
            .all(|(k, v)| have.and_then(|h| h.get(k)) == Some(v))
    }

    let have = template_meta(observed);
    let want = template_meta(desired);
    contains(
        have.and_then(|m| m.labels.as_ref()),
        want.and_then(|m| m.labels.as_ref()),
    ) && contains(
        have.and_then(|m| m.annotations.as_ref()),
        want.and_then(|m| m.annotations.as_ref()),
    )
}

fn strategy(d: &Deployment) -> Option<&str> {
    d.spec
        .as_ref()
        .and_then(|s| s.strategy.as_ref())
        .and_then(|s| s.type_.as_deref())
}

/// Images by container name, primary first
pub fn container_images(d: &Deployment) -> Vec<(&str, Option<&str>)> {
    containers(d)
        .iter()
        .map(|c| (c.name.as_str(), c.image.as_deref()))
        .collect()
}

/// Image of the primary node container
pub fn node_image(d: &Deployment) -> Option<&str> {
    containers(d)
        .iter()
        .find(|c| c.name == NODE_CONTAINER)
        .and_then(|c| c.image.as_deref())
}

/// Compare an observed Deployment against the desired one
pub fn drift(observed: &Deployment, desired: &Deployment) -> WorkloadDrift {
    let observed_shapes: Vec<_> = containers(observed).iter().map(shape).collect();
    let desired_shapes: Vec<_> = containers(desired).iter().map(shape).collect();
    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);

    WorkloadDrift {
        image: container_images(observed) != container_images(desired),
        other: observed_shapes != desired_shapes
            || volume_names(observed) != volume_names(desired)
            || replicas(observed) != replicas(desired)
            || strategy(observed) != strategy(desired)
            || pod_security(observed) != pod_security(desired)
            || !template_meta_matches(observed, desired),
    }
}
