//! Create-or-update of dependent objects
//!
//! Each dependent is read, compared with its desired form and written only
//! when something that matters differs. Writes carry the resourceVersion
//! they were planned against, so a concurrent change fails with a conflict;
//! conflicts are retried a bounded number of times, each attempt starting
//! from a fresh read.
//!
//! | Kind | Policy |
//! |---|---|
//! | ConfigMap | replace data when it differs |
//! | Secret | create only, never rewritten |
//! | PersistentVolumeClaim | create only, size changes are not applied |
//! | Service | replace ports, selector and scrape hints; keep server-assigned fields |
//! | Deployment | replace the spec on drift; image changes may be held |

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use super::client::{Dependent, KubeClient};
use crate::compiler::workload;
use crate::retry::{retry_if, RetryPolicy};
use crate::Error;

/// How a rollout of a new image is gated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Keep the currently running images even when the desired ones differ
    pub hold_image_changes: bool,
}

/// What converging one dependent did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object did not exist and was created
    Created,
    /// The object was replaced
    Updated {
        /// A container image changed as part of the update
        image_changed: bool,
        /// Other drift was written but a new image was kept back
        image_held: bool,
    },
    /// Observed already matched desired
    Unchanged,
    /// Only an image change was pending and it was held back
    UpgradeHeld {
        /// Image still running in the primary container
        running: Option<String>,
    },
}

impl ApplyOutcome {
    /// True when the API server was written to
    pub fn wrote(&self) -> bool {
        matches!(self, Self::Created | Self::Updated { .. })
    }

    /// True when a desired image is waiting for the upgrade strategy, whether
    /// or not other changes went out with this pass
    pub fn image_held(&self) -> bool {
        matches!(
            self,
            Self::UpgradeHeld { .. }
                | Self::Updated {
                    image_held: true,
                    ..
                }
        )
    }
}

enum Plan {
    Keep,
    Hold(Option<String>),
    Replace {
        next: Dependent,
        image_changed: bool,
        image_held: bool,
    },
}

impl Plan {
    fn replace(next: Dependent) -> Self {
        Self::Replace {
            next,
            image_changed: false,
            image_held: false,
        }
    }
}

/// Converge one dependent, retrying on conflict
pub async fn converge(
    client: &dyn KubeClient,
    namespace: &str,
    desired: &Dependent,
    options: ApplyOptions,
) -> Result<ApplyOutcome, Error> {
    let operation = format!("apply {} {}", desired.kind(), desired.name());
    retry_if(
        &RetryPolicy::conflict(),
        &operation,
        Error::is_conflict,
        || converge_once(client, namespace, desired, options),
    )
    .await
}

async fn converge_once(
    client: &dyn KubeClient,
    namespace: &str,
    desired: &Dependent,
    options: ApplyOptions,
) -> Result<ApplyOutcome, Error> {
    let kind = desired.kind();
    let name = desired.name();

    let Some(observed) = client.get(namespace, kind, name).await? else {
        client.create(namespace, desired).await?;
        info!(%kind, %name, "Created");
        return Ok(ApplyOutcome::Created);
    };

    match plan(&observed, desired, options) {
        Plan::Keep => {
            debug!(%kind, %name, "Up to date");
            Ok(ApplyOutcome::Unchanged)
        }
        Plan::Hold(running) => {
            debug!(%kind, %name, ?running, "Image change held");
            Ok(ApplyOutcome::UpgradeHeld { running })
        }
        Plan::Replace {
            next,
            image_changed,
            image_held,
        } => {
            client.replace(namespace, &next).await?;
            info!(%kind, %name, image_changed, image_held, "Updated");
            Ok(ApplyOutcome::Updated {
                image_changed,
                image_held,
            })
        }
    }
}

fn plan(observed: &Dependent, desired: &Dependent, options: ApplyOptions) -> Plan {
    match (observed, desired) {
        (Dependent::ConfigMap(o), Dependent::ConfigMap(d)) => plan_config_map(o, d),
        (Dependent::Service(o), Dependent::Service(d)) => plan_service(o, d),
        (Dependent::Deployment(o), Dependent::Deployment(d)) => plan_deployment(o, d, options),
        // Secrets and claims are created once and then left alone
        _ => Plan::Keep,
    }
}

fn plan_config_map(observed: &ConfigMap, desired: &ConfigMap) -> Plan {
    if observed.data == desired.data && !metadata_drifted(&observed.metadata, &desired.metadata) {
        return Plan::Keep;
    }
    let mut next = observed.clone();
    next.metadata = merged_metadata(&observed.metadata, &desired.metadata);
    next.data = desired.data.clone();
    next.binary_data = None;
    Plan::replace(Dependent::ConfigMap(next))
}

fn port_shape(ports: Option<&Vec<ServicePort>>) -> Vec<(Option<&str>, i32, Option<String>)> {
    ports
        .into_iter()
        .flatten()
        .map(|p| {
            (
                p.name.as_deref(),
                p.port,
                p.target_port.as_ref().map(|t| format!("{t:?}")),
            )
        })
        .collect()
}

fn plan_service(observed: &Service, desired: &Service) -> Plan {
    let observed_spec = observed.spec.clone().unwrap_or_default();
    let desired_spec = desired.spec.clone().unwrap_or_default();

    let unchanged = port_shape(observed_spec.ports.as_ref()) == port_shape(desired_spec.ports.as_ref())
        && observed_spec.selector == desired_spec.selector
        && !metadata_drifted(&observed.metadata, &desired.metadata);
    if unchanged {
        return Plan::Keep;
    }

    // clusterIP and the other server-assigned fields stay as observed
    let mut spec = observed_spec;
    spec.ports = desired_spec.ports;
    spec.selector = desired_spec.selector;

    let mut next = observed.clone();
    next.metadata = merged_metadata(&observed.metadata, &desired.metadata);
    next.spec = Some(spec);
    next.status = None;
    Plan::replace(Dependent::Service(next))
}

/// Replace the desired container images with the ones already running
fn pin_images(desired: &mut Deployment, observed: &Deployment) {
    let running: BTreeMap<String, String> = workload::container_images(observed)
        .into_iter()
        .filter_map(|(name, image)| Some((name.to_string(), image?.to_string())))
        .collect();

    let containers = desired
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .map(|p| p.containers.iter_mut());
    for container in containers.into_iter().flatten() {
        if let Some(image) = running.get(&container.name) {
            container.image = Some(image.clone());
        }
    }
}

fn plan_deployment(observed: &Deployment, desired: &Deployment, options: ApplyOptions) -> Plan {
    let mut target = desired.clone();
    let drift = workload::drift(observed, desired);
    let held = options.hold_image_changes && drift.image;
    if held {
        pin_images(&mut target, observed);
    }

    let remaining = workload::drift(observed, &target);
    let meta_drift = metadata_drifted(&observed.metadata, &target.metadata);

    if !remaining.any() && !meta_drift {
        return if held {
            Plan::Hold(workload::node_image(observed).map(str::to_string))
        } else {
            Plan::Keep
        };
    }

    // Template keys added by other actors survive, like the Deployment's own
    let mut spec = target.spec;
    let observed_template = observed.spec.as_ref().and_then(|s| s.template.metadata.as_ref());
    if let (Some(spec), Some(kept)) = (spec.as_mut(), observed_template) {
        let wanted = spec.template.metadata.take().unwrap_or_default();
        spec.template.metadata = Some(merged_metadata(kept, &wanted));
    }

    let mut next = observed.clone();
    next.metadata = merged_metadata(&observed.metadata, &target.metadata);
    next.spec = spec;
    next.status = None;
    Plan::Replace {
        next: Dependent::Deployment(next),
        image_changed: remaining.image,
        image_held: held,
    }
}

/// Desired labels, annotations and owners missing from `observed`
fn metadata_drifted(observed: &ObjectMeta, desired: &ObjectMeta) -> bool {
    let subset = |want: &Option<BTreeMap<String, String>>, have: &Option<BTreeMap<String, String>>| {
        want.iter()
            .flatten()
            .all(|(k, v)| have.as_ref().and_then(|h| h.get(k)) == Some(v))
    };
    let owned = desired.owner_references.iter().flatten().all(|want| {
        observed
            .owner_references
            .iter()
            .flatten()
            .any(|have| have.uid == want.uid)
    });

    !(subset(&desired.labels, &observed.labels)
        && subset(&desired.annotations, &observed.annotations)
        && owned)
}

/// Observed metadata with the desired labels, annotations and owners layered on
///
/// Keys set by other actors survive; resourceVersion is kept so the write
/// fails on a concurrent change.
fn merged_metadata(observed: &ObjectMeta, desired: &ObjectMeta) -> ObjectMeta {
    let mut meta = observed.clone();
    if let Some(labels) = &desired.labels {
        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
    }
    if let Some(annotations) = &desired.annotations {
        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
    }
    let owners = meta.owner_references.get_or_insert_with(Vec::new);
    for owner in desired.owner_references.iter().flatten() {
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner.clone());
        }
    }
    meta
}
