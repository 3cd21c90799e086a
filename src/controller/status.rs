//! Status projection
//!
//! Folds what the cluster and the node report into the next
//! [`ManagedNodeStatus`]. Everything here is a pure function of its inputs;
//! the reconciler gathers the observations and decides whether to write.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;

use crate::compiler::workload;
use crate::crd::{
    Condition, ConditionStatus, ManagedNodeSpec, ManagedNodeStatus, NetworkInfo, NodePhase,
    SyncInfo, ValidatorInfo,
};
use crate::probe::NodeObservation;

/// Overall readiness, also carries apply and validation failures
pub const READY_CONDITION: &str = "Ready";
/// An image change is waiting under the manual upgrade strategy
pub const UPGRADE_PENDING_CONDITION: &str = "UpgradePending";
/// The node's status endpoint answered the last poll
pub const REACHABLE_CONDITION: &str = "NodeReachable";

/// Replica counts and rollout state of the node's Deployment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadObservation {
    /// Pods the Deployment currently has
    pub replicas: i32,
    /// Pods passing readiness
    pub ready_replicas: i32,
    /// The current template is fully rolled out and ready
    pub rollout_complete: bool,
    /// Image of the primary container in the current template
    pub image: Option<String>,
}

impl WorkloadObservation {
    /// Read counts from a Deployment as returned by the API server
    pub fn from_deployment(deployment: &Deployment) -> Self {
        let wanted = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let status = deployment.status.clone().unwrap_or_default();
        let replicas = status.replicas.unwrap_or(0);
        let ready = status.ready_replicas.unwrap_or(0);
        let updated = status.updated_replicas.unwrap_or(0);
        let generation_seen = status.observed_generation.unwrap_or(0)
            >= deployment.metadata.generation.unwrap_or(0);

        Self {
            replicas,
            ready_replicas: ready,
            rollout_complete: generation_seen
                && updated >= wanted
                && ready >= wanted
                && replicas <= wanted,
            image: workload::node_image(deployment).map(str::to_string),
        }
    }
}

/// Outcome of asking the node for its own status
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollResult {
    /// Nothing to poll (RPC disabled)
    Skipped,
    /// Poll failed or timed out
    Failed(String),
    /// Poll succeeded
    Observed(NodeObservation),
}

/// Everything the projector needs beyond the previous status
#[derive(Clone, Debug)]
pub struct Observations<'a> {
    /// Desired state
    pub spec: &'a ManagedNodeSpec,
    /// `metadata.generation` of the ManagedNode
    pub generation: Option<i64>,
    /// Deployment state after convergence
    pub workload: &'a WorkloadObservation,
    /// Node poll
    pub poll: &'a PollResult,
    /// Desired image whose rollout is being held, if any
    pub held_image: Option<&'a str>,
    /// Current time
    pub now: DateTime<Utc>,
}

/// True when the previous pass recorded a different rolled-out image
fn image_changed(previous: &ManagedNodeStatus, workload: &WorkloadObservation) -> bool {
    previous.image.is_some() && workload.image.is_some() && previous.image != workload.image
}

/// Phase from replica counts, refined by upgrade tracking
pub fn derive_phase(
    previous: NodePhase,
    workload: &WorkloadObservation,
    image_changed: bool,
) -> NodePhase {
    let was_serving = matches!(previous, NodePhase::Running | NodePhase::Upgrading);
    let upgrading = image_changed || previous == NodePhase::Upgrading;
    if was_serving && upgrading && !workload.rollout_complete {
        return NodePhase::Upgrading;
    }

    match (workload.replicas, workload.ready_replicas) {
        (_, ready) if ready > 0 => NodePhase::Running,
        (replicas, _) if replicas > 0 => NodePhase::Syncing,
        _ => NodePhase::Initializing,
    }
}

fn merge_sync(previous: Option<&SyncInfo>, observed: &NodeObservation, now: DateTime<Utc>) -> SyncInfo {
    let mut sync = previous.cloned().unwrap_or_default();
    if previous.is_none() || observed.height != sync.current_height {
        sync.last_sync_time = Some(now);
    }
    sync.current_height = observed.height;
    sync.latest_height = sync.latest_height.max(observed.height);
    sync.catching_up = observed.catching_up;
    sync
}

fn merge_validator(previous: Option<&ValidatorInfo>, observed: &NodeObservation) -> Option<ValidatorInfo> {
    let Some(v) = observed.validator.as_ref() else {
        return previous.cloned();
    };
    let prior = previous.cloned().unwrap_or_default();
    Some(ValidatorInfo {
        address: v.address.clone(),
        voting_power: v.voting_power,
        missed_blocks: v.missed_blocks.unwrap_or(prior.missed_blocks),
        last_signed_height: v.last_signed_height.unwrap_or(prior.last_signed_height),
    })
}

fn ready_condition(phase: NodePhase) -> Condition {
    match phase {
        NodePhase::Running => Condition::new(
            READY_CONDITION,
            ConditionStatus::True,
            "NodeRunning",
            "node has a ready replica",
        ),
        NodePhase::Upgrading => Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            "Upgrading",
            "new image is rolling out",
        ),
        NodePhase::Syncing => Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            "Syncing",
            "node pod is running but not ready",
        ),
        other => Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            other.as_str(),
            "waiting for the node pod",
        ),
    }
}

/// Project the next status from the previous one and fresh observations
///
/// Values the poll could not refresh keep their last-known state.
pub fn project_status(previous: &ManagedNodeStatus, obs: &Observations<'_>) -> ManagedNodeStatus {
    let mut next = previous.clone();
    let changed_image = image_changed(previous, obs.workload);

    next.phase = derive_phase(previous.phase, obs.workload, changed_image);
    next.observed_generation = obs.generation;
    if obs.workload.image.is_some() {
        next.image = obs.workload.image.clone();
    }

    let finished_upgrade = next.phase == NodePhase::Running
        && (previous.phase == NodePhase::Upgrading
            || (previous.phase == NodePhase::Running && changed_image));
    if finished_upgrade {
        next.last_upgrade_time = Some(obs.now);
    }

    next.message = Some(match next.phase {
        NodePhase::Running => format!("running {}", obs.spec.image.reference()),
        NodePhase::Upgrading => format!("upgrading to {}", obs.spec.image.reference()),
        NodePhase::Syncing => "node is starting".to_string(),
        _ => "waiting for the node pod to be scheduled".to_string(),
    });
    next.set_condition(ready_condition(next.phase));

    match obs.poll {
        PollResult::Observed(o) => {
            next.sync_info = Some(merge_sync(previous.sync_info.as_ref(), o, obs.now));

            let mut network = previous.network_info.clone().unwrap_or_default();
            if let Some(peers) = o.peers {
                network.peer_count = peers;
            }
            network.identity = Some(o.node_id.clone());
            next.network_info = Some(network);

            if obs.spec.kind.is_validator() {
                next.validator_info = merge_validator(previous.validator_info.as_ref(), o);
            }
            next.set_condition(Condition::new(
                REACHABLE_CONDITION,
                ConditionStatus::True,
                "StatusPolled",
                "status endpoint answered",
            ));
        }
        PollResult::Failed(reason) => {
            next.set_condition(Condition::new(
                REACHABLE_CONDITION,
                ConditionStatus::False,
                "PollFailed",
                reason.clone(),
            ));
        }
        PollResult::Skipped => next.clear_condition(REACHABLE_CONDITION),
    }

    let network = next.network_info.get_or_insert_with(NetworkInfo::default);
    network.network = Some(obs.spec.network.as_str().to_string());

    if !obs.spec.kind.is_validator() {
        next.validator_info = None;
    }

    match obs.held_image {
        Some(target) => next.set_condition(Condition::new(
            UPGRADE_PENDING_CONDITION,
            ConditionStatus::True,
            "ManualStrategy",
            format!(
                "{target} is held; running {}",
                obs.workload.image.as_deref().unwrap_or("unknown")
            ),
        )),
        None => next.clear_condition(UPGRADE_PENDING_CONDITION),
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{NodeKind, ValidatorSpec};
    use crate::probe::ValidatorObservation;
    use chrono::TimeZone;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn workload(replicas: i32, ready: i32) -> WorkloadObservation {
        WorkloadObservation {
            replicas,
            ready_replicas: ready,
            rollout_complete: ready >= 1 && replicas == 1,
            image: Some("axelarnet/axelar-core:v0.35.5".to_string()),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn observed(height: u64) -> PollResult {
        PollResult::Observed(NodeObservation {
            node_id: "4f1e2c".to_string(),
            height,
            peers: Some(8),
            ..Default::default()
        })
    }

    fn project(
        spec: &ManagedNodeSpec,
        previous: &ManagedNodeStatus,
        w: &WorkloadObservation,
        poll: &PollResult,
        now: DateTime<Utc>,
    ) -> ManagedNodeStatus {
        project_status(
            previous,
            &Observations {
                spec,
                generation: Some(1),
                workload: w,
                poll,
                held_image: None,
                now,
            },
        )
    }

    // =========================================================================
    // Phase derivation
    // =========================================================================

    #[test]
    fn phase_follows_replica_counts() {
        assert_eq!(derive_phase(NodePhase::Pending, &workload(0, 0), false), NodePhase::Initializing);
        assert_eq!(derive_phase(NodePhase::Initializing, &workload(1, 0), false), NodePhase::Syncing);
        assert_eq!(derive_phase(NodePhase::Syncing, &workload(1, 1), false), NodePhase::Running);
    }

    #[test]
    fn running_node_with_new_image_rolling_out_is_upgrading() {
        let rolling = WorkloadObservation {
            rollout_complete: false,
            ..workload(1, 0)
        };
        assert_eq!(derive_phase(NodePhase::Running, &rolling, true), NodePhase::Upgrading);
        assert_eq!(derive_phase(NodePhase::Upgrading, &rolling, false), NodePhase::Upgrading);
    }

    #[test]
    fn upgrade_ends_when_rollout_completes() {
        assert_eq!(derive_phase(NodePhase::Upgrading, &workload(1, 1), false), NodePhase::Running);
    }

    #[test]
    fn image_change_before_first_ready_is_not_an_upgrade() {
        let rolling = WorkloadObservation {
            rollout_complete: false,
            ..workload(1, 0)
        };
        assert_eq!(derive_phase(NodePhase::Syncing, &rolling, true), NodePhase::Syncing);
    }

    #[test]
    fn rollout_state_read_from_deployment() {
        let deployment = Deployment {
            metadata: ObjectMeta {
                generation: Some(4),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(3),
                replicas: Some(1),
                ready_replicas: Some(1),
                updated_replicas: Some(1),
                ..Default::default()
            }),
        };
        let w = WorkloadObservation::from_deployment(&deployment);
        assert_eq!((w.replicas, w.ready_replicas), (1, 1));
        // controller has not seen generation 4 yet
        assert!(!w.rollout_complete);
    }

    // =========================================================================
    // Projection
    // =========================================================================

    #[test]
    fn story_fresh_observer_reports_syncing() {
        let spec = ManagedNodeSpec::default();
        let status = project(
            &spec,
            &ManagedNodeStatus::default(),
            &workload(1, 0),
            &PollResult::Failed("connection refused".to_string()),
            at(0),
        );
        assert_eq!(status.phase, NodePhase::Syncing);
        assert!(status.sync_info.is_none());
        assert_eq!(
            status.network_info.as_ref().unwrap().network.as_deref(),
            Some("testnet")
        );
        assert_eq!(
            status.get_condition(REACHABLE_CONDITION).unwrap().status,
            ConditionStatus::False
        );
    }

    #[test]
    fn story_poll_failure_keeps_last_known_height() {
        let spec = ManagedNodeSpec::default();
        let first = project(&spec, &ManagedNodeStatus::default(), &workload(1, 1), &observed(100), at(0));
        assert_eq!(first.sync_info.as_ref().unwrap().current_height, 100);

        let second = project(
            &spec,
            &first,
            &workload(1, 1),
            &PollResult::Failed("timed out".to_string()),
            at(30),
        );
        let sync = second.sync_info.unwrap();
        assert_eq!(sync.current_height, 100);
        assert_eq!(sync.last_sync_time, Some(at(0)));
        assert_eq!(second.network_info.unwrap().peer_count, 8);
    }

    #[test]
    fn sync_time_advances_only_with_height() {
        let spec = ManagedNodeSpec::default();
        let a = project(&spec, &ManagedNodeStatus::default(), &workload(1, 1), &observed(100), at(0));
        let b = project(&spec, &a, &workload(1, 1), &observed(100), at(10));
        assert_eq!(b.sync_info.as_ref().unwrap().last_sync_time, Some(at(0)));
        let c = project(&spec, &b, &workload(1, 1), &observed(105), at(20));
        assert_eq!(c.sync_info.as_ref().unwrap().last_sync_time, Some(at(20)));
    }

    #[test]
    fn latest_height_never_decreases() {
        let spec = ManagedNodeSpec::default();
        let a = project(&spec, &ManagedNodeStatus::default(), &workload(1, 1), &observed(500), at(0));
        let b = project(&spec, &a, &workload(1, 1), &observed(20), at(10));
        let sync = b.sync_info.unwrap();
        assert_eq!(sync.current_height, 20);
        assert_eq!(sync.latest_height, 500);
    }

    #[test]
    fn unchanged_inputs_project_an_identical_status() {
        let spec = ManagedNodeSpec::default();
        let a = project(&spec, &ManagedNodeStatus::default(), &workload(1, 1), &observed(100), at(0));
        let b = project(&spec, &a, &workload(1, 1), &observed(100), at(60));
        assert_eq!(a, b);
    }

    #[test]
    fn validator_info_only_for_validators() {
        let poll = PollResult::Observed(NodeObservation {
            height: 10,
            validator: Some(ValidatorObservation {
                address: "A1B2".to_string(),
                voting_power: 10,
                missed_blocks: Some(2),
                last_signed_height: Some(9),
            }),
            ..Default::default()
        });

        let mut spec = ManagedNodeSpec {
            kind: NodeKind::Validator,
            validator: Some(ValidatorSpec::default()),
            ..Default::default()
        };
        let as_validator = project(&spec, &ManagedNodeStatus::default(), &workload(1, 1), &poll, at(0));
        let info = as_validator.validator_info.clone().unwrap();
        assert_eq!(info.address, "A1B2");
        assert_eq!(info.missed_blocks, 2);

        spec.kind = NodeKind::Sentry;
        spec.validator = None;
        let as_sentry = project(&spec, &as_validator, &workload(1, 1), &poll, at(10));
        assert!(as_sentry.validator_info.is_none());
    }

    #[test]
    fn story_upgrade_sets_last_upgrade_time() {
        let spec = ManagedNodeSpec::default();
        let running = ManagedNodeStatus {
            phase: NodePhase::Running,
            image: Some("axelarnet/axelar-core:v0.35.4".to_string()),
            ..Default::default()
        };
        let rolling = WorkloadObservation {
            replicas: 1,
            ready_replicas: 0,
            rollout_complete: false,
            image: Some("axelarnet/axelar-core:v0.35.5".to_string()),
        };

        let upgrading = project(&spec, &running, &rolling, &PollResult::Skipped, at(0));
        assert_eq!(upgrading.phase, NodePhase::Upgrading);
        assert!(upgrading.last_upgrade_time.is_none());

        let done = project(&spec, &upgrading, &workload(1, 1), &PollResult::Skipped, at(90));
        assert_eq!(done.phase, NodePhase::Running);
        assert_eq!(done.last_upgrade_time, Some(at(90)));
        assert!(done.is_condition_true(READY_CONDITION));
    }

    #[test]
    fn held_upgrade_is_reported_and_cleared() {
        let spec = ManagedNodeSpec::default();
        let w = workload(1, 1);
        let held = project_status(
            &ManagedNodeStatus::default(),
            &Observations {
                spec: &spec,
                generation: Some(2),
                workload: &w,
                poll: &PollResult::Skipped,
                held_image: Some("axelarnet/axelar-core:v0.36.0"),
                now: at(0),
            },
        );
        assert!(held.is_condition_true(UPGRADE_PENDING_CONDITION));
        assert_eq!(held.observed_generation, Some(2));

        let released = project(&spec, &held, &w, &PollResult::Skipped, at(10));
        assert!(released.get_condition(UPGRADE_PENDING_CONDITION).is_none());
    }
}
