//! ManagedNode controller implementation
//!
//! This module implements the reconciliation logic for ManagedNode resources.
//! It follows the Kubernetes controller pattern: observe current state,
//! determine desired state, calculate diff, and apply changes.
//!
//! One pass either finalizes a deleted node, attaches the finalizer to a new
//! one, or converges the dependent objects in a fixed order and refreshes
//! status from the Deployment and the node's own RPC endpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::apply::{converge, ApplyOptions, ApplyOutcome};
use super::client::{Dependent, DependentKind, KubeClient, KubeClientImpl};
use super::status::{
    project_status, Observations, PollResult, WorkloadObservation, READY_CONDITION,
    UPGRADE_PENDING_CONDITION,
};
use crate::compiler::{credentials, CompiledNode, NodeCompiler, ObjectNames};
use crate::crd::{
    Condition, ConditionStatus, ManagedNode, ManagedNodeSpec, ManagedNodeStatus, NodePhase,
    UpgradeStrategy,
};
use crate::events::{EventPublisher, KubeEventPublisher, NodeEvent};
use crate::metrics::{self, ReconcileTimer, ALL_PHASES};
use crate::probe::{HttpStatusPoller, PollTarget, StatusPoller};
use crate::retry::{backoff_delay, RETRY_BASE_DELAY_SECS, RETRY_MAX_DELAY_SECS};
use crate::Error;

/// Finalizer guarding cleanup of a node's dependents
pub const NODE_FINALIZER: &str = "nodeops.dev/finalizer";

/// Name reported on Events and used as the field manager
pub const CONTROLLER_NAME: &str = "nodeops-controller";

/// Default interval between periodic reconciles of a healthy node
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(300);

/// Default deadline for one status poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// What the runtime should do after a successful pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing to do until the object changes
    Done,
    /// Look again after the delay
    RequeueAfter(Duration),
    /// Look again right away
    RequeueNow,
}

impl From<ReconcileOutcome> for Action {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Done => Action::await_change(),
            ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
            ReconcileOutcome::RequeueNow => Action::requeue(Duration::ZERO),
        }
    }
}

/// Controller context shared by every reconcile
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Reads the node's own status endpoints
    pub poller: Arc<dyn StatusPoller>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Delay before re-checking a converged node
    pub requeue_interval: Duration,
    /// Deadline for one status poll
    pub poll_timeout: Duration,
    /// Consecutive failures per `namespace/name`
    failures: DashMap<String, u32>,
    /// Last projected phase per `namespace/name`, for the phase gauge
    phases: DashMap<String, NodePhase>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        poller: Arc<dyn StatusPoller>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            poller,
            events,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            failures: DashMap::new(),
            phases: DashMap::new(),
        }
    }

    /// Count a failed reconcile and return how many preceded it
    fn record_failure(&self, key: &str) -> u32 {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        let previous = *entry;
        *entry = previous.saturating_add(1);
        previous
    }

    fn clear_failures(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Drop everything tracked for one node
    fn forget(&self, key: &str) {
        self.failures.remove(key);
        self.track_phase(key, None);
    }

    /// Forget every tracked node whose `namespace/name` is not in `live`
    ///
    /// Returns how many nodes were forgotten.
    pub fn retain_nodes(&self, live: &HashSet<String>) -> usize {
        let departed: HashSet<String> = self
            .failures
            .iter()
            .map(|e| e.key().clone())
            .chain(self.phases.iter().map(|e| e.key().clone()))
            .filter(|key| !live.contains(key))
            .collect();
        for key in &departed {
            self.forget(key);
        }
        departed.len()
    }

    #[cfg(test)]
    fn tracked(&self, key: &str) -> bool {
        self.failures.contains_key(key) || self.phases.contains_key(key)
    }

    fn track_phase(&self, key: &str, phase: Option<NodePhase>) {
        match phase {
            Some(phase) => {
                self.phases.insert(key.to_string(), phase);
            }
            None => {
                self.phases.remove(key);
            }
        }
        for phase in ALL_PHASES {
            let count = self.phases.iter().filter(|e| *e.value() == phase).count();
            metrics::set_phase_count(phase, count as i64);
        }
    }

    async fn publish(&self, node: &ManagedNode, event: NodeEvent) {
        self.events.publish(&node.object_ref(&()), event).await;
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .requeue_interval(Duration::from_secs(120))
///     .poll_timeout(Duration::from_secs(3))
///     .build()?;
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    poller: Option<Arc<dyn StatusPoller>>,
    events: Option<Arc<dyn EventPublisher>>,
    requeue_interval: Duration,
    poll_timeout: Duration,
}

impl ContextBuilder {
    /// Create a new builder with the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            poller: None,
            events: None,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Override the Kubernetes client wrapper
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the status poller
    pub fn poller(mut self, poller: Arc<dyn StatusPoller>) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the periodic requeue interval
    pub fn requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    /// Set the status poll deadline
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let poller: Arc<dyn StatusPoller> = match self.poller {
            Some(poller) => poller,
            None => Arc::new(HttpStatusPoller::new(self.poll_timeout)?),
        };
        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            poller,
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            requeue_interval: self.requeue_interval,
            poll_timeout: self.poll_timeout,
            failures: DashMap::new(),
            phases: DashMap::new(),
        })
    }
}

pub(crate) fn object_key(node: &ManagedNode) -> String {
    format!(
        "{}/{}",
        node.namespace().unwrap_or_default(),
        node.name_any()
    )
}

fn has_finalizer(node: &ManagedNode) -> bool {
    node.finalizers().iter().any(|f| f == NODE_FINALIZER)
}

/// Reconcile a ManagedNode
///
/// Entry point for the controller runtime. Maps the pass outcome onto an
/// [`Action`] and records timing and failure metrics.
#[instrument(skip(node, ctx), fields(node = %node.name_any(), namespace = %node.namespace().unwrap_or_default()))]
pub async fn reconcile(node: Arc<ManagedNode>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start();
    match reconcile_node(&node, &ctx).await {
        Ok(outcome) => {
            timer.success();
            ctx.clear_failures(&object_key(&node));
            debug!(?outcome, "reconcile complete");
            Ok(outcome.into())
        }
        Err(e) => {
            timer.error(e.reason());
            Err(e)
        }
    }
}

/// One reconcile pass
pub async fn reconcile_node(node: &ManagedNode, ctx: &Context) -> Result<ReconcileOutcome, Error> {
    let name = node.name_any();
    let namespace = node
        .namespace()
        .ok_or_else(|| Error::internal("reconciler", format!("ManagedNode {name} has no namespace")))?;

    if node.metadata.deletion_timestamp.is_some() {
        return finalize(node, &namespace, ctx).await;
    }

    // The finalizer must be in place before anything is created
    if !has_finalizer(node) {
        ctx.kube
            .add_finalizer(&namespace, &name, NODE_FINALIZER)
            .await?;
        info!("attached finalizer");
        ctx.publish(node, NodeEvent::FinalizerAdded).await;

        if node.status.is_none() {
            let status = ManagedNodeStatus::with_phase(NodePhase::Pending)
                .message("waiting for dependent objects");
            ctx.kube.patch_status(&namespace, &name, &status).await?;
        }
        return Ok(ReconcileOutcome::RequeueNow);
    }

    let previous = node.status.clone().unwrap_or_default();
    if previous.phase == NodePhase::Failed
        && previous.observed_generation.is_some()
        && previous.observed_generation == node.metadata.generation
    {
        debug!("spec was rejected and has not changed since");
        return Ok(ReconcileOutcome::Done);
    }

    let compiled = match NodeCompiler::compile(node) {
        Ok(compiled) => compiled,
        Err(e) if !e.is_retryable() => return reject_spec(node, &namespace, &previous, e, ctx).await,
        Err(e) => return Err(e),
    };

    let workload = match apply_all(ctx.kube.as_ref(), &namespace, node, &compiled).await {
        Ok(outcome) => outcome,
        Err(e) => {
            record_apply_failure(node, &namespace, &previous, &e, ctx).await;
            return Err(e);
        }
    };

    refresh_status(node, &namespace, &previous, &compiled, &workload, ctx).await?;
    Ok(ReconcileOutcome::RequeueAfter(ctx.requeue_interval))
}

/// Converge every dependent in order, stopping at the first failure
///
/// Returns what happened to the Deployment.
async fn apply_all(
    kube: &dyn KubeClient,
    namespace: &str,
    node: &ManagedNode,
    compiled: &CompiledNode,
) -> Result<ApplyOutcome, Error> {
    let plain = ApplyOptions::default();

    converge(kube, namespace, &Dependent::ConfigMap(compiled.config_map.clone()), plain).await?;

    if let Some(secret) = &compiled.credentials {
        converge(kube, namespace, &Dependent::Secret(secret.clone()), plain).await?;
    }
    // The Secret is never rewritten, so keys a new kind needs must be added by hand
    let secret_name = credentials::secret_name(&node.spec, &ObjectNames::for_node(&node.name_any()));
    match kube.get(namespace, DependentKind::Secret, &secret_name).await? {
        Some(Dependent::Secret(secret)) => {
            let missing = credentials::missing_keys(&node.spec, &secret);
            if !missing.is_empty() {
                return Err(Error::apply(
                    "Secret",
                    secret_name,
                    format!("missing keys {}", missing.join(", ")),
                ));
            }
        }
        _ if compiled.credentials.is_none() => {
            return Err(Error::apply(
                "Secret",
                secret_name,
                "externally managed secret does not exist yet",
            ));
        }
        _ => {
            return Err(Error::apply("Secret", secret_name, "secret vanished after apply"));
        }
    }

    converge(kube, namespace, &Dependent::Claim(compiled.data_claim.clone()), plain).await?;
    converge(kube, namespace, &Dependent::Claim(compiled.shared_claim.clone()), plain).await?;
    converge(kube, namespace, &Dependent::Service(compiled.service.clone()), plain).await?;

    let options = ApplyOptions {
        hold_image_changes: node.spec.upgrade.strategy == UpgradeStrategy::Manual,
    };
    converge(kube, namespace, &Dependent::Deployment(compiled.deployment.clone()), options).await
}

async fn write_status_if_changed(
    ctx: &Context,
    namespace: &str,
    name: &str,
    previous: &ManagedNodeStatus,
    next: &ManagedNodeStatus,
) -> Result<bool, Error> {
    if next == previous {
        debug!("status unchanged");
        return Ok(false);
    }
    ctx.kube.patch_status(namespace, name, next).await?;
    Ok(true)
}

/// Park a node whose spec cannot be compiled until its generation changes
async fn reject_spec(
    node: &ManagedNode,
    namespace: &str,
    previous: &ManagedNodeStatus,
    error: Error,
    ctx: &Context,
) -> Result<ReconcileOutcome, Error> {
    warn!(%error, "rejecting spec");

    let mut next = previous.clone().phase(NodePhase::Failed).message(error.to_string());
    next.observed_generation = node.metadata.generation;
    next.set_condition(Condition::new(
        READY_CONDITION,
        ConditionStatus::False,
        error.reason(),
        error.to_string(),
    ));

    write_status_if_changed(ctx, namespace, &node.name_any(), previous, &next).await?;
    if previous.phase != NodePhase::Failed {
        metrics::record_transition(previous.phase, NodePhase::Failed);
    }
    ctx.track_phase(&object_key(node), Some(NodePhase::Failed));
    ctx.publish(node, NodeEvent::InvalidSpec(error.to_string()))
        .await;

    Ok(ReconcileOutcome::Done)
}

/// Surface an apply failure on status without changing the phase
///
/// Best effort: the original error is what the caller returns.
async fn record_apply_failure(
    node: &ManagedNode,
    namespace: &str,
    previous: &ManagedNodeStatus,
    error: &Error,
    ctx: &Context,
) {
    let mut next = previous.clone();
    next.set_condition(Condition::new(
        READY_CONDITION,
        ConditionStatus::False,
        error.reason(),
        error.to_string(),
    ));

    if let Err(e) = write_status_if_changed(ctx, namespace, &node.name_any(), previous, &next).await {
        warn!(error = %e, "failed to record apply failure on status");
    }
    ctx.publish(node, NodeEvent::ApplyFailed(error.to_string()))
        .await;
}

async fn poll_node(ctx: &Context, target: &PollTarget) -> PollResult {
    if target.is_empty() {
        return PollResult::Skipped;
    }

    match tokio::time::timeout(ctx.poll_timeout, ctx.poller.poll(target)).await {
        Ok(Ok(observation)) => PollResult::Observed(observation),
        Ok(Err(e)) => {
            metrics::record_poll_failure();
            warn!(error = %e, "status poll failed");
            PollResult::Failed(e.to_string())
        }
        Err(_) => {
            metrics::record_poll_failure();
            warn!(timeout_secs = ctx.poll_timeout.as_secs_f64(), "status poll timed out");
            PollResult::Failed(format!(
                "status poll timed out after {}ms",
                ctx.poll_timeout.as_millis()
            ))
        }
    }
}

/// Project and write status after a successful convergence
async fn refresh_status(
    node: &ManagedNode,
    namespace: &str,
    previous: &ManagedNodeStatus,
    compiled: &CompiledNode,
    workload: &ApplyOutcome,
    ctx: &Context,
) -> Result<(), Error> {
    let name = node.name_any();
    let spec: &ManagedNodeSpec = &node.spec;

    let deployment_name = compiled.deployment.metadata.name.as_deref().unwrap_or(&name);
    let observed = match ctx
        .kube
        .get(namespace, DependentKind::Deployment, deployment_name)
        .await?
    {
        Some(Dependent::Deployment(d)) => WorkloadObservation::from_deployment(&d),
        _ => WorkloadObservation::default(),
    };

    let target = PollTarget::for_node(spec, &ObjectNames::for_node(&name), namespace);
    let poll = poll_node(ctx, &target).await;

    let desired_image = spec.image.reference();
    let held_image = workload.image_held().then_some(desired_image.as_str());

    let next = project_status(
        previous,
        &Observations {
            spec,
            generation: node.metadata.generation,
            workload: &observed,
            poll: &poll,
            held_image,
            now: Utc::now(),
        },
    );

    write_status_if_changed(ctx, namespace, &name, previous, &next).await?;
    ctx.track_phase(&object_key(node), Some(next.phase));

    if next.phase != previous.phase {
        info!(from = %previous.phase, to = %next.phase, "phase changed");
        metrics::record_transition(previous.phase, next.phase);
        ctx.publish(
            node,
            NodeEvent::PhaseChanged {
                from: previous.phase,
                to: next.phase,
            },
        )
        .await;
        if next.phase == NodePhase::Upgrading {
            ctx.publish(
                node,
                NodeEvent::UpgradeStarted {
                    image: desired_image.clone(),
                },
            )
            .await;
        }
    }

    if held_image.is_some() && !previous.is_condition_true(UPGRADE_PENDING_CONDITION) {
        ctx.publish(
            node,
            NodeEvent::UpgradeHeld {
                image: desired_image.clone(),
            },
        )
        .await;
    }

    Ok(())
}

/// Run cleanup for a node being deleted, then release it
async fn finalize(
    node: &ManagedNode,
    namespace: &str,
    ctx: &Context,
) -> Result<ReconcileOutcome, Error> {
    if !has_finalizer(node) {
        ctx.forget(&object_key(node));
        return Ok(ReconcileOutcome::Done);
    }
    let name = node.name_any();
    info!("cleaning up dependent objects");

    if let Err(e) = cleanup(ctx.kube.as_ref(), namespace, &node.spec, &ObjectNames::for_node(&name)).await {
        ctx.publish(node, NodeEvent::CleanupFailed(e.to_string()))
            .await;
        return Err(Error::cleanup(name, e.to_string()));
    }

    ctx.kube
        .remove_finalizer(namespace, &name, NODE_FINALIZER)
        .await?;
    ctx.forget(&object_key(node));
    ctx.publish(node, NodeEvent::CleanupComplete).await;
    info!("finalizer removed");
    Ok(ReconcileOutcome::Done)
}

/// Delete every dependent a node may own
///
/// Objects that are already gone count as deleted, so running this again on
/// a partially cleaned node is safe. A Secret supplied by an external
/// provider is never deleted.
pub async fn cleanup(
    kube: &dyn KubeClient,
    namespace: &str,
    spec: &ManagedNodeSpec,
    names: &ObjectNames,
) -> Result<(), Error> {
    let external_secret = spec.security.secret_management.provider.is_external()
        && credentials::secret_name(spec, names) == names.secrets;

    let mut targets = vec![
        (DependentKind::Deployment, names.workload.as_str()),
        (DependentKind::Service, names.service.as_str()),
        (DependentKind::ConfigMap, names.config.as_str()),
    ];
    if !external_secret {
        targets.push((DependentKind::Secret, names.secrets.as_str()));
    }
    targets.push((DependentKind::PersistentVolumeClaim, names.data.as_str()));
    targets.push((DependentKind::PersistentVolumeClaim, names.shared.as_str()));

    for (kind, name) in targets {
        if kube.delete(namespace, kind, name).await? {
            info!(%kind, %name, "deleted");
        } else {
            debug!(%kind, %name, "already gone");
        }
    }
    Ok(())
}

/// Error policy for the controller
///
/// Requeues with exponential backoff per node: 5s after the first failure,
/// doubling up to five minutes. A successful pass resets the count.
pub fn error_policy(node: Arc<ManagedNode>, error: &Error, ctx: Arc<Context>) -> Action {
    let prior = ctx.record_failure(&object_key(&node));
    let delay = backoff_delay(prior, RETRY_BASE_DELAY_SECS, RETRY_MAX_DELAY_SECS);
    error!(
        %error,
        node = %node.name_any(),
        reason = error.reason(),
        attempt = prior + 1,
        retry_in_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}
