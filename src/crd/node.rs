//! ManagedNode Custom Resource Definition
//!
//! A ManagedNode declares one blockchain node: its role, network, image,
//! storage and endpoints. The operator turns it into a ConfigMap, a Secret,
//! two PersistentVolumeClaims, a Service and a single-replica Deployment.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ConditionStatus, ImageSpec, MonitoringSpec, Network, NetworkInfo, NetworkingSpec,
    NodeKind, NodePhase, SecuritySpec, StorageSpec, SyncInfo, UpgradeSpec, ValidatorInfo,
    ValidatorSpec,
};
use crate::Error;

/// Longest name a Service may carry (RFC 1035 label)
const MAX_DNS_LABEL_LEN: usize = 63;

/// Pruning strategies understood by the node
const PRUNING_STRATEGIES: &[&str] = &["default", "nothing", "everything", "custom"];

fn default_moniker() -> String {
    "managed-node".to_string()
}

/// Specification for a ManagedNode
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nodeops.dev",
    version = "v1alpha1",
    kind = "ManagedNode",
    plural = "managednodes",
    shortname = "mnode",
    status = "ManagedNodeStatus",
    namespaced,
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.kind"}"#,
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.network"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Height","type":"integer","jsonPath":".status.syncInfo.currentHeight"}"#,
    printcolumn = r#"{"name":"Peers","type":"integer","jsonPath":".status.networkInfo.peerCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedNodeSpec {
    /// Role of the node; decides the container topology
    #[serde(default)]
    pub kind: NodeKind,

    /// Network the node joins
    #[serde(default)]
    pub network: Network,

    /// Chain ID override; the network's default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,

    /// Human-readable node name advertised to peers
    #[serde(default = "default_moniker")]
    pub moniker: String,

    /// Node image
    #[serde(default)]
    pub image: ImageSpec,

    /// CPU and memory for the node container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Data volume and backups
    #[serde(default)]
    pub storage: StorageSpec,

    /// Validator settings; only valid with `kind: validator`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<ValidatorSpec>,

    /// P2P, RPC and API endpoints
    #[serde(default)]
    pub networking: NetworkingSpec,

    /// Metrics and alerting
    #[serde(default)]
    pub monitoring: MonitoringSpec,

    /// Upgrade policy
    #[serde(default)]
    pub upgrade: UpgradeSpec,

    /// Pod security and credential management
    #[serde(default)]
    pub security: SecuritySpec,
}

impl Default for ManagedNodeSpec {
    fn default() -> Self {
        Self {
            kind: NodeKind::default(),
            network: Network::default(),
            chain_id: None,
            moniker: default_moniker(),
            image: ImageSpec::default(),
            resources: None,
            storage: StorageSpec::default(),
            validator: None,
            networking: NetworkingSpec::default(),
            monitoring: MonitoringSpec::default(),
            upgrade: UpgradeSpec::default(),
            security: SecuritySpec::default(),
        }
    }
}

impl ManagedNodeSpec {
    /// Chain ID in effect: the override if set, else the network default
    pub fn resolved_chain_id(&self) -> String {
        self.chain_id
            .clone()
            .unwrap_or_else(|| self.network.chain_id().to_string())
    }

    /// Validator settings in effect; defaults apply when a validator omits them
    pub fn validator_settings(&self) -> Option<ValidatorSpec> {
        if !self.kind.is_validator() {
            return None;
        }
        Some(self.validator.clone().unwrap_or_default())
    }

    /// True when the pod runs the bridge and signer sidecars
    pub fn runs_signing_sidecars(&self) -> bool {
        self.validator_settings().is_some_and(|v| v.enabled)
    }

    /// Validate the node specification
    ///
    /// `name` is the resource name, used both for error context and to check
    /// that derived object names stay within Kubernetes limits.
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        let service_name = format!("{name}-service");
        if service_name.len() > MAX_DNS_LABEL_LEN {
            return Err(Error::validation_for_field(
                name,
                "metadata.name",
                format!(
                    "derived service name '{service_name}' exceeds {MAX_DNS_LABEL_LEN} characters"
                ),
            ));
        }

        if self.moniker.trim().is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.moniker",
                "moniker must not be empty",
            ));
        }
        if self.image.repository.trim().is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.image.repository",
                "image repository must not be empty",
            ));
        }
        if self.image.tag.trim().is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.image.tag",
                "image tag must not be empty",
            ));
        }
        if matches!(&self.chain_id, Some(id) if id.trim().is_empty()) {
            return Err(Error::validation_for_field(
                name,
                "spec.chainId",
                "chain ID override must not be empty",
            ));
        }

        if !is_quantity(&self.storage.size) {
            return Err(Error::validation_for_field(
                name,
                "spec.storage.size",
                format!("'{}' is not a valid storage quantity", self.storage.size),
            ));
        }
        if !PRUNING_STRATEGIES.contains(&self.storage.pruning.as_str()) {
            return Err(Error::validation_for_field(
                name,
                "spec.storage.pruning",
                format!(
                    "unknown pruning strategy '{}', expected one of {}",
                    self.storage.pruning,
                    PRUNING_STRATEGIES.join(", ")
                ),
            ));
        }

        self.validate_ports(name)?;

        if !self.monitoring.metrics_endpoint.path.starts_with('/') {
            return Err(Error::validation_for_field(
                name,
                "spec.monitoring.metricsEndpoint.path",
                "metrics path must start with '/'",
            ));
        }

        let p2p = &self.networking.p2p;
        for (field, peers) in [
            ("spec.networking.p2p.persistentPeers", &p2p.persistent_peers),
            ("spec.networking.p2p.seeds", &p2p.seeds),
        ] {
            if let Some(bad) = peers.iter().find(|p| !is_peer_address(p)) {
                return Err(Error::validation_for_field(
                    name,
                    field,
                    format!("'{bad}' is not of the form <id>@<host>:<port>"),
                ));
            }
        }

        if self.validator.is_some() && !self.kind.is_validator() {
            return Err(Error::validation_for_field(
                name,
                "spec.validator",
                format!("validator settings are only valid for kind validator, not {}", self.kind),
            ));
        }

        let secrets = &self.security.secret_management;
        if secrets.provider.is_external()
            && secrets.secret_name.as_deref().is_none_or(|s| s.trim().is_empty())
        {
            return Err(Error::validation_for_field(
                name,
                "spec.security.secretManagement.secretName",
                "external secret providers require a secret name",
            ));
        }

        Ok(())
    }

    fn validate_ports(&self, name: &str) -> Result<(), Error> {
        let ports = [
            ("spec.networking.rpc.port", self.networking.rpc.port),
            ("spec.networking.p2p.port", self.networking.p2p.port),
            ("spec.networking.api.port", self.networking.api.port),
            (
                "spec.monitoring.metricsEndpoint.port",
                self.monitoring.metrics_endpoint.port,
            ),
        ];

        for (i, (field, port)) in ports.iter().enumerate() {
            if *port == 0 {
                return Err(Error::validation_for_field(name, *field, "port must be non-zero"));
            }
            if let Some((other, _)) = ports[..i].iter().find(|(_, p)| p == port) {
                return Err(Error::validation_for_field(
                    name,
                    *field,
                    format!("port {port} is already used by {other}"),
                ));
            }
        }
        Ok(())
    }
}

/// Accepts Kubernetes quantities like `500Gi`, `1.5Ti` or `1000000`
fn is_quantity(s: &str) -> bool {
    const SUFFIXES: &[&str] = &[
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "k", "M", "G", "T", "P", "E", "",
    ];
    let Some(number) = SUFFIXES
        .iter()
        .find_map(|suffix| s.strip_suffix(suffix).filter(|n| !n.is_empty()))
    else {
        return false;
    };
    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let frac = parts.next();
    !whole.is_empty()
        && whole.chars().all(|c| c.is_ascii_digit())
        && frac.is_none_or(|f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

/// Accepts `<id>@<host>:<port>`
fn is_peer_address(s: &str) -> bool {
    let Some((id, addr)) = s.split_once('@') else {
        return false;
    };
    let Some((host, port)) = addr.rsplit_once(':') else {
        return false;
    };
    !id.is_empty() && !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0)
}

/// Status for a ManagedNode
///
/// Optional fields serialize as `null` so that a merge patch of the whole
/// status clears values that no longer apply.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedNodeStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: NodePhase,

    /// Human-readable message about current state
    #[serde(default)]
    pub message: Option<String>,

    /// Conditions keyed by type
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Chain sync progress
    #[serde(default)]
    pub sync_info: Option<SyncInfo>,

    /// Peers and node identity
    #[serde(default)]
    pub network_info: Option<NetworkInfo>,

    /// Signing information, validators only
    #[serde(default)]
    pub validator_info: Option<ValidatorInfo>,

    /// Last completed backup
    #[serde(default)]
    pub last_backup_time: Option<DateTime<Utc>>,

    /// Last completed upgrade
    #[serde(default)]
    pub last_upgrade_time: Option<DateTime<Utc>>,

    /// Generation of the spec the controller last acted on
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Image reference last rolled out to the Deployment
    #[serde(default)]
    pub image: Option<String>,
}

impl ManagedNodeStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: NodePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: NodePhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.set_condition(condition);
        self
    }

    /// Insert or update a condition keyed by type
    ///
    /// The transition time of an existing condition is kept when its status
    /// does not change.
    pub fn set_condition(&mut self, mut condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// Remove a condition by type
    pub fn clear_condition(&mut self, type_: &str) {
        self.conditions.retain(|c| c.type_ != type_);
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when the named condition is present with status True
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.get_condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}
