//! Shared types for the ManagedNode CRD

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodSecurityContext;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Node identity
// =============================================================================

/// Role a node plays in its network
///
/// The kind decides which containers run in the node's pod. Only validators
/// carry the bridge and signer sidecars.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Block-signing node with cross-chain and threshold-signing sidecars
    Validator,
    /// Public-facing relay that shields validators from the open network
    Sentry,
    /// Peer-discovery node
    Seed,
    /// Read-only full node
    #[default]
    Observer,
}

impl NodeKind {
    /// Returns true for validator nodes
    pub fn is_validator(&self) -> bool {
        matches!(self, Self::Validator)
    }

    /// Lowercase name as used in the CRD
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validator => "validator",
            Self::Sentry => "sentry",
            Self::Seed => "seed",
            Self::Observer => "observer",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "validator" => Ok(Self::Validator),
            "sentry" => Ok(Self::Sentry),
            "seed" => Ok(Self::Seed),
            "observer" => Ok(Self::Observer),
            _ => Err(format!("unknown node kind: {s}")),
        }
    }
}

/// Chain network the node joins
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network
    Mainnet,
    /// Public test network
    #[default]
    Testnet,
}

/// Chain ID used on mainnet
pub const MAINNET_CHAIN_ID: &str = "axelar-dojo-1";

/// Chain ID used on testnet
pub const TESTNET_CHAIN_ID: &str = "axelar-testnet-lisbon-3";

impl Network {
    /// Default chain identifier for this network
    pub fn chain_id(&self) -> &'static str {
        match self {
            Self::Mainnet => MAINNET_CHAIN_ID,
            Self::Testnet => TESTNET_CHAIN_ID,
        }
    }

    /// Lowercase name as used in the CRD
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            _ => Err(format!("unknown network: {s}")),
        }
    }
}

// =============================================================================
// Image
// =============================================================================

/// Image pull policy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PullPolicy {
    /// Always pull
    Always,
    /// Pull only when the image is not cached on the node
    #[default]
    IfNotPresent,
    /// Never pull
    Never,
}

impl PullPolicy {
    /// Kubernetes spelling of the policy
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

/// Container image reference
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageSpec {
    /// Image repository (e.g., "axelarnet/axelar-core")
    pub repository: String,
    /// Image tag
    pub tag: String,
    /// Pull policy
    pub pull_policy: PullPolicy,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            repository: "axelarnet/axelar-core".to_string(),
            tag: "v0.35.5".to_string(),
            pull_policy: PullPolicy::IfNotPresent,
        }
    }
}

impl ImageSpec {
    /// Full image reference, `repository:tag`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Persistent storage for chain data
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSpec {
    /// Size of the data volume (e.g., "500Gi")
    pub size: String,

    /// StorageClass for the data volume; the cluster default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// State pruning strategy: default, nothing, everything or custom
    pub pruning: String,

    /// Backup policy
    pub backup: BackupSpec,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: "500Gi".to_string(),
            storage_class: None,
            pruning: "default".to_string(),
            backup: BackupSpec::default(),
        }
    }
}

/// Backup policy for the data volume
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupSpec {
    /// Whether backups are taken
    pub enabled: bool,
    /// Cron schedule for backups
    pub schedule: String,
    /// How long backups are kept (e.g., "7d")
    pub retention: String,
}

impl Default for BackupSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: "0 2 * * *".to_string(),
            retention: "7d".to_string(),
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Validator-only settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidatorSpec {
    /// Run the bridge and signer sidecars
    pub enabled: bool,

    /// Validator key handling
    pub key_management: KeyManagementSpec,

    /// Double-sign and downtime protection
    pub slashing: SlashingSpec,

    /// Image for the threshold-signing sidecar
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_image: Option<ImageSpec>,
}

impl Default for ValidatorSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            key_management: KeyManagementSpec::default(),
            slashing: SlashingSpec::default(),
            signer_image: None,
        }
    }
}

/// Default image of the threshold-signing sidecar
pub fn default_signer_image() -> ImageSpec {
    ImageSpec {
        repository: "axelarnet/tofnd".to_string(),
        tag: "v0.10.1".to_string(),
        pull_policy: PullPolicy::IfNotPresent,
    }
}

/// Validator key management
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyManagementSpec {
    /// Rotate keys on a schedule
    pub auto_rotation: bool,
    /// Cron schedule for rotation
    pub rotation_schedule: String,
    /// Keep backups of key material
    pub backup_keys: bool,
}

impl Default for KeyManagementSpec {
    fn default() -> Self {
        Self {
            auto_rotation: false,
            rotation_schedule: "0 0 1 * *".to_string(),
            backup_keys: true,
        }
    }
}

/// Slashing protection
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SlashingSpec {
    /// Enable protection
    pub protection: bool,
    /// Missed blocks tolerated before alerting
    pub max_missed_blocks: u32,
}

impl Default for SlashingSpec {
    fn default() -> Self {
        Self {
            protection: true,
            max_missed_blocks: 50,
        }
    }
}

// =============================================================================
// Networking
// =============================================================================

/// Network endpoints exposed by the node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkingSpec {
    /// Peer-to-peer gossip
    pub p2p: P2pSpec,
    /// CometBFT RPC
    pub rpc: RpcSpec,
    /// REST API
    pub api: ApiSpec,
}

/// Peer-to-peer settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct P2pSpec {
    /// Listen port
    pub port: u16,
    /// Address advertised to peers (`host:port`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_address: Option<String>,
    /// Peers to keep connected, as `<id>@<host>:<port>`
    pub persistent_peers: Vec<String>,
    /// Seed nodes, as `<id>@<host>:<port>`
    pub seeds: Vec<String>,
}

impl Default for P2pSpec {
    fn default() -> Self {
        Self {
            port: 26656,
            external_address: None,
            persistent_peers: Vec::new(),
            seeds: Vec::new(),
        }
    }
}

/// RPC settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcSpec {
    /// Whether RPC is served
    pub enabled: bool,
    /// Listen port
    pub port: u16,
    /// Allow cross-origin requests from any origin
    pub cors: bool,
}

impl Default for RpcSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 26657,
            cors: false,
        }
    }
}

/// REST API settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSpec {
    /// Whether the API is served
    pub enabled: bool,
    /// Listen port
    pub port: u16,
}

impl Default for ApiSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 1317,
        }
    }
}

// =============================================================================
// Monitoring
// =============================================================================

/// Monitoring settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringSpec {
    /// Expose Prometheus metrics and add scrape annotations
    pub enabled: bool,
    /// Where metrics are served
    pub metrics_endpoint: MetricsEndpointSpec,
    /// Alert routing
    pub alerting: AlertingSpec,
}

impl Default for MonitoringSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_endpoint: MetricsEndpointSpec::default(),
            alerting: AlertingSpec::default(),
        }
    }
}

/// Metrics endpoint
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsEndpointSpec {
    /// Metrics port
    pub port: u16,
    /// Metrics path
    pub path: String,
}

impl Default for MetricsEndpointSpec {
    fn default() -> Self {
        Self {
            port: 26660,
            path: "/metrics".to_string(),
        }
    }
}

/// Alert routing
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertingSpec {
    /// Whether alerts are routed
    pub enabled: bool,
    /// Destination (e.g., a webhook URL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

// =============================================================================
// Upgrade
// =============================================================================

/// How image changes are rolled out
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStrategy {
    /// Roll out automatically
    #[default]
    Rolling,
    /// Roll out automatically
    Recreate,
    /// Hold image changes until the strategy is switched
    Manual,
}

/// Upgrade policy
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeSpec {
    /// Rollout strategy for image changes
    pub strategy: UpgradeStrategy,
    /// Follow upstream releases
    pub auto_upgrade: bool,
    /// Back up data before upgrading
    pub pre_upgrade_backup: bool,
    /// Roll back when the new version fails
    pub rollback_on_failure: bool,
}

impl Default for UpgradeSpec {
    fn default() -> Self {
        Self {
            strategy: UpgradeStrategy::Rolling,
            auto_upgrade: false,
            pre_upgrade_backup: true,
            rollback_on_failure: true,
        }
    }
}

// =============================================================================
// Security
// =============================================================================

/// Where node credentials come from
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SecretProvider {
    /// Operator-generated Secret with placeholder passphrases
    #[default]
    Kubernetes,
    /// Secret synced from Vault
    Vault,
    /// Secret synced from AWS Secrets Manager
    AwsSecretsManager,
}

impl SecretProvider {
    /// Returns true when credentials are supplied from outside the operator
    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Kubernetes)
    }
}

/// Secret management
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretManagementSpec {
    /// Credential source
    pub provider: SecretProvider,
    /// Name of the externally supplied Secret (required for external providers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Rotate credentials automatically
    pub auto_rotation: bool,
}

/// Pod-level security settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SecuritySpec {
    /// Pod security context passed through to the pod spec
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,
    /// Isolate the node with network policies
    pub network_isolation: bool,
    /// Credential management
    pub secret_management: SecretManagementSpec,
}

impl Default for SecuritySpec {
    fn default() -> Self {
        Self {
            pod_security_context: None,
            network_isolation: true,
            secret_management: SecretManagementSpec::default(),
        }
    }
}

// =============================================================================
// Status types
// =============================================================================

/// Lifecycle phase of a ManagedNode
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum NodePhase {
    /// Accepted, nothing created yet
    #[default]
    Pending,
    /// Dependent objects exist, no pod scheduled
    Initializing,
    /// Pod running, not yet ready
    Syncing,
    /// At least one ready replica
    Running,
    /// A new image is rolling out
    Upgrading,
    /// The spec cannot be reconciled
    Failed,
}

impl NodePhase {
    /// Name as written to status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Initializing => "Initializing",
            Self::Syncing => "Syncing",
            Self::Running => "Running",
            Self::Upgrading => "Upgrading",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition status
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not known
    #[default]
    Unknown,
}

/// A status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, UpgradePending)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition's status changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True when both conditions say the same thing, ignoring timestamps
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Chain sync progress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    /// Latest block the node has committed
    pub current_height: u64,
    /// Highest block height observed so far
    pub latest_height: u64,
    /// Whether the node reports it is still catching up
    pub catching_up: bool,
    /// When the committed height last advanced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Peer and identity information
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    /// Connected peers
    pub peer_count: u32,
    /// Node ID reported by the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Network from the spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// Validator signing information
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorInfo {
    /// Consensus address
    pub address: String,
    /// Voting power
    pub voting_power: u64,
    /// Blocks missed in the signing window
    pub missed_blocks: u64,
    /// Last height this validator signed
    pub last_signed_height: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod node_kind {
        use super::*;

        #[test]
        fn test_from_str_case_insensitive() {
            assert_eq!("Validator".parse::<NodeKind>().unwrap(), NodeKind::Validator);
            assert_eq!("SEED".parse::<NodeKind>().unwrap(), NodeKind::Seed);
            assert!("archive".parse::<NodeKind>().is_err());
        }

        #[test]
        fn test_default_is_observer() {
            assert_eq!(NodeKind::default(), NodeKind::Observer);
            assert!(!NodeKind::default().is_validator());
        }

        #[test]
        fn test_serde_lowercase() {
            let json = serde_json::to_string(&NodeKind::Sentry).unwrap();
            assert_eq!(json, "\"sentry\"");
        }
    }

    mod network {
        use super::*;

        #[test]
        fn test_chain_ids() {
            assert_eq!(Network::Mainnet.chain_id(), "axelar-dojo-1");
            assert_eq!(Network::Testnet.chain_id(), "axelar-testnet-lisbon-3");
        }

        #[test]
        fn test_roundtrip_display() {
            for network in [Network::Mainnet, Network::Testnet] {
                assert_eq!(network.to_string().parse::<Network>().unwrap(), network);
            }
        }
    }

    mod defaults {
        use super::*;

        #[test]
        fn test_partial_networking_keeps_other_defaults() {
            let spec: NetworkingSpec =
                serde_json::from_str(r#"{"p2p":{"seeds":["abc@seed.example:26656"]}}"#).unwrap();
            assert_eq!(spec.p2p.port, 26656);
            assert_eq!(spec.p2p.seeds.len(), 1);
            assert_eq!(spec.rpc.port, 26657);
            assert!(spec.api.enabled);
        }

        #[test]
        fn test_secret_provider_kebab_case() {
            let p: SecretProvider = serde_json::from_str("\"aws-secrets-manager\"").unwrap();
            assert_eq!(p, SecretProvider::AwsSecretsManager);
            assert!(p.is_external());
            assert!(!SecretProvider::Kubernetes.is_external());
        }

        #[test]
        fn test_image_reference() {
            assert_eq!(ImageSpec::default().reference(), "axelarnet/axelar-core:v0.35.5");
        }
    }

    #[test]
    fn condition_same_state_ignores_timestamp() {
        let a = Condition::new("Ready", ConditionStatus::True, "Converged", "ok");
        let mut b = a.clone();
        b.last_transition_time = a.last_transition_time - chrono::Duration::seconds(30);
        assert!(a.same_state(&b));
        b.status = ConditionStatus::False;
        assert!(!a.same_state(&b));
    }
}
