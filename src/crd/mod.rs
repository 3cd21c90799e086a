//! Custom Resource Definitions for nodeops
//!
//! This module contains the ManagedNode CRD and the types it is built from.

mod node;
mod types;

pub use node::{ManagedNode, ManagedNodeSpec, ManagedNodeStatus};
pub use types::{
    default_signer_image, AlertingSpec, ApiSpec, BackupSpec, Condition, ConditionStatus,
    ImageSpec, KeyManagementSpec, MetricsEndpointSpec, MonitoringSpec, Network, NetworkInfo,
    NetworkingSpec, NodeKind, NodePhase, P2pSpec, PullPolicy, RpcSpec, SecretManagementSpec,
    SecretProvider, SecuritySpec, SlashingSpec, StorageSpec, SyncInfo, UpgradeSpec,
    UpgradeStrategy, ValidatorInfo, ValidatorSpec, MAINNET_CHAIN_ID, TESTNET_CHAIN_ID,
};
