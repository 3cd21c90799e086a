//! Node configuration generator
//!
//! Renders `app.toml` and `config.toml` from templates compiled into the
//! binary, and records the resolved chain ID and network alongside them.
//! String values are written as TOML basic strings so that monikers or
//! addresses with quotes cannot break the file.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use minijinja::{context, Environment};

use super::NodeIdentity;
use crate::crd::ManagedNodeSpec;
use crate::Error;

/// Application-level settings template
const APP_TEMPLATE: &str = include_str!("../../templates/app.toml.j2");

/// Consensus-engine settings template
const CONFIG_TEMPLATE: &str = include_str!("../../templates/config.toml.j2");

/// ConfigMap key holding application settings
pub const APP_TOML_KEY: &str = "app.toml";

/// ConfigMap key holding consensus-engine settings
pub const CONFIG_TOML_KEY: &str = "config.toml";

/// ConfigMap key holding the resolved chain ID
pub const CHAIN_ID_KEY: &str = "chain-id";

/// ConfigMap key holding the network name
pub const NETWORK_KEY: &str = "network";

/// Separator for peer and seed lists
const LIST_DELIMITER: &str = ",";

/// Quote a value as a TOML basic string
///
/// JSON string escapes are a subset of TOML basic string escapes.
fn toml_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn render(name: &str, template: &str, ctx: minijinja::Value) -> Result<String, Error> {
    let mut env = Environment::new();
    env.add_template(name, template)
        .map_err(|e| Error::internal("render", format!("invalid template {name}: {e}")))?;
    env.get_template(name)
        .and_then(|t| t.render(ctx))
        .map_err(|e| Error::internal("render", format!("failed to render {name}: {e}")))
}

/// Render `app.toml`
pub fn render_app_toml(spec: &ManagedNodeSpec) -> Result<String, Error> {
    render(
        APP_TOML_KEY,
        APP_TEMPLATE,
        context! {
            moniker => toml_string(&spec.moniker),
            pruning => toml_string(&spec.storage.pruning),
            telemetry => spec.monitoring.enabled,
            api_enabled => spec.networking.api.enabled,
            api_port => spec.networking.api.port,
        },
    )
}

/// Render `config.toml`
pub fn render_config_toml(spec: &ManagedNodeSpec) -> Result<String, Error> {
    let p2p = &spec.networking.p2p;
    render(
        CONFIG_TOML_KEY,
        CONFIG_TEMPLATE,
        context! {
            moniker => toml_string(&spec.moniker),
            rpc_port => spec.networking.rpc.port,
            cors => spec.networking.rpc.cors,
            p2p_port => p2p.port,
            external_address => toml_string(p2p.external_address.as_deref().unwrap_or_default()),
            persistent_peers => toml_string(&p2p.persistent_peers.join(LIST_DELIMITER)),
            seeds => toml_string(&p2p.seeds.join(LIST_DELIMITER)),
            prometheus => spec.monitoring.enabled,
            metrics_port => spec.monitoring.metrics_endpoint.port,
        },
    )
}

/// Generate the node's ConfigMap
pub fn generate(spec: &ManagedNodeSpec, identity: &NodeIdentity) -> Result<ConfigMap, Error> {
    let data = BTreeMap::from([
        (APP_TOML_KEY.to_string(), render_app_toml(spec)?),
        (CONFIG_TOML_KEY.to_string(), render_config_toml(spec)?),
        (CHAIN_ID_KEY.to_string(), spec.resolved_chain_id()),
        (NETWORK_KEY.to_string(), spec.network.to_string()),
    ]);

    Ok(ConfigMap {
        metadata: identity.object_meta(&identity.names.config),
        data: Some(data),
        ..Default::default()
    })
}
