//! Controller wiring
//!
//! The ManagedNode controller watches every kind it creates, so a Deployment
//! turning ready or a deleted ConfigMap triggers a reconcile of the owning
//! node right away instead of at the next periodic requeue.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::node::{object_key, Context};
use crate::compiler::MANAGED_BY;
use crate::crd::ManagedNode;

/// Watcher timeout (seconds), below the client's 30s read timeout so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Label selector matching every object the controller generates
pub fn managed_selector() -> String {
    format!("app.kubernetes.io/managed-by={MANAGED_BY}")
}

/// Api over `K` limited to `namespace`, or across the cluster
pub fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// ManagedNode controller that also reacts to changes in owned objects
///
/// Owned kinds are watched through the managed-by label only, so unrelated
/// Secrets and ConfigMaps never enter the cache.
pub fn node_controller(client: Client, namespace: Option<&str>) -> Controller<ManagedNode> {
    let primary = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let owned = || {
        WatcherConfig::default()
            .timeout(WATCH_TIMEOUT_SECS)
            .labels(&managed_selector())
    };

    Controller::new(scoped_api::<ManagedNode>(client.clone(), namespace), primary)
        .owns(scoped_api::<Deployment>(client.clone(), namespace), owned())
        .owns(scoped_api::<Service>(client.clone(), namespace), owned())
        .owns(scoped_api::<ConfigMap>(client.clone(), namespace), owned())
        .owns(scoped_api::<Secret>(client.clone(), namespace), owned())
        .owns(scoped_api::<PersistentVolumeClaim>(client, namespace), owned())
}

/// Periodically drop per-node bookkeeping for nodes gone from the cache
///
/// A node deleted without the finalizer never gets a final pass, so its
/// failure count and phase would otherwise stay in the context for good.
pub async fn evict_departed(store: Store<ManagedNode>, ctx: Arc<Context>, every: Duration) {
    if store.wait_until_ready().await.is_err() {
        warn!("ManagedNode cache closed before it was ready");
        return;
    }
    let mut tick = tokio::time::interval(every);
    loop {
        tick.tick().await;
        let live: HashSet<String> = store.state().iter().map(|n| object_key(n)).collect();
        let evicted = ctx.retain_nodes(&live);
        if evicted > 0 {
            debug!(evicted, "forgot departed nodes");
        }
    }
}
