//! In-memory API server for reconciler tests
//!
//! Stores dependents by kind and name, enforces resourceVersion on replace
//! and counts every mutating call, which is what idempotence tests assert on.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DeploymentStatus;

use super::client::{Dependent, DependentKind, KubeClient};
use crate::crd::ManagedNodeStatus;
use crate::Error;

#[derive(Default)]
struct State {
    objects: BTreeMap<(DependentKind, String), Dependent>,
    version: u64,
    writes: usize,
    finalizers: Vec<String>,
    statuses: Vec<ManagedNodeStatus>,
    fail_creates_of: Option<DependentKind>,
    fail_deletes: bool,
    replicas: Option<(i32, i32)>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn apply_replicas(&mut self) {
        let Some((replicas, ready)) = self.replicas else {
            return;
        };
        for object in self.objects.values_mut() {
            if let Dependent::Deployment(d) = object {
                d.status = Some(DeploymentStatus {
                    observed_generation: d.metadata.generation,
                    replicas: Some(replicas),
                    ready_replicas: Some(ready),
                    updated_replicas: Some(replicas),
                    ..Default::default()
                });
            }
        }
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutating calls so far, status patches included
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn object(&self, kind: DependentKind, name: &str) -> Option<Dependent> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(kind, name.to_string()))
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.state.lock().unwrap().finalizers.clone()
    }

    pub fn last_status(&self) -> Option<ManagedNodeStatus> {
        self.state.lock().unwrap().statuses.last().cloned()
    }

    /// Store an object as if someone else created it
    pub fn insert(&self, mut object: Dependent) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let meta = object.metadata_mut();
        meta.resource_version = Some(version);
        meta.generation = Some(1);
        state
            .objects
            .insert((object.kind(), object.name().to_string()), object);
        state.apply_replicas();
    }

    /// Make every Deployment report these counts from now on
    pub fn report_replicas(&self, replicas: i32, ready: i32) {
        let mut state = self.state.lock().unwrap();
        state.replicas = Some((replicas, ready));
        state.apply_replicas();
    }

    pub fn fail_creates_of(&self, kind: DependentKind) {
        self.state.lock().unwrap().fail_creates_of = Some(kind);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn get(
        &self,
        _namespace: &str,
        kind: DependentKind,
        name: &str,
    ) -> Result<Option<Dependent>, Error> {
        Ok(self.object(kind, name))
    }

    async fn create(&self, _namespace: &str, object: &Dependent) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let kind = object.kind();
        if state.fail_creates_of == Some(kind) {
            return Err(Error::apply(kind.as_str(), object.name(), "admission webhook denied the request"));
        }
        let key = (kind, object.name().to_string());
        if state.objects.contains_key(&key) {
            return Err(Error::conflict(kind.as_str(), object.name(), "already exists"));
        }

        let mut stored = object.clone();
        let version = state.next_version();
        let meta = stored.metadata_mut();
        meta.resource_version = Some(version);
        meta.generation = Some(1);
        state.objects.insert(key, stored);
        state.writes += 1;
        state.apply_replicas();
        Ok(())
    }

    async fn replace(&self, _namespace: &str, object: &Dependent) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let kind = object.kind();
        let key = (kind, object.name().to_string());
        let Some(current) = state.objects.get(&key) else {
            return Err(Error::apply(kind.as_str(), object.name(), "not found"));
        };
        if current.metadata().resource_version != object.metadata().resource_version {
            return Err(Error::conflict(kind.as_str(), object.name(), "object has been modified"));
        }
        let generation = current.metadata().generation.unwrap_or(1) + 1;

        let mut stored = object.clone();
        let version = state.next_version();
        let meta = stored.metadata_mut();
        meta.resource_version = Some(version);
        meta.generation = Some(generation);
        state.objects.insert(key, stored);
        state.writes += 1;
        state.apply_replicas();
        Ok(())
    }

    async fn delete(
        &self,
        _namespace: &str,
        kind: DependentKind,
        name: &str,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(Error::apply(kind.as_str(), name, "etcd unavailable"));
        }
        let removed = state.objects.remove(&(kind, name.to_string())).is_some();
        if removed {
            state.writes += 1;
        }
        Ok(removed)
    }

    async fn add_finalizer(
        &self,
        _namespace: &str,
        _name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.finalizers.iter().any(|f| f == finalizer) {
            state.finalizers.push(finalizer.to_string());
            state.writes += 1;
        }
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        _namespace: &str,
        _name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let before = state.finalizers.len();
        state.finalizers.retain(|f| f != finalizer);
        if state.finalizers.len() != before {
            state.writes += 1;
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &ManagedNodeStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.statuses.push(status.clone());
        state.writes += 1;
        Ok(())
    }
}
