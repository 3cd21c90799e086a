//! Lease-based leader election
//!
//! When the controller runs with more than one replica only the holder of the
//! `nodeops-leader` Lease reconciles. Writes to the Lease carry the observed
//! resourceVersion, so two candidates racing for an expired lease cannot both
//! win: the loser gets a 409 and goes back to waiting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Error;

/// Name of the Lease object used for election
pub const LEASE_NAME: &str = "nodeops-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What a candidate should do after reading the Lease
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaseDecision {
    /// No Lease exists yet
    Create,
    /// We already hold it
    Renew,
    /// Someone else held it but stopped renewing
    TakeOver { transitions: i32 },
    /// Held by a live peer
    Wait,
}

fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseDecision::Renew;
    }

    let expired = match (
        spec.and_then(|s| s.renew_time.as_ref()),
        spec.and_then(|s| s.lease_duration_seconds),
    ) {
        (Some(renewed), Some(secs)) => {
            now > renewed.0 + chrono::Duration::seconds(i64::from(secs))
        }
        _ => true,
    };
    let vacant = spec.and_then(|s| s.holder_identity.as_ref()).is_none();

    if expired || vacant {
        LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseDecision::Wait
    }
}

/// Competes for the controller Lease
pub struct LeaderElector {
    api: Api<Lease>,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create an elector for `identity` (normally the pod name) in `namespace`
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Wait until this replica holds the Lease
    ///
    /// The returned guard keeps renewing in the background and reports
    /// through [`LeaderGuard::lost`] when renewal fails.
    pub async fn acquire(self) -> LeaderGuard {
        info!(identity = %self.identity, lease = LEASE_NAME, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => debug!(identity = %self.identity, "Lease held by a peer"),
                Err(e) => warn!(identity = %self.identity, error = %e, "Lease acquisition failed"),
            }
            tokio::time::sleep(self.retry_interval).await;
        }
        info!(identity = %self.identity, "Leadership acquired");

        let elector = Arc::new(self);
        let (lost_tx, lost_rx) = watch::channel(false);
        let renewer = Arc::clone(&elector);
        let renewal = tokio::spawn(async move {
            loop {
                tokio::time::sleep(renewer.renew_interval).await;
                match renewer.try_acquire_or_renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(identity = %renewer.identity, "Lease taken by a peer");
                        break;
                    }
                    Err(e) => {
                        warn!(identity = %renewer.identity, error = %e, "Lease renewal failed");
                        break;
                    }
                }
            }
            let _ = lost_tx.send(true);
        });

        LeaderGuard {
            elector,
            renewal,
            lost: lost_rx,
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let now = Utc::now();
        let existing = self.api.get_opt(LEASE_NAME).await?;

        let lease = match decide(existing.as_ref(), &self.identity, now) {
            LeaseDecision::Wait => return Ok(false),
            LeaseDecision::Create => self.lease_for(None, now, 0),
            LeaseDecision::Renew => {
                let mut lease = existing.unwrap_or_default();
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                lease
            }
            LeaseDecision::TakeOver { transitions } => {
                let version = existing.and_then(|l| l.metadata.resource_version);
                self.lease_for(version, now, transitions + 1)
            }
        };

        let write = if lease.metadata.resource_version.is_none() {
            self.api.create(&PostParams::default(), &lease).await
        } else {
            self.api
                .replace(LEASE_NAME, &PostParams::default(), &lease)
                .await
        };
        match write {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn lease_for(
        &self,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn release(&self) -> Result<(), Error> {
        let Some(mut lease) = self.api.get_opt(LEASE_NAME).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        self.api
            .replace(LEASE_NAME, &PostParams::default(), &lease)
            .await?;
        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Held while this replica is the leader
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    lost: watch::Receiver<bool>,
}

impl LeaderGuard {
    /// Resolves once the Lease could not be renewed
    pub async fn lost(&mut self) {
        let _ = self.lost.wait_for(|lost| *lost).await;
    }

    /// Stop renewing and hand the Lease back so a standby can take over at once
    pub async fn release(self) {
        self.renewal.abort();
        if let Err(e) = self.elector.release().await {
            warn!(error = %e, "Failed to release lease");
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(30),
                renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn missing_lease_is_created() {
        assert_eq!(decide(None, "pod-a", Utc::now()), LeaseDecision::Create);
    }

    #[test]
    fn own_lease_is_renewed() {
        let l = lease(Some("pod-a"), 5, 2);
        assert_eq!(decide(Some(&l), "pod-a", Utc::now()), LeaseDecision::Renew);
    }

    #[test]
    fn live_peer_blocks_acquisition() {
        let l = lease(Some("pod-b"), 5, 2);
        assert_eq!(decide(Some(&l), "pod-a", Utc::now()), LeaseDecision::Wait);
    }

    #[test]
    fn expired_peer_lease_is_taken_over() {
        let l = lease(Some("pod-b"), 45, 2);
        assert_eq!(
            decide(Some(&l), "pod-a", Utc::now()),
            LeaseDecision::TakeOver { transitions: 2 }
        );
    }

    #[test]
    fn released_lease_is_taken_over_immediately() {
        let l = lease(None, 1, 3);
        assert_eq!(
            decide(Some(&l), "pod-a", Utc::now()),
            LeaseDecision::TakeOver { transitions: 3 }
        );
    }

    #[test]
    fn lease_without_timing_counts_as_expired() {
        let l = Lease {
            spec: Some(LeaseSpec {
                holder_identity: Some("pod-b".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            decide(Some(&l), "pod-a", Utc::now()),
            LeaseDecision::TakeOver { transitions: 0 }
        );
    }
}
