//! Leader election over a `coordination.k8s.io/v1` Lease
//!
//! Several operator replicas may run, but only the lease holder runs the
//! LensUser controller, so two replicas never reconcile the same user at
//! once.
//!
//! Every write carries the resourceVersion that was read. If the lease changed
//! in between, the API server answers 409 and the attempt counts as lost.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Lease shared by all operator replicas
pub const LEADER_LEASE_NAME: &str = "usermanager-leader";

/// Lease timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseTiming {
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How often the holder renews
    pub renew_interval: Duration,
    /// How often a standby retries
    pub retry_interval: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Reads and writes the one Lease object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Current lease, `None` when absent
    async fn get(&self) -> Result<Option<Lease>, Error>;
    /// Create the lease; 409 when someone else created it first
    async fn create(&self, lease: &Lease) -> Result<(), Error>;
    /// Replace the lease; 409 when its resourceVersion is stale
    async fn replace(&self, lease: &Lease) -> Result<(), Error>;
}

/// [`LeaseStore`] backed by the API server
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseStore {
    /// Store for lease `name` in `namespace`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<Lease>, Error> {
        Ok(self.api.get_opt(&self.name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<(), Error> {
        self.api.create(&PostParams::default(), lease).await?;
        Ok(())
    }

    async fn replace(&self, lease: &Lease) -> Result<(), Error> {
        self.api
            .replace(&self.name, &PostParams::default(), lease)
            .await?;
        Ok(())
    }
}

/// Write needed to hold the lease, decided from what was read
#[derive(Clone, Debug, PartialEq)]
enum Claim {
    /// No lease yet
    Create(Lease),
    /// We hold it; bump renewTime
    Renew(Lease),
    /// Holder let it expire
    TakeOver(Lease),
    /// Someone else holds a live lease
    HeldElsewhere(String),
}

fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => {
            now > renewed.0 + chrono::Duration::seconds(i64::from(secs))
        }
        _ => true,
    }
}

/// Campaigns for and keeps the operator lease
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    lease_name: String,
    namespace: String,
    identity: String,
    timing: LeaseTiming,
}

impl LeaderElector {
    /// Elector for `identity` (usually the pod name)
    pub fn new(
        store: Arc<dyn LeaseStore>,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        timing: LeaseTiming,
    ) -> Self {
        Self {
            store,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            timing,
        }
    }

    /// This replica's holder identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn spec_at(
        &self,
        now: DateTime<Utc>,
        acquired: Option<MicroTime>,
        transitions: i32,
    ) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.timing.lease_duration.as_secs() as i32),
            acquire_time: Some(acquired.unwrap_or(MicroTime(now))),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    fn claim(&self, existing: Option<Lease>, now: DateTime<Utc>) -> Claim {
        let Some(mut lease) = existing else {
            return Claim::Create(Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(self.spec_at(now, None, 0)),
            });
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let transitions = spec.lease_transitions.unwrap_or(0);
        match spec.holder_identity.as_deref() {
            Some(holder) if holder == self.identity => {
                lease.spec = Some(self.spec_at(now, spec.acquire_time, transitions));
                Claim::Renew(lease)
            }
            Some(holder) if !lease_expired(&spec, now) => Claim::HeldElsewhere(holder.to_string()),
            _ => {
                lease.spec = Some(self.spec_at(now, None, transitions + 1));
                Claim::TakeOver(lease)
            }
        }
    }

    /// One acquire-or-renew round; `Ok(true)` while we hold the lease
    pub async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let existing = self.store.get().await?;
        let (outcome, write) = match self.claim(existing, Utc::now()) {
            Claim::HeldElsewhere(holder) => {
                debug!(identity = %self.identity, %holder, "lease held by another replica");
                return Ok(false);
            }
            Claim::Create(lease) => ("created", self.store.create(&lease).await),
            Claim::Renew(lease) => ("renewed", self.store.replace(&lease).await),
            Claim::TakeOver(lease) => ("took over", self.store.replace(&lease).await),
        };
        match write {
            Ok(()) => {
                debug!(identity = %self.identity, outcome, "lease write succeeded");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => {
                debug!(identity = %self.identity, outcome, "lease changed underneath us");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait until this replica holds the lease, then keep renewing it
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(identity = %self.identity, error = %e, "lease campaign failed, retrying"),
            }
            tokio::time::sleep(self.timing.retry_interval).await;
        }
        info!(identity = %self.identity, "leadership acquired");

        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(&self);
        let renewal_task = tokio::spawn(async move { elector.renew_until_lost(lost_tx).await });
        LeaderGuard {
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn renew_until_lost(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.timing.renew_interval).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.identity, "leadership lost to another replica");
                    break;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease renewal failed, giving up leadership");
                    break;
                }
            }
        }
        let _ = lost_tx.send(());
    }

    /// Hand the lease back so a standby can take over without waiting for expiry
    pub async fn release(&self) -> Result<(), Error> {
        let Some(mut lease) = self.store.get().await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = Some(MicroTime(
            Utc::now() - chrono::Duration::seconds(i64::from(
                spec.lease_duration_seconds.unwrap_or(0),
            ) + 1),
        ));
        self.store.replace(&lease).await?;
        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}

/// Held while this replica is leader; renewal stops when dropped
pub struct LeaderGuard {
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolve once leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

/// Run `work` only while holding the lease.
///
/// Returns `Ok(())` when `work` finishes (the lease is then released) and an
/// error when leadership is lost first, so the process can exit and rejoin as
/// a standby.
pub async fn run_as_leader<F>(elector: Arc<LeaderElector>, work: F) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    let mut guard = Arc::clone(&elector).acquire().await;
    let finished = tokio::select! {
        () = work => true,
        () = guard.lost() => false,
    };
    drop(guard);

    if !finished {
        return Err(Error::internal_with_context(
            "leader_election",
            format!("{} lost the {} lease", elector.identity(), elector.lease_name),
        ));
    }
    if let Err(e) = elector.release().await {
        warn!(identity = %elector.identity(), error = %e, "failed to release lease");
    }
    Ok(())
}
