//! Controller runner - builds the LensUser controller future and gates it
//! behind the leader lease

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use usermanager_common::crd::LensUser;
use usermanager_common::leader_election::{run_as_leader, LeaderElector};
use usermanager_common::Error;
use usermanager_identity::{error_policy, reconcile, Context};

/// Watcher timeout (seconds), kept below the client read timeout (30s) so the
/// API server closes idle watches first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the LensUser controller.
///
/// The future completes when the process receives a shutdown signal.
pub fn build_lens_user_controller(
    client: Client,
    ctx: Arc<Context>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let users: Api<LensUser> = Api::all(client);

    tracing::info!("- LensUser controller");

    Box::pin(
        Controller::new(users, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("LensUser")),
    )
}

/// Run `controller`, first winning the lease when `elector` is set.
///
/// Losing the lease ends the run with an error so the process restarts as a
/// standby instead of reconciling alongside the new leader.
pub async fn run_controller<F>(
    controller: F,
    elector: Option<Arc<LeaderElector>>,
) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    match elector {
        Some(elector) => {
            tracing::info!(identity = %elector.identity(), "waiting for leader lease");
            run_as_leader(elector, controller).await
        }
        None => {
            tracing::warn!("leader election disabled; run a single replica");
            controller.await;
            Ok(())
        }
    }
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
