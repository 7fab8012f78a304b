//! usermanager - provisions scoped kubeconfigs for LensUser resources

use std::sync::Arc;

use clap::Parser;

use usermanager_common::kube_utils::create_client;
use usermanager_common::leader_election::{
    KubeLeaseStore, LeaderElector, LeaseTiming, LEADER_LEASE_NAME,
};
use usermanager_common::telemetry::init_telemetry;
use usermanager_identity::Context;
use usermanager_operator::config::Cli;
use usermanager_operator::controller_runner::{build_lens_user_controller, run_controller};
use usermanager_operator::startup::{crd_manifests, ensure_crds_installed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(cli.telemetry_config())?;

    let token = cli.token_settings()?;
    let publisher = cli.publisher_settings()?;
    tracing::info!(
        cluster = %publisher.cluster_name,
        server = %publisher.api_server_url,
        insecure = publisher.insecure_skip_tls_verify,
        ca_file = ?cli.cluster_ca_file,
        token_wait = ?token.max_wait,
        "starting usermanager"
    );

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(Context::new(client.clone(), token, publisher));
    let elector = (!cli.disable_leader_election).then(|| {
        let store = KubeLeaseStore::new(client.clone(), &cli.lease_namespace, LEADER_LEASE_NAME);
        Arc::new(LeaderElector::new(
            Arc::new(store),
            LEADER_LEASE_NAME,
            &cli.lease_namespace,
            &cli.lease_identity(),
            LeaseTiming::default(),
        ))
    });
    run_controller(build_lens_user_controller(client, ctx), elector).await?;

    tracing::info!("usermanager shut down");
    Ok(())
}
