//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;

use usermanager_common::telemetry::{LogFormat, TelemetryConfig};
use usermanager_identity::publisher::{DEFAULT_API_SERVER_URL, DEFAULT_CLUSTER_NAME};
use usermanager_identity::{PublisherSettings, TokenSettings};

/// usermanager - turns LensUser resources into scoped kubeconfigs
#[derive(Parser, Debug, Clone)]
#[command(name = "usermanager", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Kubeconfig to use instead of in-cluster configuration
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Cluster name written into published kubeconfigs
    #[arg(long, env = "CLUSTER_NAME", default_value = DEFAULT_CLUSTER_NAME)]
    pub cluster_name: String,

    /// API server URL written into published kubeconfigs
    #[arg(long, env = "KUBE_API_URL", default_value = DEFAULT_API_SERVER_URL)]
    pub api_server_url: String,

    /// Seconds to wait for a token secret to be populated
    #[arg(long, env = "TOKEN_WAIT_SECS", default_value_t = 30)]
    pub token_wait_secs: u64,

    /// Seconds between token secret reads
    #[arg(long, env = "TOKEN_POLL_INTERVAL_SECS", default_value_t = 2)]
    pub token_poll_interval_secs: u64,

    /// PEM CA bundle to publish instead of the token secret's ca.crt
    #[arg(long, env = "CLUSTER_CA_FILE")]
    pub cluster_ca_file: Option<PathBuf>,

    /// Publish kubeconfigs that skip server certificate verification
    #[arg(long, env = "INSECURE_SKIP_TLS_VERIFY")]
    pub insecure_skip_tls_verify: bool,

    /// Log output format: json or text
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Run the controller without taking the leader lease (single replica only)
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    pub disable_leader_election: bool,

    /// Namespace holding the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub lease_namespace: String,

    /// Lease holder identity, normally the pod name
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,
}

impl Cli {
    /// Logging configuration
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            format: self.log_format,
            ..Default::default()
        }
    }

    /// Identity written into the leader lease
    pub fn lease_identity(&self) -> String {
        self.pod_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("usermanager-{}", std::process::id()))
    }

    /// Token wait bounds
    pub fn token_settings(&self) -> anyhow::Result<TokenSettings> {
        if self.token_poll_interval_secs == 0 {
            anyhow::bail!("TOKEN_POLL_INTERVAL_SECS must be at least 1");
        }
        Ok(TokenSettings {
            max_wait: Duration::from_secs(self.token_wait_secs),
            poll_interval: Duration::from_secs(self.token_poll_interval_secs),
        })
    }

    /// Cluster metadata for published kubeconfigs, reading the CA file if set
    pub fn publisher_settings(&self) -> anyhow::Result<PublisherSettings> {
        if self.cluster_name.trim().is_empty() {
            anyhow::bail!("CLUSTER_NAME must not be empty");
        }
        if self.api_server_url.trim().is_empty() {
            anyhow::bail!("KUBE_API_URL must not be empty");
        }
        let ca_bundle = match &self.cluster_ca_file {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read CA bundle {}", path.display()))?,
            ),
            None => None,
        };
        Ok(PublisherSettings {
            cluster_name: self.cluster_name.clone(),
            api_server_url: self.api_server_url.clone(),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
            ca_bundle,
        })
    }
}
