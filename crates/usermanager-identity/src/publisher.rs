//! LuConfig publishing
//!
//! Builds the single-context kubeconfig for a user and upserts it as the
//! user's `LuConfig`. An existing object keeps its metadata (and so its
//! resourceVersion and uid); only the spec is replaced.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::{debug, info};

use usermanager_common::crd::LuConfig;
use usermanager_common::template::{KubeconfigParams, ManifestRenderer};

use crate::gateway::ClusterGateway;
use crate::Error;

/// Default cluster display name
pub const DEFAULT_CLUSTER_NAME: &str = "kubernetes";

/// Default API server URL, the in-cluster service
pub const DEFAULT_API_SERVER_URL: &str = "https://kubernetes.default.svc";

/// Cluster metadata written into every published kubeconfig
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublisherSettings {
    /// Cluster display name, also the context suffix
    pub cluster_name: String,
    /// API server URL users connect to
    pub api_server_url: String,
    /// Publish `insecure-skip-tls-verify: true` instead of CA data
    pub insecure_skip_tls_verify: bool,
    /// Operator-supplied CA bundle (PEM), preferred over the token secret's
    pub ca_bundle: Option<Vec<u8>>,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            api_server_url: DEFAULT_API_SERVER_URL.to_string(),
            insecure_skip_tls_verify: false,
            ca_bundle: None,
        }
    }
}

/// How clients should verify the API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterCa {
    /// PEM bundle to embed as `certificate-authority-data`
    Data(Vec<u8>),
    /// Skip verification
    InsecureSkipVerify,
}

impl PublisherSettings {
    /// Pick the CA for `user`: insecure flag, then the configured bundle,
    /// then `holder_ca` from the token secret.
    pub fn resolve_ca(&self, user: &str, holder_ca: Option<&[u8]>) -> Result<ClusterCa, Error> {
        if self.insecure_skip_tls_verify {
            return Ok(ClusterCa::InsecureSkipVerify);
        }
        if let Some(bundle) = self.ca_bundle.as_ref().filter(|b| !b.is_empty()) {
            return Ok(ClusterCa::Data(bundle.clone()));
        }
        match holder_ca.filter(|b| !b.is_empty()) {
            Some(ca) => Ok(ClusterCa::Data(ca.to_vec())),
            None => Err(Error::endpoint(
                user,
                "unresolvable cluster CA: token secret has no ca.crt; configure CLUSTER_CA_FILE or INSECURE_SKIP_TLS_VERIFY",
            )),
        }
    }

    fn validate(&self, user: &str) -> Result<(), Error> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::endpoint(user, "cluster name is empty; set CLUSTER_NAME"));
        }
        if self.api_server_url.trim().is_empty() {
            return Err(Error::endpoint(user, "API server URL is empty; set KUBE_API_URL"));
        }
        Ok(())
    }
}

/// Render the `LuConfig` for `user` in `namespace`
pub fn build_config(
    renderer: &ManifestRenderer,
    user: &str,
    namespace: &str,
    settings: &PublisherSettings,
    ca: &ClusterCa,
    token: &str,
) -> Result<LuConfig, Error> {
    settings.validate(user)?;
    let ca_data = match ca {
        ClusterCa::Data(bytes) => Some(STANDARD.encode(bytes)),
        ClusterCa::InsecureSkipVerify => None,
    };
    let params = KubeconfigParams {
        user,
        namespace,
        cluster_name: &settings.cluster_name,
        server: &settings.api_server_url,
        ca_data: ca_data.as_deref(),
        token,
    };
    Ok(renderer.lu_config(&params)?)
}

/// Create or replace the user's `LuConfig`.
///
/// `owner` is attached only when the object is created.
pub async fn publish(
    gateway: &dyn ClusterGateway,
    mut config: LuConfig,
    owner: Option<OwnerReference>,
) -> Result<LuConfig, Error> {
    let name = config
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::internal_with_context("publish", "rendered LuConfig has no name"))?;
    let namespace = config.metadata.namespace.clone().ok_or_else(|| {
        Error::internal_with_context("publish", "rendered LuConfig has no namespace")
    })?;

    match gateway.get_lu_config(&name, &namespace).await? {
        Some(existing) => {
            if existing.spec == config.spec {
                debug!(user = %name, "LuConfig already up to date");
                return Ok(existing);
            }
            config.metadata = existing.metadata;
            gateway.replace_lu_config(&name, &namespace, &config).await?;
            info!(user = %name, namespace = %namespace, "replaced LuConfig");
        }
        None => {
            if let Some(owner) = owner {
                config.metadata.owner_references = Some(vec![owner]);
            }
            gateway.create_lu_config(&namespace, &config).await?;
            info!(user = %name, namespace = %namespace, "created LuConfig");
        }
    }
    Ok(config)
}
