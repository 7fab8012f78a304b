//! LuConfig CRD: the kubeconfig published for a LensUser
//!
//! The spec is a complete kubeconfig document (one cluster, one context, one
//! token user), so `kubectl get luconfig alice -o jsonpath='{.spec}'` yields a
//! file `kubectl --kubeconfig` accepts.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Kubeconfig document stored in a LuConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "osip.cc",
    version = "v1",
    kind = "LuConfig",
    plural = "luconfig",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct LuConfigSpec {
    /// Always "v1"
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Always "Config"
    pub kind: String,

    /// Cluster entries
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,

    /// Context entries
    #[serde(default)]
    pub contexts: Vec<NamedContext>,

    /// Name of the context selected by default
    #[serde(rename = "current-context")]
    pub current_context: String,

    /// User entries
    #[serde(default)]
    pub users: Vec<NamedUser>,
}

/// Cluster entry in kubeconfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster connection settings
    pub cluster: ClusterEntry,
}

/// Cluster connection settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    /// Skip server certificate verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_skip_tls_verify: Option<bool>,
}

/// Context entry in kubeconfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context binding
    pub context: ContextEntry,
}

/// Context binding of cluster, user and namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ContextEntry {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
    /// Default namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// User entry in kubeconfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// Credentials
    pub user: UserEntry,
}

/// User credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct UserEntry {
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl LuConfigSpec {
    /// The context named by `current-context`, if present
    pub fn current(&self) -> Option<&NamedContext> {
        self.contexts.iter().find(|c| c.name == self.current_context)
    }

    /// Bearer token of the user bound to the current context
    pub fn current_token(&self) -> Option<&str> {
        let ctx = self.current()?;
        self.users
            .iter()
            .find(|u| u.name == ctx.context.user)
            .and_then(|u| u.user.token.as_deref())
    }

    /// Serialize as a standalone kubeconfig file
    pub fn to_kubeconfig_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("LuConfig", e.to_string()))
    }
}
