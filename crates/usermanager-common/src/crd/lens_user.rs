//! LensUser CRD: a declarative cluster user with a set of namespaced role grants
//!
//! Each LensUser is backed by a ServiceAccount of the same name, a long-lived
//! token secret, one RoleBinding per target namespace and a LuConfig holding
//! the ready-to-use kubeconfig.

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Error;

/// LensUser describes a user and the ClusterRoles it holds per namespace.
///
/// Example:
/// ```yaml
/// apiVersion: osip.cc/v1
/// kind: LensUser
/// metadata:
///   name: alice
///   namespace: kube-system
/// spec:
///   roles:
///     - name: view
///       namespace: team-a
///     - name: edit
///       namespace: team-b
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "osip.cc",
    version = "v1",
    kind = "LensUser",
    plural = "lensuser",
    shortname = "lu",
    namespaced,
    status = "LensUserStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Config","type":"string","jsonPath":".status.configName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LensUserSpec {
    /// Ordered role grants. Must not be empty.
    #[serde(default)]
    pub roles: Vec<RoleGrant>,

    /// Existing token secret to use instead of synthesizing `<name>-token`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<String>,
}

/// A ClusterRole granted to the user inside one namespace
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct RoleGrant {
    /// ClusterRole name (e.g. "view")
    pub name: String,
    /// Namespace the RoleBinding is created in
    pub namespace: String,
}

impl RoleGrant {
    /// Create a grant of `role` in `namespace`
    pub fn new(role: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: role.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for RoleGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.namespace)
    }
}

impl LensUserSpec {
    /// Validate the spec for the user named `user`.
    ///
    /// Rejects an empty role list and grants with blank role or namespace.
    pub fn validate(&self, user: &str) -> Result<(), Error> {
        if self.roles.is_empty() {
            return Err(Error::validation_for_field(
                user,
                "spec.roles",
                "roles must be set and contain at least one grant",
            ));
        }
        for (i, grant) in self.roles.iter().enumerate() {
            if grant.name.trim().is_empty() {
                return Err(Error::validation_for_field(
                    user,
                    format!("spec.roles[{}].name", i),
                    "role name cannot be empty",
                ));
            }
            if grant.namespace.trim().is_empty() {
                return Err(Error::validation_for_field(
                    user,
                    format!("spec.roles[{}].namespace", i),
                    "role namespace cannot be empty",
                ));
            }
        }
        if let Some(secret) = &self.token_secret_ref {
            if secret.trim().is_empty() {
                return Err(Error::validation_for_field(
                    user,
                    "spec.tokenSecretRef",
                    "token secret reference cannot be empty",
                ));
            }
        }
        Ok(())
    }
}

/// Lifecycle phase of a LensUser
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UserPhase {
    /// Not yet processed
    #[default]
    Pending,
    /// Cluster objects are being provisioned or updated
    Reconciling,
    /// ServiceAccount, bindings, token and LuConfig are in place
    Ready,
    /// A permanent error stopped provisioning
    Failed,
}

impl std::fmt::Display for UserPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Observed state of a LensUser
///
/// `appliedRoles` records the grant list last written to the cluster and is
/// the baseline the next spec change is diffed against.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LensUserStatus {
    /// Current phase
    #[serde(default)]
    pub phase: UserPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Grants currently reflected by RoleBindings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_roles: Option<Vec<RoleGrant>>,

    /// Backing ServiceAccount name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Token secret the published kubeconfig was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,

    /// Name of the published LuConfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,

    /// Generation of the spec this status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl LensUserStatus {
    /// Create a status with the given phase
    pub fn with_phase(phase: UserPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Replace the condition of the same type, or add it
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Record the grants applied to the cluster
    pub fn applied_roles(mut self, roles: Vec<RoleGrant>) -> Self {
        self.applied_roles = Some(roles);
        self
    }

    /// Record the observed spec generation
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

impl LensUser {
    /// Current phase, `Pending` when no status has been written
    pub fn phase(&self) -> UserPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Grants last applied to the cluster, if any
    pub fn applied_roles(&self) -> Option<&[RoleGrant]> {
        self.status
            .as_ref()
            .and_then(|s| s.applied_roles.as_deref())
    }

    /// Every namespace that may hold a RoleBinding for this user.
    ///
    /// Union of the desired grants and the grants last applied, sorted.
    pub fn binding_namespaces(&self) -> Vec<String> {
        let mut namespaces: BTreeSet<&str> = self
            .spec
            .roles
            .iter()
            .map(|g| g.namespace.as_str())
            .collect();
        if let Some(applied) = self.applied_roles() {
            namespaces.extend(applied.iter().map(|g| g.namespace.as_str()));
        }
        namespaces.into_iter().map(str::to_string).collect()
    }
}
