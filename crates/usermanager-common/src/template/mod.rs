//! Manifest templates for the objects the controller creates
//!
//! Templates live in `templates/` and are embedded at compile time. They use
//! plain Jinja syntax and strict undefined handling, so a missing variable is a
//! render error rather than an empty string. Rendered YAML is parsed straight
//! into the typed `k8s-openapi` object.

mod error;

pub use error::TemplateError;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use minijinja::{context, Environment, UndefinedBehavior, Value};
use serde::de::DeserializeOwned;

use crate::crd::LuConfig;
use crate::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE};

/// ServiceAccount template loaded at compile time
const SERVICE_ACCOUNT_TEMPLATE: &str = include_str!("../../templates/service-account.yaml");

/// Token secret template loaded at compile time
const TOKEN_SECRET_TEMPLATE: &str = include_str!("../../templates/token-secret.yaml");

/// RoleBinding template loaded at compile time
const ROLE_BINDING_TEMPLATE: &str = include_str!("../../templates/role-binding.yaml");

/// LuConfig template loaded at compile time
const LU_CONFIG_TEMPLATE: &str = include_str!("../../templates/lu-config.yaml");

/// The embedded manifest templates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Template {
    /// Backing ServiceAccount
    ServiceAccount,
    /// Long-lived token secret
    TokenSecret,
    /// Namespaced RoleBinding to a ClusterRole
    RoleBinding,
    /// Published kubeconfig resource
    LuConfig,
}

impl Template {
    /// Template name used in errors
    pub fn name(self) -> &'static str {
        match self {
            Self::ServiceAccount => "service-account",
            Self::TokenSecret => "token-secret",
            Self::RoleBinding => "role-binding",
            Self::LuConfig => "lu-config",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Self::ServiceAccount => SERVICE_ACCOUNT_TEMPLATE,
            Self::TokenSecret => TOKEN_SECRET_TEMPLATE,
            Self::RoleBinding => ROLE_BINDING_TEMPLATE,
            Self::LuConfig => LU_CONFIG_TEMPLATE,
        }
    }
}

/// Substitutions for the LuConfig template
#[derive(Clone, Debug)]
pub struct KubeconfigParams<'a> {
    /// LensUser name; also the kubeconfig user name
    pub user: &'a str,
    /// LensUser namespace; also the context's default namespace
    pub namespace: &'a str,
    /// Cluster display name
    pub cluster_name: &'a str,
    /// API server URL
    pub server: &'a str,
    /// Base64 CA bundle; `None` renders `insecure-skip-tls-verify: true`
    pub ca_data: Option<&'a str>,
    /// Bearer token
    pub token: &'a str,
}

impl KubeconfigParams<'_> {
    /// Context name, `<user>@<cluster>`
    pub fn context_name(&self) -> String {
        format!("{}@{}", self.user, self.cluster_name)
    }
}

/// Renders the embedded manifests into typed Kubernetes objects
pub struct ManifestRenderer {
    env: Environment<'static>,
}

impl Default for ManifestRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestRenderer {
    /// Create a renderer with strict undefined handling
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Render `template` with `ctx` and parse the result as `T`.
    ///
    /// The managed-by label is added to `ctx`; every other variable must be
    /// supplied by the caller.
    pub fn render<T: DeserializeOwned>(
        &self,
        template: Template,
        ctx: Value,
    ) -> Result<T, TemplateError> {
        let ctx = context! {
            managed_by_label => LABEL_MANAGED_BY,
            managed_by => LABEL_MANAGED_BY_VALUE,
            ..ctx
        };
        let text = self
            .env
            .render_named_str(template.name(), template.source(), ctx)
            .map_err(|e| TemplateError::render(template.name(), e))?;
        serde_yaml::from_str(&text).map_err(|e| TemplateError::parse(template.name(), e.to_string()))
    }

    /// ServiceAccount named after the user
    pub fn service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<ServiceAccount, TemplateError> {
        self.render(
            Template::ServiceAccount,
            context! { name => name, target_namespace => namespace },
        )
    }

    /// Token secret bound to `service_account` via annotation
    pub fn token_secret(
        &self,
        secret_name: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<Secret, TemplateError> {
        self.render(
            Template::TokenSecret,
            context! {
                secret_name => secret_name,
                target_namespace => namespace,
                service_account => service_account,
            },
        )
    }

    /// RoleBinding of ClusterRole `role_name` to the user's ServiceAccount
    pub fn role_binding(
        &self,
        name: &str,
        namespace: &str,
        role_name: &str,
        sa_name: &str,
        sa_namespace: &str,
    ) -> Result<RoleBinding, TemplateError> {
        self.render(
            Template::RoleBinding,
            context! {
                name => name,
                target_namespace => namespace,
                role_name => role_name,
                sa_name => sa_name,
                sa_namespace => sa_namespace,
            },
        )
    }

    /// LuConfig carrying a single-context kubeconfig
    pub fn lu_config(&self, params: &KubeconfigParams<'_>) -> Result<LuConfig, TemplateError> {
        self.render(
            Template::LuConfig,
            context! {
                name => params.user,
                target_namespace => params.namespace,
                cluster_name => params.cluster_name,
                server => params.server,
                ca_data => params.ca_data,
                context_name => params.context_name(),
                token => params.token,
            },
        )
    }
}
