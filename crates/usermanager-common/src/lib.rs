//! Common types for the user manager: CRDs, errors, templates and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod telemetry;
pub mod template;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher};

/// Field manager used for every patch issued by the operator
pub const FIELD_MANAGER: &str = "usermanager-controller";

/// Finalizer guarding LensUser deletion until cluster objects are cleaned up
pub const LENS_USER_FINALIZER: &str = "osip.cc/lensuser-cleanup";

/// Secret type carrying a long-lived service account token
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Annotation binding a token secret to its service account
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// Data key holding the bearer token in a token secret
pub const TOKEN_KEY: &str = "token";

/// Data key holding the cluster CA bundle in a token secret
pub const CA_CERT_KEY: &str = "ca.crt";

/// Label key marking objects created by the operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_VALUE: &str = "kube-user-manage";

/// Name of the token secret synthesized for a user
pub fn token_secret_name(user: &str) -> String {
    format!("{}-token", user)
}
