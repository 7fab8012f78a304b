//! LensUser reconciliation
//!
//! Provisions a ServiceAccount, RoleBindings and a bearer token for each
//! `LensUser` and publishes the resulting kubeconfig as a `LuConfig`.

pub mod controller;
pub mod gateway;
pub mod publisher;
pub mod rolebinding;
pub mod token;

pub use controller::{error_policy, reconcile, Context};
pub use gateway::{ClusterGateway, KubeGateway};
pub use publisher::{ClusterCa, PublisherSettings};
pub use token::{TokenPayload, TokenSettings};
pub use usermanager_common::Error;
