//! Custom Resource Definitions for the user manager
//!
//! `LensUser` is the user-facing input; `LuConfig` is derived output written
//! by the controller.

mod lens_user;
mod lu_config;
mod types;

pub use lens_user::{LensUser, LensUserSpec, LensUserStatus, RoleGrant, UserPhase};
pub use lu_config::{
    ClusterEntry, ContextEntry, LuConfig, LuConfigSpec, NamedCluster, NamedContext, NamedUser,
    UserEntry,
};
pub use types::{Condition, ConditionStatus};
