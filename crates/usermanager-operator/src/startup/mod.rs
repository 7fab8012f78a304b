//! Startup utilities for the usermanager operator

mod crds;

pub use crds::{crd_manifests, ensure_crds_installed};
