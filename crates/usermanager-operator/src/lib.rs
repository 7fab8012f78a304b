//! usermanager operator: configuration, CRD installation and the controller loop

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod config;
/// Controller construction
pub mod controller_runner;
/// Startup utilities (CRD install)
pub mod startup;
