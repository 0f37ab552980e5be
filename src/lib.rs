// Shipyard - Single-slot deployment orchestrator
//
// Licensed under the GNU General Public License v3.0

//! Shipyard deploys user-submitted web application repositories onto a
//! shared host. A deployment takes an uploaded secret bundle, stores it
//! encrypted under the user's key, clones and scans the repository, composes
//! the runtime settings, renders the container and proxy artifacts and brings
//! the services up. One orchestrator holds one live deployment.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Orchestrator configuration
pub mod config;

/// Secret bundle parsing
pub mod bundle;

/// External process execution
pub mod execution;

/// Security subsystem
pub mod security;

/// Network subsystem
pub mod network;

/// Repository staging
pub mod stage;

/// Web framework descriptors
pub mod framework;

/// Settings composition
pub mod settings;

/// Artifact rendering
pub mod render;

/// Container toolchain
pub mod container;

/// Service interface
pub mod service;

// Re-export common types
pub use bundle::{SecretBundle, SettingsMap};
pub use config::{ConfigManager, OrchestratorConfig};
pub use service::{DeployError, DeployParams, LifecycleManager, Service};
