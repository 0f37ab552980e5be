// src/framework/mod.rs

//! Web-framework capabilities needed to compose settings.
//!
//! The orchestrator never looks inside a staged project directly; it asks a
//! [`FrameworkDescriptor`] to locate the project's configuration module, read
//! asset defaults from it and pin its host allowlist to the deployment host.

/// Django projects
pub mod django;

use std::path::{Path, PathBuf};

use crate::bundle::SettingsMap;
use crate::settings::ComposeError;

pub use django::DjangoDescriptor;

/// A framework configuration module found inside a staged project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkModule {
    /// Module name as given in the settings (`app.settings`)
    pub name: String,

    /// Source file of the module
    pub path: PathBuf,

    /// Source text at resolution time
    pub source: String,
}

/// URL prefix and on-disk directory of a class of served files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDefaults {
    /// URL prefix (`/static/`)
    pub url: String,

    /// Directory name, last path component only
    pub root: String,
}

/// What the pipeline needs to know about one web framework
pub trait FrameworkDescriptor: Send + Sync {
    /// Framework name for logs
    fn name(&self) -> &'static str;

    /// Locates the configuration module named in `settings` under `root`
    fn resolve_module(&self, root: &Path, settings: &SettingsMap) -> Result<FrameworkModule, ComposeError>;

    /// Top-level package of the module
    fn package_name(&self, module: &FrameworkModule) -> String;

    /// Static-file URL and directory
    fn static_defaults(&self, module: &FrameworkModule) -> AssetDefaults;

    /// Uploaded-media URL and directory
    fn media_defaults(&self, module: &FrameworkModule) -> AssetDefaults;

    /// Rewrites the module in place so it only accepts `host`
    fn rewrite_host_allowlist(&self, module: &FrameworkModule, host: &str) -> Result<(), ComposeError>;
}
