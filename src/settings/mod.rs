// src/settings/mod.rs

//! Settings composition.
//!
//! Merges decrypted secrets, values read from the project's own
//! configuration module and values generated for this deployment (ports,
//! paths, names) into the map every artifact is rendered from.

use std::sync::Arc;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::bundle::{BundleError, SettingsMap};
use crate::config::{DeploymentConfig, TlsConfig};
use crate::framework::FrameworkDescriptor;
use crate::network::{PortAllocator, PortError, PortSet};
use crate::stage::{EscapedPath, StagedProject};

/// Bundle variable copied into the database root password
pub const DATABASE_PASSWORD: &str = "DATABASE_PASSWORD";

/// The settings of one deployment plus the ports it was given
#[derive(Debug, Clone)]
pub struct ComposedSettings {
    /// Merged settings
    pub settings: SettingsMap,

    /// Ports embedded in the settings
    pub ports: PortSet,

    /// Public host name of the deployment
    pub host: String,
}

/// Builds the final settings map of a deployment
pub struct SettingsComposer {
    /// Framework of the deployed projects
    framework: Arc<dyn FrameworkDescriptor>,

    /// Port source, queried on every composition
    ports: PortAllocator,

    /// TLS paths injected into every deployment
    tls: TlsConfig,

    /// Domain the subdomain is published under
    base_domain: String,
}

impl SettingsComposer {
    /// Creates a composer
    pub fn new(
        framework: Arc<dyn FrameworkDescriptor>,
        ports: PortAllocator,
        tls: TlsConfig,
        deployment: &DeploymentConfig,
    ) -> Self {
        Self {
            framework,
            ports,
            tls,
            base_domain: deployment.base_domain.clone(),
        }
    }

    /// Replaces the port source
    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    /// Fully qualified host of a subdomain
    pub fn host_for(&self, subdomain: &str) -> Result<String, ComposeError> {
        let valid = !subdomain.is_empty()
            && subdomain.len() <= 63
            && !subdomain.starts_with('-')
            && !subdomain.ends_with('-')
            && subdomain
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

        if valid {
            Ok(format!("{}.{}", subdomain, self.base_domain))
        } else {
            Err(ComposeError::InvalidSubdomain(subdomain.to_string()))
        }
    }

    /// Composes the settings of `project`, rewriting its host allowlist
    #[instrument(skip(self, project, decrypted), fields(project = %project.dir_name))]
    pub async fn compose(
        &self,
        project: &StagedProject,
        decrypted: &SecretString,
        subdomain: &str,
    ) -> Result<ComposedSettings, ComposeError> {
        let host = self.host_for(subdomain)?;

        let mut settings = SettingsMap::from_env_format(decrypted.expose_secret())?;

        let module = self.framework.resolve_module(&project.root, &settings)?;
        let statics = self.framework.static_defaults(&module);
        let media = self.framework.media_defaults(&module);

        let root_password = settings
            .get(DATABASE_PASSWORD)
            .ok_or_else(|| ComposeError::MissingVariable(DATABASE_PASSWORD.to_string()))?
            .to_string();
        let ports = self.ports.allocate().await?;

        let generated: SettingsMap = vec![
            ("MYSQL_ROOT_PASSWORD", root_password),
            ("SETTINGS_MODULE", self.framework.package_name(&module)),
            ("SUBDOMAIN", subdomain.to_string()),
            ("HOST", host.clone()),
            ("DIR_NAME", project.dir_name.clone()),
            ("SSL_PATH", self.tls.ssl_path.clone()),
            ("SSL_CERT_PATH", self.tls.cert_path.clone()),
            ("SSL_KEY_PATH", self.tls.key_path.clone()),
            ("STATIC_URL", statics.url),
            ("STATIC_ROOT", statics.root),
            ("MEDIA_URL", media.url),
            ("MEDIA_ROOT", media.root),
        ]
        .into_iter()
        .collect();
        settings.extend(generated);
        settings.extend(ports.to_settings());

        self.framework.rewrite_host_allowlist(&module, &host)?;

        debug!(
            "Composed {} settings for {} ({} framework)",
            settings.len(),
            host,
            self.framework.name()
        );

        Ok(ComposedSettings { settings, ports, host })
    }
}

/// Settings composition errors
#[derive(Debug, Error)]
pub enum ComposeError {
    /// Framework settings module could not be located
    #[error("Settings module not found: {0}")]
    SettingsModuleNotFound(String),

    /// Decrypted settings lack a variable
    #[error("Required variable {0} is missing from the decrypted settings")]
    MissingVariable(String),

    /// Subdomain is not a DNS label
    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),

    /// Settings module I/O failure
    #[error("Settings module I/O error at {path}: {error}")]
    Io {
        /// Path involved
        path: String,
        /// Underlying failure
        error: String,
    },

    /// Decrypted settings did not parse
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// Port allocation failed
    #[error(transparent)]
    Ports(#[from] PortError),

    /// Settings module leaves the staged tree
    #[error(transparent)]
    Escape(#[from] EscapedPath),
}
