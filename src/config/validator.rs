use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use url::Url;

use crate::config::{
    ConfigError, DeploymentConfig, KmsConfig, OrchestratorConfig, PathsConfig, TlsConfig, ToolsConfig,
};

/// Configuration validator
pub struct ConfigValidator {}

impl ConfigValidator {
    /// Creates a new configuration validator
    pub fn new() -> Self {
        Self {}
    }

    /// Validates a configuration
    pub fn validate(&self, config: &OrchestratorConfig) -> Result<(), ConfigError> {
        if !config.version.starts_with("1.") {
            return Err(ConfigError::ValidationError(
                format!("Unsupported configuration version: {}", config.version),
            ));
        }

        self.validate_paths(&config.paths)?;
        self.validate_tls(&config.tls)?;
        self.validate_kms(&config.kms)?;
        self.validate_tools(&config.tools)?;
        self.validate_deployment(&config.deployment)?;

        Ok(())
    }

    /// Validates filesystem locations
    fn validate_paths(&self, paths: &PathsConfig) -> Result<(), ConfigError> {
        for (name, path) in [
            ("secrets_dir", &paths.secrets_dir),
            ("projects_dir", &paths.projects_dir),
            ("templates_dir", &paths.templates_dir),
            ("proxy_site_config", &paths.proxy_site_config),
        ] {
            self.validate_path(name, path)?;
        }

        if paths.secrets_dir.starts_with(&paths.projects_dir) {
            return Err(ConfigError::ValidationError(
                "secrets_dir must not live under projects_dir".to_string(),
            ));
        }

        Ok(())
    }

    /// Rejects relative paths and traversal components
    fn validate_path(&self, name: &str, path: &Path) -> Result<PathBuf, ConfigError> {
        if !path.is_absolute() {
            return Err(ConfigError::ValidationError(
                format!("{} must be an absolute path: {}", name, path.display()),
            ));
        }

        if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(ConfigError::ValidationError(
                format!("Potential path traversal attack detected in {}: {}", name, path.display()),
            ));
        }

        Ok(path.to_path_buf())
    }

    /// Validates TLS material, optionally parsing the PEM files
    fn validate_tls(&self, tls: &TlsConfig) -> Result<(), ConfigError> {
        if !tls.verify_files {
            return Ok(());
        }

        let cert_file = File::open(&tls.cert_path).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid certificate path {}: {}", tls.cert_path, e))
        })?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file)).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to parse certificate {}: {}", tls.cert_path, e))
        })?;
        if certs.is_empty() {
            return Err(ConfigError::ValidationError(
                format!("No certificates found in {}", tls.cert_path),
            ));
        }

        let key_file = File::open(&tls.key_path).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid private key path {}: {}", tls.key_path, e))
        })?;
        let mut reader = BufReader::new(key_file);
        let mut found_key = false;
        while let Some(item) = rustls_pemfile::read_one(&mut reader).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to parse private key {}: {}", tls.key_path, e))
        })? {
            if matches!(
                item,
                rustls_pemfile::Item::RSAKey(_) | rustls_pemfile::Item::PKCS8Key(_) | rustls_pemfile::Item::ECKey(_)
            ) {
                found_key = true;
                break;
            }
        }
        if !found_key {
            return Err(ConfigError::ValidationError(
                format!("No private key found in {}", tls.key_path),
            ));
        }

        Ok(())
    }

    /// Validates KMS endpoints
    fn validate_kms(&self, kms: &KmsConfig) -> Result<(), ConfigError> {
        for (name, endpoint) in [
            ("create", &kms.endpoints.create),
            ("list", &kms.endpoints.list),
            ("encrypt", &kms.endpoints.encrypt),
            ("decrypt", &kms.endpoints.decrypt),
        ] {
            let url = Url::parse(&endpoint.replace("{keyId}", "key")).map_err(|e| {
                ConfigError::ValidationError(format!("Invalid KMS {} endpoint {}: {}", name, endpoint, e))
            })?;

            // Plain HTTP is tolerated only for loopback test doubles
            let loopback = matches!(url.host_str(), Some("127.0.0.1") | Some("localhost"));
            if url.scheme() != "https" && !loopback {
                return Err(ConfigError::ValidationError(
                    format!("Invalid KMS {} endpoint: {}. Only HTTPS URLs are allowed.", name, endpoint),
                ));
            }
        }

        Ok(())
    }

    /// Validates external tool configuration
    fn validate_tools(&self, tools: &ToolsConfig) -> Result<(), ConfigError> {
        if !tools.scanner.args.iter().any(|a| a.contains("{file}")) {
            return Err(ConfigError::ValidationError(
                "Scanner arguments must reference {file}".to_string(),
            ));
        }

        if tools.privileged_remove.is_empty() {
            return Err(ConfigError::ValidationError(
                "privileged_remove command cannot be empty".to_string(),
            ));
        }

        let timeouts = &tools.timeouts;
        for (step, seconds) in [
            ("clone", timeouts.clone_seconds),
            ("scan", timeouts.scan_seconds),
            ("build", timeouts.build_seconds),
            ("up", timeouts.up_seconds),
            ("down", timeouts.down_seconds),
            ("reload", timeouts.reload_seconds),
        ] {
            if seconds == 0 {
                return Err(ConfigError::ValidationError(
                    format!("Timeout for {} must be greater than 0", step),
                ));
            }
        }

        Ok(())
    }

    /// Validates the required-variable table
    fn validate_deployment(&self, deployment: &DeploymentConfig) -> Result<(), ConfigError> {
        if deployment.base_domain.starts_with('.') || deployment.base_domain.contains('/') {
            return Err(ConfigError::ValidationError(
                format!("Invalid base domain: {}", deployment.base_domain),
            ));
        }

        let mut seen = HashSet::new();
        for group in &deployment.required_variables {
            if group.names.is_empty() {
                return Err(ConfigError::ValidationError(
                    format!("Required variable group {} is empty", group.group),
                ));
            }
            for name in &group.names {
                if !seen.insert(name.as_str()) {
                    return Err(ConfigError::ValidationError(
                        format!("Required variable {} is listed twice", name),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
