// src/network/proxy.rs

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::execution::{CommandRunner, CommandSpec, ExecError};

/// The host reverse proxy: one shared site file plus a reload command
pub struct ProxySite {
    /// Shared site configuration
    site_config: PathBuf,

    /// Runner for the reload command
    runner: Arc<dyn CommandRunner>,

    /// Reload command argv
    reload: Vec<String>,

    /// Reload timeout
    timeout: Duration,
}

impl ProxySite {
    /// Creates a handle on the proxy
    pub fn new(site_config: PathBuf, runner: Arc<dyn CommandRunner>, reload: Vec<String>, timeout: Duration) -> Self {
        Self {
            site_config,
            runner,
            reload,
            timeout,
        }
    }

    /// Appends a server block to the shared site file.
    ///
    /// Appending is unconditional; an identical block already present is
    /// reported but not deduplicated.
    pub async fn append(&self, snippet: &str) -> Result<(), ProxyError> {
        let io_error = |e: std::io::Error| ProxyError::Io {
            path: self.site_config.display().to_string(),
            error: e.to_string(),
        };

        let existing = match tokio::fs::read_to_string(&self.site_config).await {
            Ok(existing) => existing,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_error(e)),
        };
        if !snippet.trim().is_empty() && existing.contains(snippet.trim()) {
            warn!("{} already contains this server block", self.site_config.display());
        }

        let mut block = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            block.push('\n');
        }
        block.push_str(snippet);
        if !snippet.ends_with('\n') {
            block.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.site_config)
            .await
            .map_err(io_error)?;
        file.write_all(block.as_bytes()).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)?;

        info!("Appended server block to {}", self.site_config.display());
        Ok(())
    }

    /// Restarts the proxy so appended blocks take effect
    pub async fn reload(&self) -> Result<(), ProxyError> {
        let spec = CommandSpec::from_argv(&self.reload, self.timeout)
            .ok_or_else(|| ProxyError::Reload("no reload command configured".to_string()))?;

        let result = self.runner.run(&spec).await?;
        if !result.success() {
            return Err(ProxyError::Reload(format!(
                "{} exited with {}: {}",
                spec.display(),
                result.exit_code,
                result.stderr.trim()
            )));
        }

        info!("Reverse proxy reloaded");
        Ok(())
    }
}

/// Reverse-proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Site file I/O failure
    #[error("Failed to update proxy configuration {path}: {error}")]
    Io {
        /// Path involved
        path: String,
        /// Underlying failure
        error: String,
    },

    /// Reload command exited nonzero
    #[error("Proxy reload failed: {0}")]
    Reload(String),

    /// Reload command could not run
    #[error(transparent)]
    Exec(#[from] ExecError),
}
