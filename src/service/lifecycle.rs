// src/service/lifecycle.rs

//! Deployment lifecycle.
//!
//! A [`LifecycleManager`] owns every pipeline component and at most one live
//! [`DeploymentHandle`]. `start` runs the whole pipeline, `stop` tears the
//! live deployment down and `restart` is exactly `stop` followed by `start`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::bundle::{BundleError, FormatRegistry, SecretBundle, SettingsMap};
use crate::config::{OrchestratorConfig, RequiredGroup};
use crate::container::{ensure_success, ContainerError, ContainerToolchain};
use crate::execution::{CommandRunner, ExecError};
use crate::framework::FrameworkDescriptor;
use crate::network::{PortAllocator, PortSet, ProxyError, ProxySite};
use crate::render::{ArtifactRenderer, RenderError, RenderedArtifacts};
use crate::security::{GateError, KeyManagementService, SecretVault, SecurityGate, VaultError};
use crate::settings::{ComposeError, SettingsComposer};
use crate::stage::{DirectoryRemover, RepositoryStager, StageError, StagedProject};

/// Progress of the current deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    /// Nothing staged
    Absent,

    /// Repository cloned and manifest present
    Staged,

    /// Security scan passed
    Scanned,

    /// Settings composed and artifacts rendered
    Composed,

    /// Images built
    Built,

    /// Services up and proxied
    Running,

    /// Last deployment was torn down
    Stopped,
}

/// Input of a start or restart
#[derive(Debug)]
pub struct DeployParams {
    /// Uploaded secrets
    pub bundle: SecretBundle,

    /// Owning user
    pub user_id: String,

    /// Project name; also the published subdomain
    pub project_name: String,

    /// Repository to clone
    pub repo_url: String,
}

impl DeployParams {
    /// Creates start parameters
    pub fn new(
        bundle: SecretBundle,
        user_id: impl Into<String>,
        project_name: impl Into<String>,
        repo_url: impl Into<String>,
    ) -> Self {
        Self {
            bundle,
            user_id: user_id.into(),
            project_name: project_name.into(),
            repo_url: repo_url.into(),
        }
    }
}

/// The live deployment
#[derive(Debug)]
pub struct DeploymentHandle {
    /// Deployment identifier
    pub id: Uuid,

    /// Owning user
    pub user_id: String,

    /// Project name
    pub project_name: String,

    /// Public host
    pub host: String,

    /// Staged tree
    pub project: StagedProject,

    /// Ports given to the deployment
    pub ports: PortSet,

    /// Artifacts rendered into the tree
    pub artifacts: RenderedArtifacts,

    /// Start time
    pub started_at: DateTime<Utc>,

    /// Settings the services run with
    settings: SettingsMap,
}

impl DeploymentHandle {
    /// Summary without secret values
    pub fn status(&self) -> DeploymentStatus {
        DeploymentStatus {
            id: self.id,
            user_id: self.user_id.clone(),
            project_name: self.project_name.clone(),
            host: self.host.clone(),
            dir_name: self.project.dir_name.clone(),
            compose_file: self.artifacts.compose_file.clone(),
            ports: self.ports,
            started_at: self.started_at,
        }
    }
}

/// Public view of the live deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    /// Deployment identifier
    pub id: Uuid,

    /// Owning user
    pub user_id: String,

    /// Project name
    pub project_name: String,

    /// Public host
    pub host: String,

    /// Staged directory name
    pub dir_name: String,

    /// Compose descriptor the services were started from
    pub compose_file: PathBuf,

    /// Allocated ports
    pub ports: PortSet,

    /// Start time
    pub started_at: DateTime<Utc>,
}

/// Runs the deployment pipeline for a single active slot
pub struct LifecycleManager {
    /// Bundle parsers
    registry: FormatRegistry,

    /// Variables every bundle must carry
    required: Vec<RequiredGroup>,

    /// Encrypted secret storage
    vault: SecretVault,

    /// Repository cloning
    stager: RepositoryStager,

    /// Static-analysis gate
    gate: SecurityGate,

    /// Settings composition
    composer: SettingsComposer,

    /// Artifact rendering
    renderer: ArtifactRenderer,

    /// Compose toolchain
    toolchain: ContainerToolchain,

    /// Host reverse proxy
    proxy: Arc<ProxySite>,

    /// Live deployment, if any
    active: Option<DeploymentHandle>,

    /// Current state
    state: DeploymentState,
}

impl LifecycleManager {
    /// Wires every component from configuration
    pub fn new(
        config: &OrchestratorConfig,
        kms: Arc<dyn KeyManagementService>,
        runner: Arc<dyn CommandRunner>,
        framework: Arc<dyn FrameworkDescriptor>,
    ) -> Self {
        let timeouts = &config.tools.timeouts;
        let remover = DirectoryRemover::new(
            runner.clone(),
            config.tools.privileged_remove.clone(),
            Duration::from_secs(timeouts.down_seconds),
        );
        let proxy = Arc::new(ProxySite::new(
            config.paths.proxy_site_config.clone(),
            runner.clone(),
            config.tools.proxy_reload.clone(),
            Duration::from_secs(timeouts.reload_seconds),
        ));

        Self {
            registry: FormatRegistry::with_defaults(),
            required: config.deployment.required_variables.clone(),
            vault: SecretVault::new(kms, config.paths.secrets_dir.clone()),
            stager: RepositoryStager::new(config, runner.clone(), remover.clone()),
            gate: SecurityGate::new(
                runner.clone(),
                config.tools.scanner.clone(),
                Duration::from_secs(timeouts.scan_seconds),
                remover,
            ),
            composer: SettingsComposer::new(
                framework,
                PortAllocator::new(),
                config.tls.clone(),
                &config.deployment,
            ),
            renderer: ArtifactRenderer::new(config.paths.templates_dir.clone(), proxy.clone()),
            toolchain: ContainerToolchain::new(&config.tools, runner),
            proxy,
            active: None,
            state: DeploymentState::Absent,
        }
    }

    /// Replaces the bundle parsers
    pub fn with_registry(mut self, registry: FormatRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the port source
    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.composer = self.composer.with_ports(ports);
        self
    }

    /// The vault, for key management outside a deployment
    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    /// Current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// The live deployment
    pub fn active(&self) -> Option<&DeploymentHandle> {
        self.active.as_ref()
    }

    fn transition(&mut self, state: DeploymentState) {
        debug!("Deployment state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Deploys a project into the slot, stopping the live one first.
    ///
    /// Returns `Ok(false)` when the build or the bring-up exits nonzero.
    #[instrument(skip(self, params), fields(user = %params.user_id, project = %params.project_name))]
    pub async fn start(&mut self, params: DeployParams) -> Result<bool, DeployError> {
        if self.active.is_some() {
            info!("Slot occupied, stopping the live deployment first");
            self.stop().await?;
        }

        let started = Instant::now();
        let outcome = self.run_pipeline(&params).await;

        let label = match &outcome {
            Ok(true) => "running",
            Ok(false) => "failed",
            Err(_) => "error",
        };
        metrics::increment_counter!("shipyard_deployments_total", "outcome" => label);
        metrics::histogram!("shipyard_start_duration_seconds", started.elapsed().as_secs_f64());

        if let Err(e) = &outcome {
            error!("Deployment of {} failed: {}", params.project_name, e);
        }
        outcome
    }

    async fn run_pipeline(&mut self, params: &DeployParams) -> Result<bool, DeployError> {
        let settings = params.bundle.convert(&self.registry, &self.required)?;
        debug!("Bundle carries {} variables", settings.len());

        self.vault.ensure_key(&params.user_id).await?;
        self.vault
            .encrypt(&params.user_id, &params.project_name, &settings)
            .await?;
        drop(settings);
        let decrypted = match self.vault.decrypt(&params.user_id, &params.project_name).await {
            Ok(decrypted) => decrypted,
            Err(e) => {
                self.forget_record(params).await;
                return Err(e.into());
            }
        };

        let project = match self.stager.stage(&params.repo_url, &params.user_id).await {
            Ok(project) => project,
            Err(e) => {
                self.forget_record(params).await;
                return Err(e.into());
            }
        };
        self.transition(DeploymentState::Staged);

        // Everything past this point owns the staged tree
        let result = self.deploy_staged(params, &project, &decrypted).await;
        match result {
            Ok(Some(handle)) => {
                info!(
                    "{} is running at https://{} (app port {})",
                    handle.project_name, handle.host, handle.ports.app
                );
                self.active = Some(handle);
                self.transition(DeploymentState::Running);
                Ok(true)
            }
            Ok(None) => {
                self.abort(params, &project).await;
                Ok(false)
            }
            Err(e) => {
                self.abort(params, &project).await;
                Err(e)
            }
        }
    }

    async fn deploy_staged(
        &mut self,
        params: &DeployParams,
        project: &StagedProject,
        decrypted: &secrecy::SecretString,
    ) -> Result<Option<DeploymentHandle>, DeployError> {
        self.stager.check_dependencies(project)?;
        self.gate.scan(project).await?;
        self.transition(DeploymentState::Scanned);

        let composed = self
            .composer
            .compose(project, decrypted, &params.project_name)
            .await?;
        let artifacts = self.renderer.render(project, &composed.settings).await?;
        self.transition(DeploymentState::Composed);

        // Containers or images may exist from here on; teardown needs the compose file
        let brought_up = self.bring_up(project, &composed.settings).await;
        match brought_up {
            Ok(true) => {}
            Ok(false) => {
                self.teardown(project, &composed.settings).await;
                return Ok(None);
            }
            Err(e) => {
                self.teardown(project, &composed.settings).await;
                return Err(e);
            }
        }

        Ok(Some(DeploymentHandle {
            id: Uuid::new_v4(),
            user_id: params.user_id.clone(),
            project_name: params.project_name.clone(),
            host: composed.host,
            project: project.clone(),
            ports: composed.ports,
            artifacts,
            started_at: Utc::now(),
            settings: composed.settings,
        }))
    }

    /// Builds, starts and publishes; `Ok(false)` when a compose step exits nonzero
    async fn bring_up(&mut self, project: &StagedProject, settings: &SettingsMap) -> Result<bool, DeployError> {
        let build = self.toolchain.build(&project.root, settings).await?;
        if !build.success() {
            warn!("Image build for {} failed", project.dir_name);
            return Ok(false);
        }
        self.transition(DeploymentState::Built);

        let up = self.toolchain.up(&project.root, settings).await?;
        if !up.success() {
            warn!("Bring-up of {} failed", project.dir_name);
            return Ok(false);
        }

        self.proxy.reload().await?;
        Ok(true)
    }

    /// Best-effort disposal of a start that did not reach `Running`
    async fn abort(&mut self, params: &DeployParams, project: &StagedProject) {
        if let Err(e) = self.stager.discard(project).await {
            warn!("Failed to discard {}: {}", project.root.display(), e);
        }
        self.forget_record(params).await;
        self.transition(DeploymentState::Absent);
    }

    async fn forget_record(&self, params: &DeployParams) {
        if let Err(e) = self.vault.remove_record(&params.user_id, &params.project_name) {
            warn!("Failed to remove secret record of {}: {}", params.project_name, e);
        }
    }

    /// Stops services that may be partially up and removes their images
    async fn teardown(&self, project: &StagedProject, settings: &SettingsMap) {
        let root = &project.root;
        let steps = [
            ("compose down", self.toolchain.down(root, settings).await),
            ("image removal", self.toolchain.remove_images(root, settings).await),
        ];
        for (step, outcome) in steps {
            match outcome {
                Ok(result) if !result.success() => {
                    warn!("{} of {} exited with {}", step, project.dir_name, result.exit_code)
                }
                Ok(_) => {}
                Err(e) => warn!("{} of {} failed: {}", step, project.dir_name, e),
            }
        }
    }

    /// Tears the live deployment down; a no-op when the slot is empty.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned and the slot is cleared regardless.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), DeployError> {
        let handle = match self.active.take() {
            Some(handle) => handle,
            None => {
                debug!("No live deployment to stop");
                return Ok(());
            }
        };

        let root = &handle.project.root;
        let mut first: Option<DeployError> = None;
        let mut record = |result: Result<(), DeployError>| {
            if let Err(e) = result {
                warn!("Stop step failed: {}", e);
                first.get_or_insert(e);
            }
        };

        record(
            self.toolchain
                .down(root, &handle.settings)
                .await
                .and_then(|r| ensure_success("down", r))
                .map(drop)
                .map_err(DeployError::from),
        );
        record(
            self.toolchain
                .remove_images(root, &handle.settings)
                .await
                .and_then(|r| ensure_success("remove images", r))
                .map(drop)
                .map_err(DeployError::from),
        );
        record(self.stager.discard(&handle.project).await.map_err(DeployError::from));
        record(
            self.vault
                .remove_record(&handle.user_id, &handle.project_name)
                .map(drop)
                .map_err(DeployError::from),
        );

        self.transition(DeploymentState::Stopped);
        metrics::increment_counter!("shipyard_stops_total");
        info!("Stopped {} ({})", handle.project_name, handle.host);

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops the live deployment only if it belongs to `(user_id, project_name)`
    pub async fn stop_project(&mut self, user_id: &str, project_name: &str) -> Result<bool, DeployError> {
        let matches = self
            .active
            .as_ref()
            .map(|h| h.user_id == user_id && h.project_name == project_name)
            .unwrap_or(false);

        if !matches {
            debug!("{} of user {} is not the live deployment", project_name, user_id);
            return Ok(false);
        }

        self.stop().await?;
        Ok(true)
    }

    /// Stops, then starts from scratch
    pub async fn restart(&mut self, params: DeployParams) -> Result<bool, DeployError> {
        self.stop().await?;
        self.start(params).await
    }
}

/// Typed failures at the lifecycle boundary
#[derive(Debug, Error)]
pub enum DeployError {
    /// Bundle parsing or validation
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// Secret storage
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Repository staging
    #[error(transparent)]
    Stage(StageError),

    /// Security gate
    #[error(transparent)]
    Gate(GateError),

    /// Settings composition
    #[error(transparent)]
    Compose(#[from] ComposeError),

    /// Artifact rendering
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Container toolchain
    #[error(transparent)]
    Container(ContainerError),

    /// Reverse-proxy reload
    #[error(transparent)]
    Proxy(ProxyError),

    /// Any external tool timed out
    #[error("External tool timed out: {0}")]
    ToolTimeout(ExecError),
}

impl DeployError {
    /// Whether the failure is the security gate's rejection
    pub fn is_security_issue(&self) -> bool {
        matches!(self, DeployError::Gate(GateError::SecurityIssue { .. }))
    }
}

macro_rules! from_tool_error {
    ($error:ident, $variant:ident) => {
        impl From<$error> for DeployError {
            fn from(error: $error) -> Self {
                match error {
                    $error::Exec(e @ ExecError::Timeout { .. }) => DeployError::ToolTimeout(e),
                    other => DeployError::$variant(other),
                }
            }
        }
    };
}

from_tool_error!(StageError, Stage);
from_tool_error!(GateError, Gate);
from_tool_error!(ContainerError, Container);
from_tool_error!(ProxyError, Proxy);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_timeouts_are_lifted() {
        let timeout = || ExecError::Timeout {
            program: "git".to_string(),
            seconds: 300,
        };

        assert!(matches!(DeployError::from(StageError::Exec(timeout())), DeployError::ToolTimeout(_)));
        assert!(matches!(DeployError::from(GateError::Exec(timeout())), DeployError::ToolTimeout(_)));
        assert!(matches!(DeployError::from(ContainerError::Exec(timeout())), DeployError::ToolTimeout(_)));
        assert!(matches!(DeployError::from(ProxyError::Exec(timeout())), DeployError::ToolTimeout(_)));
    }

    #[test]
    fn other_tool_errors_keep_their_subsystem() {
        let spawn = ExecError::Spawn {
            program: "bandit".to_string(),
            error: "not found".to_string(),
        };
        assert!(matches!(DeployError::from(GateError::Exec(spawn)), DeployError::Gate(_)));
        assert!(matches!(
            DeployError::from(StageError::MissingManifest("requirements.txt".to_string())),
            DeployError::Stage(StageError::MissingManifest(_))
        ));
    }

    #[test]
    fn security_rejections_are_recognisable() {
        let err = DeployError::from(GateError::SecurityIssue {
            file: "app/views.py".to_string(),
            findings: "B602".to_string(),
        });
        assert!(err.is_security_issue());
        assert!(err.to_string().contains("app/views.py"));
    }
}
