// src/service/mod.rs

/// Single-slot deployment lifecycle
pub mod lifecycle;

use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};
use thiserror::Error;

use crate::config::ConfigManager;
use crate::execution::ProcessRunner;
use crate::framework::DjangoDescriptor;
use crate::security::HttpKms;

// Re-exports
pub use lifecycle::{
    DeployError, DeployParams, DeploymentHandle, DeploymentState, DeploymentStatus, LifecycleManager,
};

/// Requests served by the lifecycle task
#[derive(Debug)]
pub enum ServiceCommand {
    /// Deploy a project into the slot
    Start(DeployParams, oneshot::Sender<Result<bool, ServiceError>>),

    /// Stop the live deployment, then deploy
    Restart(DeployParams, oneshot::Sender<Result<bool, ServiceError>>),

    /// Stop the live deployment
    Stop(oneshot::Sender<Result<(), ServiceError>>),

    /// Stop the live deployment if it belongs to `(user, project)`
    StopProject(String, String, oneshot::Sender<Result<bool, ServiceError>>),

    /// Describe the live deployment
    Status(oneshot::Sender<(DeploymentState, Option<DeploymentStatus>)>),

    /// Ensure a user's encryption key exists
    EnsureKey(String, oneshot::Sender<Result<String, ServiceError>>),

    /// Stop serving; the live deployment keeps running
    Shutdown(oneshot::Sender<Result<(), ServiceError>>),
}

/// Handle on an orchestrator instance.
///
/// All requests are served one at a time by a background task that owns the
/// [`LifecycleManager`], so the single deployment slot is never contended.
#[derive(Clone)]
pub struct Service {
    /// Service command channel
    command_tx: mpsc::Sender<ServiceCommand>,
}

/// Task owning the lifecycle manager
struct ServiceImpl {
    /// Deployment pipeline and slot
    manager: LifecycleManager,

    /// Service command channel
    command_rx: mpsc::Receiver<ServiceCommand>,
}

impl Service {
    /// Creates a service from a configuration file
    pub async fn new(config_path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let mut config_manager = ConfigManager::load_from_file(config_path)
            .map_err(|e| ServiceError::ConfigurationError(e.to_string()))?;
        Self::from_config_manager(&mut config_manager)
    }

    /// Creates a service from a loaded configuration, using the HTTP key service
    pub fn from_config_manager(config_manager: &mut ConfigManager) -> Result<Self, ServiceError> {
        if !config_manager.is_validated() {
            config_manager
                .validate()
                .map_err(|e| ServiceError::ConfigurationError(e.to_string()))?;
        }
        config_manager
            .resolve_secrets()
            .map_err(|e| ServiceError::ConfigurationError(e.to_string()))?;

        let config = config_manager.get_config();
        let token = config_manager
            .iam_token()
            .map_err(|e| ServiceError::ConfigurationError(e.to_string()))?;
        let kms = HttpKms::new(&config.kms, token).map_err(|e| ServiceError::KeyServiceError(e.to_string()))?;

        let manager = LifecycleManager::new(
            config,
            Arc::new(kms),
            Arc::new(ProcessRunner::new()),
            Arc::new(DjangoDescriptor::new()),
        );

        Ok(Self::spawn(manager))
    }

    /// Serves requests with an already-wired manager
    pub fn spawn(manager: LifecycleManager) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);

        let service_impl = ServiceImpl { manager, command_rx };
        tokio::spawn(service_impl.run());

        Self { command_tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ServiceCommand,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();

        self.command_tx
            .send(command(tx))
            .await
            .map_err(|_| ServiceError::ChannelClosed)?;

        rx.await.map_err(|_| ServiceError::ResponseChannelClosed)
    }

    /// Deploys a project; `Ok(false)` when build or bring-up fails
    pub async fn start(&self, params: DeployParams) -> Result<bool, ServiceError> {
        self.request(|tx| ServiceCommand::Start(params, tx)).await?
    }

    /// Stops the live deployment and deploys again from scratch
    pub async fn restart(&self, params: DeployParams) -> Result<bool, ServiceError> {
        self.request(|tx| ServiceCommand::Restart(params, tx)).await?
    }

    /// Stops the live deployment; a no-op when there is none
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.request(ServiceCommand::Stop).await?
    }

    /// Stops the live deployment only if it is `(user_id, project_name)`
    pub async fn stop_project(&self, user_id: &str, project_name: &str) -> Result<bool, ServiceError> {
        let (user_id, project_name) = (user_id.to_string(), project_name.to_string());
        self.request(|tx| ServiceCommand::StopProject(user_id, project_name, tx))
            .await?
    }

    /// State of the slot and the live deployment, if any
    pub async fn status(&self) -> Result<(DeploymentState, Option<DeploymentStatus>), ServiceError> {
        self.request(ServiceCommand::Status).await
    }

    /// Ensures the user's key exists and returns its id
    pub async fn ensure_key(&self, user_id: &str) -> Result<String, ServiceError> {
        let user_id = user_id.to_string();
        self.request(|tx| ServiceCommand::EnsureKey(user_id, tx)).await?
    }

    /// Shuts down the service
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.request(ServiceCommand::Shutdown).await?
    }
}

impl ServiceImpl {
    /// Runs the service implementation
    async fn run(mut self) {
        info!("Service started");

        while let Some(command) = self.command_rx.recv().await {
            match command {
                ServiceCommand::Start(params, response_tx) => {
                    let result = self.manager.start(params).await.map_err(ServiceError::from);
                    if response_tx.send(result).is_err() {
                        error!("Failed to send start response");
                    }
                }
                ServiceCommand::Restart(params, response_tx) => {
                    let result = self.manager.restart(params).await.map_err(ServiceError::from);
                    if response_tx.send(result).is_err() {
                        error!("Failed to send restart response");
                    }
                }
                ServiceCommand::Stop(response_tx) => {
                    let result = self.manager.stop().await.map_err(ServiceError::from);
                    if response_tx.send(result).is_err() {
                        error!("Failed to send stop response");
                    }
                }
                ServiceCommand::StopProject(user_id, project_name, response_tx) => {
                    let result = self
                        .manager
                        .stop_project(&user_id, &project_name)
                        .await
                        .map_err(ServiceError::from);
                    if response_tx.send(result).is_err() {
                        error!("Failed to send stop project response");
                    }
                }
                ServiceCommand::Status(response_tx) => {
                    let status = self.manager.active().map(DeploymentHandle::status);
                    if response_tx.send((self.manager.state(), status)).is_err() {
                        error!("Failed to send status response");
                    }
                }
                ServiceCommand::EnsureKey(user_id, response_tx) => {
                    let result = self
                        .manager
                        .vault()
                        .ensure_key(&user_id)
                        .await
                        .map_err(|e| ServiceError::Deploy(e.into()));
                    if response_tx.send(result).is_err() {
                        error!("Failed to send ensure key response");
                    }
                }
                ServiceCommand::Shutdown(response_tx) => {
                    if response_tx.send(Ok(())).is_err() {
                        error!("Failed to send shutdown response");
                    }
                    // Exit the service loop
                    break;
                }
            }
        }

        info!("Service stopped");
    }
}

/// Service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration could not be loaded or validated
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Key service client could not be built
    #[error("Key service error: {0}")]
    KeyServiceError(String),

    /// Lifecycle failure
    #[error(transparent)]
    Deploy(#[from] DeployError),

    /// The service task is gone
    #[error("Channel closed")]
    ChannelClosed,

    /// The service dropped the reply
    #[error("Response channel closed")]
    ResponseChannelClosed,
}
