// src/container/mod.rs

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::bundle::SettingsMap;
use crate::config::ToolsConfig;
use crate::execution::{CommandRunner, CommandSpec, ExecError, ExecuteResult};

/// Compose-based container toolchain.
///
/// Every invocation runs in the staged project with the full settings map in
/// the child environment, so `${KEY}` references in the descriptor resolve.
pub struct ContainerToolchain {
    /// Runner for the toolchain binary
    runner: Arc<dyn CommandRunner>,

    /// Toolchain binary (`docker`)
    docker: String,

    /// Image build timeout
    build_timeout: Duration,

    /// Bring-up timeout
    up_timeout: Duration,

    /// Tear-down timeout
    down_timeout: Duration,
}

impl ContainerToolchain {
    /// Creates a toolchain from configuration
    pub fn new(tools: &ToolsConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            docker: tools.docker.clone(),
            build_timeout: Duration::from_secs(tools.timeouts.build_seconds),
            up_timeout: Duration::from_secs(tools.timeouts.up_seconds),
            down_timeout: Duration::from_secs(tools.timeouts.down_seconds),
        }
    }

    fn compose(&self, cwd: &Path, settings: &SettingsMap, timeout: Duration) -> CommandSpec {
        CommandSpec::new(&self.docker, timeout)
            .arg("compose")
            .current_dir(cwd)
            .envs(settings.iter())
    }

    /// Builds the images without cache, passing every setting as a build argument
    pub async fn build(&self, cwd: &Path, settings: &SettingsMap) -> Result<ExecuteResult, ContainerError> {
        let mut spec = self.compose(cwd, settings, self.build_timeout).arg("build");
        for (key, value) in settings.iter() {
            spec = spec.arg("--build-arg").arg(format!("{}={}", key, value));
        }
        let spec = spec.arg("--no-cache");

        self.run("build", spec).await
    }

    /// Starts the services detached
    pub async fn up(&self, cwd: &Path, settings: &SettingsMap) -> Result<ExecuteResult, ContainerError> {
        let spec = self.compose(cwd, settings, self.up_timeout).args(["up", "-d"]);
        self.run("up", spec).await
    }

    /// Stops and removes the services
    pub async fn down(&self, cwd: &Path, settings: &SettingsMap) -> Result<ExecuteResult, ContainerError> {
        let spec = self.compose(cwd, settings, self.down_timeout).arg("down");
        self.run("down", spec).await
    }

    /// Removes the images built for the project
    pub async fn remove_images(&self, cwd: &Path, settings: &SettingsMap) -> Result<ExecuteResult, ContainerError> {
        let spec = self
            .compose(cwd, settings, self.down_timeout)
            .args(["down", "--rmi", "local"]);
        self.run("remove images", spec).await
    }

    async fn run(&self, step: &'static str, spec: CommandSpec) -> Result<ExecuteResult, ContainerError> {
        let result = self.runner.run(&spec).await?;

        metrics::histogram!("shipyard_compose_duration_ms", result.duration_ms as f64, "step" => step);
        if result.success() {
            info!("compose {} finished in {}ms", step, result.duration_ms);
        } else {
            warn!("compose {} exited with {}: {}", step, result.exit_code, result.stderr.trim());
        }

        Ok(result)
    }
}

/// Fails with [`ContainerError::Failed`] unless the step exited with zero
pub fn ensure_success(step: &'static str, result: ExecuteResult) -> Result<ExecuteResult, ContainerError> {
    if result.success() {
        Ok(result)
    } else {
        Err(ContainerError::Failed {
            step,
            exit_code: result.exit_code,
            stderr: result.stderr.trim().to_string(),
        })
    }
}

/// Container toolchain errors
#[derive(Debug, Error)]
pub enum ContainerError {
    /// A step exited nonzero
    #[error("compose {step} exited with {exit_code}: {stderr}")]
    Failed {
        /// Toolchain step
        step: &'static str,
        /// Exit code of the step
        exit_code: i32,
        /// Captured standard error
        stderr: String,
    },

    /// The tool could not run
    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigManager;
    use crate::execution::MockCommandRunner;

    fn ok() -> ExecuteResult {
        ExecuteResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 10,
        }
    }

    fn settings() -> SettingsMap {
        vec![("SECRET_KEY", "x"), ("APP_PORT", "8001")].into_iter().collect()
    }

    fn toolchain(runner: MockCommandRunner) -> ContainerToolchain {
        ContainerToolchain::new(&ConfigManager::default_config().tools, Arc::new(runner))
    }

    #[tokio::test]
    async fn build_passes_settings_as_arguments_and_environment() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.program == "docker"
                    && spec.args
                        == [
                            "compose",
                            "build",
                            "--build-arg",
                            "SECRET_KEY=x",
                            "--build-arg",
                            "APP_PORT=8001",
                            "--no-cache",
                        ]
                    && spec.env.contains(&("SECRET_KEY".to_string(), "x".to_string()))
                    && spec.cwd.as_deref() == Some(Path::new("/srv/blog_7"))
                    && spec.timeout == Duration::from_secs(1800)
            })
            .times(1)
            .returning(|_| Ok(ok()));

        let result = toolchain(runner).build(Path::new("/srv/blog_7"), &settings()).await.unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn lifecycle_commands_use_compose_subcommands() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        for expected in [vec!["compose", "up", "-d"], vec!["compose", "down"], vec!["compose", "down", "--rmi", "local"]] {
            runner
                .expect_run()
                .withf(move |spec| spec.args == expected)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(ok()));
        }

        let toolchain = toolchain(runner);
        let cwd = Path::new("/srv/blog_7");
        toolchain.up(cwd, &settings()).await.unwrap();
        toolchain.down(cwd, &settings()).await.unwrap();
        toolchain.remove_images(cwd, &settings()).await.unwrap();
    }

    #[test]
    fn nonzero_exit_is_reported_by_ensure_success() {
        let failed = ExecuteResult {
            exit_code: 17,
            stdout: String::new(),
            stderr: "no such service\n".to_string(),
            duration_ms: 1,
        };

        let err = ensure_success("down", failed).unwrap_err();
        assert_eq!(err.to_string(), "compose down exited with 17: no such service");
    }
}
