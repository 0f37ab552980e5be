// src/stage/mod.rs

//! Repository staging.
//!
//! A repository is cloned into `<projects_dir>/<repo>_<user>`. The name is a
//! pure function of the URL and the user, so redeploying the same project
//! replaces the previous tree in place.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::execution::{CommandRunner, CommandSpec, ExecError};

/// A cloned repository owned by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedProject {
    /// Absolute path of the staged tree
    pub root: PathBuf,

    /// Directory name, `<repo>_<user>`
    pub dir_name: String,

    /// Repository the tree was cloned from
    pub repo_url: String,

    /// Owning user
    pub user_id: String,
}

/// Removes staged trees, escalating when the clone left unremovable files
#[derive(Clone)]
pub struct DirectoryRemover {
    /// Runner for the privileged command
    runner: Arc<dyn CommandRunner>,

    /// Privileged command prefix (`sudo rm -rf`)
    privileged: Vec<String>,

    /// Timeout of the privileged command
    timeout: Duration,
}

impl DirectoryRemover {
    /// Creates a remover
    pub fn new(runner: Arc<dyn CommandRunner>, privileged: Vec<String>, timeout: Duration) -> Self {
        Self {
            runner,
            privileged,
            timeout,
        }
    }

    /// Recursively deletes `dir`; a missing directory is not an error
    pub async fn remove(&self, dir: &Path) -> Result<(), StageError> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                debug!("Removed {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!("Unprivileged delete of {} refused, escalating", dir.display());
                self.remove_privileged(dir).await
            }
            Err(e) => Err(StageError::Remove {
                path: dir.display().to_string(),
                error: e.to_string(),
            }),
        }
    }

    async fn remove_privileged(&self, dir: &Path) -> Result<(), StageError> {
        let mut argv: &[String] = &self.privileged;
        // Already running as root
        if nix::unistd::geteuid().is_root() && argv.first().map(String::as_str) == Some("sudo") {
            argv = &argv[1..];
        }

        let spec = CommandSpec::from_argv(argv, self.timeout)
            .ok_or_else(|| StageError::Remove {
                path: dir.display().to_string(),
                error: "no privileged remove command configured".to_string(),
            })?
            .arg(dir.display().to_string());

        let result = self.runner.run(&spec).await?;
        if !result.success() {
            return Err(StageError::Remove {
                path: dir.display().to_string(),
                error: result.stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Clones repositories into user-scoped directories
pub struct RepositoryStager {
    /// Runner for the clone tool
    runner: Arc<dyn CommandRunner>,

    /// Root of all staged trees
    projects_dir: PathBuf,

    /// Clone tool binary
    git: String,

    /// Manifest that must exist at the staged root
    manifest_file: String,

    /// Clone timeout
    clone_timeout: Duration,

    /// Tree remover
    remover: DirectoryRemover,
}

impl RepositoryStager {
    /// Creates a stager from configuration
    pub fn new(config: &OrchestratorConfig, runner: Arc<dyn CommandRunner>, remover: DirectoryRemover) -> Self {
        Self {
            runner,
            projects_dir: config.paths.projects_dir.clone(),
            git: config.tools.git.clone(),
            manifest_file: config.deployment.manifest_file.clone(),
            clone_timeout: Duration::from_secs(config.tools.timeouts.clone_seconds),
            remover,
        }
    }

    /// Replaces any previous tree with a fresh clone of `repo_url`
    #[instrument(skip(self))]
    pub async fn stage(&self, repo_url: &str, user_id: &str) -> Result<StagedProject, StageError> {
        let dir_name = dir_name(repo_url, user_id)?;
        let root = self.projects_dir.join(&dir_name);

        tokio::fs::create_dir_all(&self.projects_dir)
            .await
            .map_err(|e| StageError::Io {
                path: self.projects_dir.display().to_string(),
                error: e.to_string(),
            })?;

        self.remover.remove(&root).await?;

        let spec = CommandSpec::new(&self.git, self.clone_timeout)
            .args(["clone", "--", repo_url])
            .arg(root.display().to_string())
            .current_dir(&self.projects_dir);

        let result = match self.runner.run(&spec).await {
            Ok(result) => result,
            Err(e) => {
                self.discard_partial(&root).await;
                return Err(e.into());
            }
        };

        if !result.success() {
            self.discard_partial(&root).await;
            return Err(StageError::Clone(format!(
                "{} could not be cloned: {}",
                repo_url,
                result.stderr.trim()
            )));
        }

        info!("Cloned {} into {}", repo_url, root.display());

        Ok(StagedProject {
            root,
            dir_name,
            repo_url: repo_url.to_string(),
            user_id: user_id.to_string(),
        })
    }

    /// Fails unless the dependency manifest exists at the staged root
    pub fn check_dependencies(&self, project: &StagedProject) -> Result<(), StageError> {
        if project.root.join(&self.manifest_file).is_file() {
            Ok(())
        } else {
            Err(StageError::MissingManifest(self.manifest_file.clone()))
        }
    }

    /// Deletes a staged tree
    pub async fn discard(&self, project: &StagedProject) -> Result<(), StageError> {
        self.remover.remove(&project.root).await
    }

    async fn discard_partial(&self, root: &Path) {
        if let Err(e) = self.remover.remove(root).await {
            warn!("Failed to clean up partial clone {}: {}", root.display(), e);
        }
    }
}

/// Fails unless `target` stays inside `root`.
///
/// The staged tree comes from an untrusted repository, so no existing
/// component between `root` and `target` may be a symbolic link and the
/// resolved target must not leave `root`. Components that do not exist yet
/// are accepted; they will be created as plain directories or files.
pub fn ensure_contained(root: &Path, target: &Path) -> Result<(), EscapedPath> {
    let escaped = |reason: String| EscapedPath {
        path: target.display().to_string(),
        reason,
    };

    let relative = target
        .strip_prefix(root)
        .map_err(|_| escaped(format!("not under {}", root.display())))?;

    let mut current = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => current.push(part),
            _ => return Err(escaped("relative components are not allowed".to_string())),
        }

        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(escaped(format!("{} is a symbolic link", current.display())));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => break,
            Err(e) => return Err(escaped(e.to_string())),
        }
    }

    if let Ok(resolved) = target.canonicalize() {
        let root = root.canonicalize().map_err(|e| escaped(e.to_string()))?;
        if !resolved.starts_with(&root) {
            return Err(escaped(format!("resolves to {}", resolved.display())));
        }
    }

    Ok(())
}

/// A path inside a staged tree that points outside of it
#[derive(Debug, Error)]
#[error("{path} escapes the staged tree: {reason}")]
pub struct EscapedPath {
    /// Offending path
    pub path: String,

    /// What makes it unsafe
    pub reason: String,
}

/// Derives `<repo>_<user>` from the last segment of the URL, minus `.git`
pub fn dir_name(repo_url: &str, user_id: &str) -> Result<String, StageError> {
    let trimmed = repo_url.trim().trim_end_matches('/');
    let segment = trimmed
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or_default();
    let repo = segment.strip_suffix(".git").unwrap_or(segment);

    if !is_safe_segment(repo) || repo == trimmed {
        return Err(StageError::Clone(format!("malformed repository URL: {}", repo_url)));
    }
    if !is_safe_segment(user_id) {
        return Err(StageError::Clone(format!("invalid user id: {}", user_id)));
    }

    Ok(format!("{}_{}", repo, user_id))
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Staging errors
#[derive(Debug, Error)]
pub enum StageError {
    /// Clone failed or the URL is malformed
    #[error("Clone failed: {0}")]
    Clone(String),

    /// Dependency manifest is absent
    #[error("Dependency manifest {0} not found at the project root")]
    MissingManifest(String),

    /// A staged tree could not be removed
    #[error("Failed to remove {path}: {error}")]
    Remove {
        /// Path involved
        path: String,
        /// Underlying failure
        error: String,
    },

    /// Staging I/O failure
    #[error("Staging I/O error at {path}: {error}")]
    Io {
        /// Path involved
        path: String,
        /// Underlying failure
        error: String,
    },

    /// The clone tool could not run
    #[error(transparent)]
    Exec(#[from] ExecError),
}
