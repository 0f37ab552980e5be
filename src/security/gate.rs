// src/security/gate.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::ScannerConfig;
use crate::execution::{CommandRunner, CommandSpec, ExecError};
use crate::stage::{DirectoryRemover, StagedProject};

/// Static-analysis checkpoint over a staged tree.
///
/// Every regular file is scanned on its own. The first file the scanner does
/// not pass destroys the whole staged tree.
pub struct SecurityGate {
    /// Runner for the scanner
    runner: Arc<dyn CommandRunner>,

    /// Scanner invocation
    scanner: ScannerConfig,

    /// Per-file timeout
    timeout: Duration,

    /// Disposes of rejected trees
    remover: DirectoryRemover,
}

impl SecurityGate {
    /// Creates a gate
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        scanner: ScannerConfig,
        timeout: Duration,
        remover: DirectoryRemover,
    ) -> Self {
        Self {
            runner,
            scanner,
            timeout,
            remover,
        }
    }

    /// Regular files under the staged root, in a stable order
    pub fn files(&self, root: &Path) -> Result<Vec<PathBuf>, GateError> {
        let exclude = &self.scanner.exclude;
        let mut files = Vec::new();

        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !exclude.iter().any(|x| entry.file_name().to_str() == Some(x.as_str()))
            });

        for entry in walker {
            let entry = entry.map_err(|e| GateError::Walk(e.to_string()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        Ok(files)
    }

    /// Scans every file; on the first disqualifying one the tree is deleted
    #[instrument(skip(self, project), fields(root = %project.root.display()))]
    pub async fn scan(&self, project: &StagedProject) -> Result<(), GateError> {
        let files = match self.files(&project.root) {
            Ok(files) => files,
            Err(e) => {
                self.dispose(project).await;
                return Err(e);
            }
        };
        debug!("Scanning {} files", files.len());

        for file in &files {
            let args = self
                .scanner
                .args
                .iter()
                .map(|a| a.replace("{file}", &file.display().to_string()));
            let spec = CommandSpec::new(&self.scanner.program, self.timeout)
                .args(args)
                .current_dir(&project.root);

            let result = match self.runner.run(&spec).await {
                Ok(result) => result,
                Err(e) => {
                    self.dispose(project).await;
                    return Err(e.into());
                }
            };

            if !result.success() {
                let relative = file.strip_prefix(&project.root).unwrap_or(file);
                warn!("Security issue in {}, discarding {}", relative.display(), project.dir_name);
                metrics::increment_counter!("shipyard_scan_rejections_total");

                self.dispose(project).await;
                return Err(GateError::SecurityIssue {
                    file: relative.display().to_string(),
                    findings: result.stdout,
                });
            }
        }

        info!("{} passed the security scan ({} files)", project.dir_name, files.len());
        Ok(())
    }

    async fn dispose(&self, project: &StagedProject) {
        if let Err(e) = self.remover.remove(&project.root).await {
            warn!("Failed to discard {}: {}", project.root.display(), e);
        }
    }
}

/// Security gate errors
#[derive(Debug, Error)]
pub enum GateError {
    /// The scanner flagged a file
    #[error("Security issues found in {file}:\n{findings}")]
    SecurityIssue {
        /// Offending file, relative to the project root
        file: String,
        /// Scanner report
        findings: String,
    },

    /// The tree could not be walked
    #[error("Failed to enumerate staged files: {0}")]
    Walk(String),

    /// The scanner could not run
    #[error(transparent)]
    Exec(#[from] ExecError),
}
