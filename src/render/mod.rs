// src/render/mod.rs

/// Brace placeholder templates
pub mod template;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::bundle::SettingsMap;
use crate::network::{ProxyError, ProxySite};
use crate::stage::{ensure_contained, EscapedPath, StagedProject};

pub use template::TemplateError;

/// Container build file template
pub const DOCKERFILE: &str = "Dockerfile";

/// Database bootstrap script template
pub const INIT_SQL: &str = "init.sql";

/// Host reverse-proxy server block template
pub const REVERSE_PROXY: &str = "reverse_nginx";

/// Compose descriptor template
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Optional in-deployment proxy configuration template
pub const PROXY_CONF: &str = "nginx.conf";

/// Paths of the artifacts written into a staged project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifacts {
    /// Container build file
    pub dockerfile: PathBuf,

    /// Database bootstrap script
    pub init_sql: PathBuf,

    /// Compose descriptor
    pub compose_file: PathBuf,

    /// In-deployment proxy configuration, when a template exists
    pub proxy_conf: Option<PathBuf>,
}

/// Renders deployment artifacts from the template directory
pub struct ArtifactRenderer {
    /// Directory holding the templates
    templates_dir: PathBuf,

    /// Host reverse proxy receiving the server block
    proxy: Arc<ProxySite>,
}

impl ArtifactRenderer {
    /// Creates a renderer
    pub fn new(templates_dir: impl Into<PathBuf>, proxy: Arc<ProxySite>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            proxy,
        }
    }

    /// Writes every artifact into the project root, then appends the server block
    #[instrument(skip(self, project, settings), fields(project = %project.dir_name))]
    pub async fn render(&self, project: &StagedProject, settings: &SettingsMap) -> Result<RenderedArtifacts, RenderError> {
        let full = |name: &str| settings.get(name).map(str::to_string);
        let dir_name = settings
            .get("DIR_NAME")
            .unwrap_or(project.dir_name.as_str())
            .to_string();

        let root = &project.root;
        let dockerfile = self.render_file(DOCKERFILE, root, &root.join(DOCKERFILE), |name| {
            (name == "DIR_NAME").then(|| dir_name.clone())
        })?;
        let init_sql = self.render_file(INIT_SQL, root, &root.join(INIT_SQL), full)?;

        let proxy_conf = if self.templates_dir.join(PROXY_CONF).is_file() {
            let target = root.join("config").join(PROXY_CONF);
            Some(self.render_file(PROXY_CONF, root, &target, full)?)
        } else {
            None
        };

        let compose_file = root.join(COMPOSE_FILE);
        let compose = self.compose_descriptor(settings, &dir_name)?;
        write(root, &compose_file, &compose)?;

        // Irreversible, so it goes last
        let snippet = self.render_template(REVERSE_PROXY, full)?;
        self.proxy.append(&snippet).await?;

        info!("Rendered deployment artifacts for {}", project.dir_name);

        Ok(RenderedArtifacts {
            dockerfile,
            init_sql,
            compose_file,
            proxy_conf,
        })
    }

    fn read_template(&self, name: &str) -> Result<String, RenderError> {
        let path = self.templates_dir.join(name);
        std::fs::read_to_string(&path).map_err(|e| RenderError::MissingTemplate {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    fn render_template<F>(&self, name: &str, lookup: F) -> Result<String, RenderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = self.read_template(name)?;
        template::render(&source, lookup).map_err(|error| RenderError::Template {
            template: name.to_string(),
            error,
        })
    }

    fn render_file<F>(&self, name: &str, root: &Path, target: &Path, lookup: F) -> Result<PathBuf, RenderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rendered = self.render_template(name, lookup)?;
        write(root, target, &rendered)?;
        debug!("Rendered {} to {}", name, target.display());
        Ok(target.to_path_buf())
    }

    /// Extends the `web` service with one build argument and one environment
    /// entry per settings key, and mounts the project directory
    fn compose_descriptor(&self, settings: &SettingsMap, dir_name: &str) -> Result<String, RenderError> {
        let source = self.read_template(COMPOSE_FILE)?;
        let mut document: Value = serde_yaml::from_str(&source)
            .map_err(|e| RenderError::Compose(format!("invalid template: {}", e)))?;

        let web = document
            .get_mut("services")
            .and_then(|services| services.get_mut("web"))
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| RenderError::Compose("services.web is missing".to_string()))?;

        let build = entry(web, "build", || Value::Mapping(Mapping::new()));
        if let Some(context) = build.as_str().map(str::to_string) {
            let mut mapping = Mapping::new();
            mapping.insert("context".into(), Value::String(context));
            *build = Value::Mapping(mapping);
        }
        let build = build
            .as_mapping_mut()
            .ok_or_else(|| RenderError::Compose("services.web.build must be a mapping".to_string()))?;
        let args = entry(build, "args", || Value::Sequence(Vec::new()));
        match args {
            Value::Sequence(args) => {
                args.extend(settings.keys().map(|k| Value::String(format!("{}=${{{}}}", k, k))));
            }
            Value::Mapping(args) => {
                for k in settings.keys() {
                    args.insert(k.into(), Value::String(format!("${{{}}}", k)));
                }
            }
            _ => return Err(RenderError::Compose("services.web.build.args must be a list or mapping".to_string())),
        }

        let environment = entry(web, "environment", || Value::Mapping(Mapping::new()));
        match environment {
            Value::Mapping(environment) => {
                for k in settings.keys() {
                    environment.insert(k.into(), Value::String(format!("${{{}}}", k)));
                }
            }
            Value::Sequence(environment) => {
                environment.extend(settings.keys().map(|k| Value::String(format!("{}=${{{}}}", k, k))));
            }
            _ => return Err(RenderError::Compose("services.web.environment must be a list or mapping".to_string())),
        }

        web.insert(
            "volumes".into(),
            Value::Sequence(vec![Value::String(format!(".:/{}", dir_name))]),
        );

        serde_yaml::to_string(&document).map_err(|e| RenderError::Compose(e.to_string()))
    }
}

/// The value under `key`, inserting `default()` when absent or null
fn entry<'a>(mapping: &'a mut Mapping, key: &str, default: impl FnOnce() -> Value) -> &'a mut Value {
    let value = mapping.entry(Value::String(key.to_string())).or_insert(Value::Null);
    if value.is_null() {
        *value = default();
    }
    value
}

/// Writes `contents` to `path`, which must stay inside the staged `root`
fn write(root: &Path, path: &Path, contents: &str) -> Result<(), RenderError> {
    ensure_contained(root, path)?;

    let io_error = |e: std::io::Error| RenderError::Io {
        path: path.display().to_string(),
        error: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(path, contents).map_err(io_error)
}

/// Artifact rendering errors
#[derive(Debug, Error)]
pub enum RenderError {
    /// Template file is missing or unreadable
    #[error("Template {path} unavailable: {error}")]
    MissingTemplate {
        /// Path involved
        path: String,
        /// Underlying failure
        error: String,
    },

    /// Template could not be rendered
    #[error("Template {template}: {error}")]
    Template {
        /// Template name
        template: String,
        /// Underlying failure
        error: TemplateError,
    },

    /// Compose descriptor could not be extended
    #[error("Compose descriptor: {0}")]
    Compose(String),

    /// Artifact could not be written
    #[error("Failed to write {path}: {error}")]
    Io {
        /// Path involved
        path: String,
        /// Underlying failure
        error: String,
    },

    /// Artifact target leaves the staged tree
    #[error(transparent)]
    Escape(#[from] EscapedPath),

    /// Server block could not be appended
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}
