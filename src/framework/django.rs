// src/framework/django.rs

use std::path::{Path, PathBuf};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, info};

use crate::bundle::SettingsMap;
use crate::framework::{AssetDefaults, FrameworkDescriptor, FrameworkModule};
use crate::settings::ComposeError;
use crate::stage::{ensure_contained, EscapedPath};

/// Variable naming the settings module
pub const SETTINGS_VARIABLE: &str = "DJANGO_SETTINGS_MODULE";

static ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([A-Z_][A-Z0-9_]*)\s*=\s*(.+)$").expect("assignment regex"));
static STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"\n]*)"|'([^'\n]*)'"#).expect("string literal regex"));
static ALLOWED_HOSTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(ALLOWED_HOSTS\s*=\s*\[).*?(\])").expect("allowed hosts regex"));
static CSRF_TRUSTED_ORIGINS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(CSRF_TRUSTED_ORIGINS\s*=\s*\[).*?(\])").expect("trusted origins regex"));
static MODULE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("module segment regex"));

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Django projects: a dotted settings module with plain top-level assignments
#[derive(Debug, Clone, Default)]
pub struct DjangoDescriptor;

impl DjangoDescriptor {
    /// Creates the descriptor
    pub fn new() -> Self {
        Self
    }

    /// Right-hand side of the last top-level `NAME = ...` assignment
    fn assignment<'a>(source: &'a str, name: &str) -> Option<&'a str> {
        ASSIGNMENT
            .captures_iter(source)
            .filter(|caps| &caps[1] == name)
            .last()
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str())
    }

    /// Last string literal of an expression (`BASE_DIR / "static"` gives `static`)
    fn last_literal(expression: &str) -> Option<String> {
        STRING_LITERAL
            .captures_iter(expression)
            .last()
            .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
            .map(|m| m.as_str().to_string())
    }

    fn asset_defaults(&self, module: &FrameworkModule, prefix: &str, fallback: &str) -> AssetDefaults {
        let url = Self::assignment(&module.source, &format!("{}_URL", prefix))
            .and_then(Self::last_literal)
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| format!("/{}/", fallback));

        let root = Self::assignment(&module.source, &format!("{}_ROOT", prefix))
            .and_then(Self::last_literal)
            .and_then(|path| {
                path.trim_end_matches(is_separator)
                    .rsplit(is_separator)
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| fallback.to_string());

        AssetDefaults { url, root }
    }

    fn candidates(root: &Path, module: &str) -> Vec<PathBuf> {
        let relative: PathBuf = module.split('.').collect();
        vec![
            root.join(&relative).with_extension("py"),
            root.join(&relative).join("__init__.py"),
        ]
    }

    fn pin(pattern: &Regex, source: &str, entry: &str) -> (String, bool) {
        let mut found = false;
        let rewritten = pattern.replace_all(source, |caps: &Captures<'_>| {
            found = true;
            format!("{}\"{}\"{}", &caps[1], entry, &caps[2])
        });
        (rewritten.into_owned(), found)
    }
}

impl FrameworkDescriptor for DjangoDescriptor {
    fn name(&self) -> &'static str {
        "django"
    }

    fn resolve_module(&self, root: &Path, settings: &SettingsMap) -> Result<FrameworkModule, ComposeError> {
        let name = settings
            .get(SETTINGS_VARIABLE)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ComposeError::SettingsModuleNotFound(format!("{} is not set", SETTINGS_VARIABLE)))?;

        if !name.split('.').all(|segment| MODULE_SEGMENT.is_match(segment)) {
            return Err(ComposeError::SettingsModuleNotFound(format!(
                "{} is not a module name",
                name
            )));
        }

        let path = Self::candidates(root, name)
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| ComposeError::SettingsModuleNotFound(format!("{} not found in the project", name)))?;
        ensure_contained(root, &path)?;

        let source = std::fs::read_to_string(&path).map_err(|e| ComposeError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        debug!("Resolved settings module {} to {}", name, path.display());

        Ok(FrameworkModule {
            name: name.to_string(),
            path,
            source,
        })
    }

    fn package_name(&self, module: &FrameworkModule) -> String {
        module.name.split('.').next().unwrap_or_default().to_string()
    }

    fn static_defaults(&self, module: &FrameworkModule) -> AssetDefaults {
        self.asset_defaults(module, "STATIC", "static")
    }

    fn media_defaults(&self, module: &FrameworkModule) -> AssetDefaults {
        self.asset_defaults(module, "MEDIA", "media")
    }

    fn rewrite_host_allowlist(&self, module: &FrameworkModule, host: &str) -> Result<(), ComposeError> {
        let is_link = std::fs::symlink_metadata(&module.path)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            return Err(EscapedPath {
                path: module.path.display().to_string(),
                reason: "the settings module is a symbolic link".to_string(),
            }
            .into());
        }

        let source = std::fs::read_to_string(&module.path).map_err(|e| ComposeError::Io {
            path: module.path.display().to_string(),
            error: e.to_string(),
        })?;

        let (mut source, hosts_found) = Self::pin(&ALLOWED_HOSTS, &source, host);
        let origin = format!("https://{}", host);
        let (rewritten, origins_found) = Self::pin(&CSRF_TRUSTED_ORIGINS, &source, &origin);
        source = rewritten;

        // Django rejects every host when the list is missing and DEBUG is off
        if !hosts_found {
            source.push_str(&format!("\nALLOWED_HOSTS = [\"{}\"]\n", host));
        }
        if !origins_found {
            source.push_str(&format!("\nCSRF_TRUSTED_ORIGINS = [\"{}\"]\n", origin));
        }

        std::fs::write(&module.path, source).map_err(|e| ComposeError::Io {
            path: module.path.display().to_string(),
            error: e.to_string(),
        })?;
        info!("Pinned {} to host {}", module.name, host);

        Ok(())
    }
}
