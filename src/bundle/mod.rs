// src/bundle/mod.rs

//! Secret bundle parsing.
//!
//! A bundle is the raw secrets file a user uploads together with a format
//! tag (`json`, `txt`, ...). Parsers are looked up by tag in a
//! [`FormatRegistry`]; new formats register a parser without touching the
//! dispatcher. Every parser produces a [`SettingsMap`].

/// `KEY=value` line format
pub mod line;
/// JSON and YAML formats
pub mod structured;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

use crate::config::RequiredGroup;

/// Ordered mapping of uppercase variable name to opaque string value.
///
/// Insertion order is preserved so identical input always renders identical
/// artifacts. Re-inserting a key replaces the value in place.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SettingsMap {
    entries: Vec<(String, String)>,
}

impl SettingsMap {
    /// Creates an empty map
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Inserts a value, uppercasing the key
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        let key = key.as_ref().trim().to_uppercase();
        let value = value.into();

        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Looks a value up by (case-insensitive) name
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_uppercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the map holds the given name
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterates keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Merges another map into this one; later values win, first positions are kept
    pub fn extend(&mut self, mut other: SettingsMap) {
        for (k, v) in std::mem::take(&mut other.entries) {
            self.insert(k, v);
        }
    }

    /// Renders `KEY=value` lines, one per entry, in insertion order
    pub fn to_env_format(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k.to_uppercase(), v))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Reads back the output of [`SettingsMap::to_env_format`].
    ///
    /// Unlike the strict `txt` bundle parser, this splits on the first `=`
    /// so values that themselves contain `=` survive the round trip.
    pub fn from_env_format(text: &str) -> Result<Self, BundleError> {
        let mut map = SettingsMap::new();

        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                BundleError::Format(format!("line {} is not a KEY=value pair", number + 1))
            })?;
            if key.trim().is_empty() {
                return Err(BundleError::Format(format!("line {} has an empty key", number + 1)));
            }
            map.insert(key, value);
        }

        Ok(map)
    }
}

impl fmt::Debug for SettingsMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values are secrets; only names are shown
        f.debug_set().entries(self.keys()).finish()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for SettingsMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = SettingsMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Drop for SettingsMap {
    fn drop(&mut self) {
        for (_, value) in self.entries.iter_mut() {
            value.zeroize();
        }
    }
}

/// A parser for one bundle format
pub trait BundleParser: Send + Sync {
    /// Parses raw bundle content into a settings map
    fn parse(&self, content: &str) -> Result<SettingsMap, BundleError>;
}

/// Registry mapping format tags to parsers
pub struct FormatRegistry {
    parsers: HashMap<String, Arc<dyn BundleParser>>,
}

impl FormatRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self { parsers: HashMap::new() }
    }

    /// Creates a registry with the built-in formats
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        let json: Arc<dyn BundleParser> = Arc::new(structured::JsonParser);
        let yaml: Arc<dyn BundleParser> = Arc::new(structured::YamlParser);
        let line: Arc<dyn BundleParser> = Arc::new(line::LineParser);

        registry.register("json", json);
        registry.register("yaml", yaml.clone());
        registry.register("yml", yaml);
        registry.register("txt", line.clone());
        registry.register("env", line);

        registry
    }

    /// Registers a parser under a format tag (case-insensitive)
    pub fn register(&mut self, tag: &str, parser: Arc<dyn BundleParser>) {
        self.parsers.insert(normalize_tag(tag), parser);
    }

    /// Whether a tag has a registered parser
    pub fn supports(&self, tag: &str) -> bool {
        self.parsers.contains_key(&normalize_tag(tag))
    }

    /// Parses content with the parser registered for `tag`
    pub fn parse(&self, content: &str, tag: &str) -> Result<SettingsMap, BundleError> {
        let parser = self
            .parsers
            .get(&normalize_tag(tag))
            .ok_or_else(|| BundleError::UnsupportedFormat(tag.to_string()))?;

        let map = parser.parse(content)?;
        debug!(format = %tag, variables = map.len(), "Parsed secret bundle");
        Ok(map)
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Tags are matched case-insensitively and may carry a leading dot (`.json`)
fn normalize_tag(tag: &str) -> String {
    tag.trim().trim_start_matches('.').to_lowercase()
}

static DEFAULT_REGISTRY: Lazy<FormatRegistry> = Lazy::new(FormatRegistry::with_defaults);

/// Parses content with the built-in registry
pub fn parse(content: &str, format: &str) -> Result<SettingsMap, BundleError> {
    DEFAULT_REGISTRY.parse(content, format)
}

/// Fails with every `(group, name)` pair absent from the map
pub fn check_required(map: &SettingsMap, groups: &[RequiredGroup]) -> Result<(), BundleError> {
    let missing: Vec<(String, String)> = groups
        .iter()
        .flat_map(|g| g.names.iter().map(move |n| (g.group.clone(), n.clone())))
        .filter(|(_, name)| !map.contains_key(name))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(BundleError::MissingVariables { missing })
    }
}

/// Raw uploaded secrets plus their declared format. Zeroed on drop.
pub struct SecretBundle {
    content: String,
    format: String,
}

impl SecretBundle {
    /// Wraps uploaded content
    pub fn new(content: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            format: format.into(),
        }
    }

    /// Declared format tag
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Parses with `registry` and checks the required groups
    pub fn convert(&self, registry: &FormatRegistry, groups: &[RequiredGroup]) -> Result<SettingsMap, BundleError> {
        let map = registry.parse(&self.content, &self.format)?;
        check_required(&map, groups)?;
        Ok(map)
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("format", &self.format)
            .field("bytes", &self.content.len())
            .finish()
    }
}

impl Drop for SecretBundle {
    fn drop(&mut self) {
        self.content.zeroize();
    }
}

fn format_missing(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(group, name)| format!("({}, {})", group, name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Bundle parsing and validation errors
#[derive(Debug, Error)]
pub enum BundleError {
    /// Content is not valid for its format
    #[error("Malformed secret bundle: {0}")]
    Format(String),

    /// Required variables are absent
    #[error("Missing required variables: {}", format_missing(.missing))]
    MissingVariables {
        /// `(group, name)` pairs absent from the bundle
        missing: Vec<(String, String)>,
    },

    /// No parser is registered for the tag
    #[error("Unsupported bundle format: {0}")]
    UnsupportedFormat(String),
}
