// src/config/mod.rs

/// JSON schema of the configuration file
pub mod schema;
/// Semantic configuration checks
pub mod validator;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Environment prefix for configuration overrides (`SHIPYARD_KMS__FOLDER_ID=...`)
pub const ENV_PREFIX: &str = "SHIPYARD";

/// Comprehensive configuration for an orchestrator instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Configuration format version
    pub version: String,

    /// Filesystem locations owned by the orchestrator
    pub paths: PathsConfig,

    /// TLS material handed to deployed projects
    pub tls: TlsConfig,

    /// Key-management service configuration
    pub kms: KmsConfig,

    /// External tool invocation configuration
    pub tools: ToolsConfig,

    /// Deployment policy
    pub deployment: DeploymentConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the per-user encrypted secret records
    pub secrets_dir: PathBuf,

    /// Root under which projects are staged
    pub projects_dir: PathBuf,

    /// Directory holding the artifact templates
    pub templates_dir: PathBuf,

    /// Shared reverse-proxy site configuration that snippets are appended to
    pub proxy_site_config: PathBuf,
}

/// TLS paths injected into every deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Common directory holding certificates and keys
    pub ssl_path: String,

    /// Certificate chain path
    pub cert_path: String,

    /// Private key path
    pub key_path: String,

    /// Whether to verify that the certificate and key files parse at startup
    #[serde(default)]
    pub verify_files: bool,
}

/// Key-management service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsConfig {
    /// REST endpoints of the service
    pub endpoints: KmsEndpoints,

    /// Folder that owns the keys
    pub folder_id: String,

    /// Source of the bearer token
    pub iam_token: SecretSource,

    /// Default algorithm for newly created keys
    pub algorithm: String,

    /// Rotation period for newly created keys (service duration syntax, e.g. "604800s")
    pub rotation_period: String,

    /// Per-request timeout in seconds
    pub request_timeout_seconds: u64,
}

/// KMS REST endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsEndpoints {
    /// Key creation endpoint
    pub create: String,

    /// Key listing endpoint
    pub list: String,

    /// Encryption endpoint template containing `{keyId}`
    pub encrypt: String,

    /// Decryption endpoint template containing `{keyId}`
    pub decrypt: String,
}

/// External tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Source-control client binary
    pub git: String,

    /// Static-analysis scanner
    pub scanner: ScannerConfig,

    /// Container toolchain binary (invoked as `<docker> compose ...`)
    pub docker: String,

    /// Command restarting the reverse proxy after bring-up
    pub proxy_reload: Vec<String>,

    /// Command prefix used when an unprivileged delete is refused
    pub privileged_remove: Vec<String>,

    /// Per-step timeouts
    pub timeouts: TimeoutConfig,
}

/// Static-analysis scanner invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Scanner binary
    pub program: String,

    /// Arguments; `{file}` is replaced by the scanned path
    pub args: Vec<String>,

    /// Directory names skipped during the walk
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Timeouts for external steps, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Repository clone timeout in seconds
    pub clone_seconds: u64,
    /// Security scan of one file timeout in seconds
    pub scan_seconds: u64,
    /// Image build timeout in seconds
    pub build_seconds: u64,
    /// Service bring-up timeout in seconds
    pub up_seconds: u64,
    /// Service teardown timeout in seconds
    pub down_seconds: u64,
    /// Reverse-proxy reload timeout in seconds
    pub reload_seconds: u64,
}

/// Deployment policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Domain under which project subdomains are published
    pub base_domain: String,

    /// Dependency manifest that must exist at the staged root
    pub manifest_file: String,

    /// Required variable groups, checked in order
    pub required_variables: Vec<RequiredGroup>,
}

/// One group of required bundle variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredGroup {
    /// Group name (SETTINGS, DB, ADMIN)
    pub group: String,

    /// Variable names belonging to the group
    pub names: Vec<String>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: LogLevel,

    /// Output format
    pub format: LogFormat,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Errors only
    Error,
    /// Warnings and above
    Warning,
    /// Informational and above
    Info,
    /// Debug and above
    Debug,
    /// Everything
    Trace,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Plain text
    Plain,

    /// JSON format
    Json,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to expose a Prometheus endpoint
    pub enabled: bool,

    /// Listen address of the Prometheus endpoint
    pub listen_addr: Option<String>,
}

/// Where a secret value comes from.
///
/// `env:NAME` reads an environment variable, `file:/path` reads (and trims) a
/// file, anything else is taken literally.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretSource(pub String);

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.split_once(':') {
            Some((kind @ ("env" | "file"), path)) => write!(f, "SecretSource({}:{})", kind, path),
            _ => f.write_str("SecretSource([REDACTED])"),
        }
    }
}

impl SecretSource {
    /// Resolves the source to its actual value
    pub fn resolve(&self) -> Result<SecretString, ConfigError> {
        match self.0.split_once(':') {
            Some(("env", name)) => std::env::var(name)
                .map(SecretString::new)
                .map_err(|_| ConfigError::SecretResolutionError {
                    reference: self.0.clone(),
                    error: format!("Environment variable {} not found", name),
                }),
            Some(("file", path)) => fs::read_to_string(path)
                .map(|s| SecretString::new(s.trim().to_string()))
                .map_err(|e| ConfigError::SecretResolutionError {
                    reference: format!("file:{}", path),
                    error: format!("Failed to read file {}: {}", path, e),
                }),
            _ if self.0.is_empty() => Err(ConfigError::InvalidSecretSource("empty secret".to_string())),
            _ => Ok(SecretString::new(self.0.clone())),
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    /// Current active configuration
    config: OrchestratorConfig,

    /// Configuration file path
    config_path: Option<PathBuf>,

    /// Resolved KMS bearer token
    iam_token: Option<SecretString>,

    /// Whether the configuration has been validated
    validated: bool,
}

impl ConfigManager {
    /// Creates a new configuration manager with a default configuration
    pub fn new() -> Self {
        Self::from_config(Self::default_config())
    }

    /// Wraps an already-built configuration
    pub fn from_config(config: OrchestratorConfig) -> Self {
        Self {
            config,
            config_path: None,
            iam_token: None,
            validated: false,
        }
    }

    /// Loads configuration from a file, applying `SHIPYARD_*` environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileReadError {
                path: path.display().to_string(),
                error: "file does not exist".to_string(),
            });
        }

        let config: OrchestratorConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).prefix_separator("_").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let mut manager = Self {
            config,
            config_path: Some(path.to_path_buf()),
            iam_token: None,
            validated: false,
        };

        manager.validate()?;

        info!("Configuration loaded from {}", path.display());

        Ok(manager)
    }

    /// Saves the current configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let config_str = serde_yaml::to_string(&self.config)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        fs::write(&path, config_str)
            .map_err(|e| ConfigError::FileWriteError {
                path: path.as_ref().display().to_string(),
                error: e.to_string(),
            })?;

        info!("Configuration saved to {}", path.as_ref().display());

        Ok(())
    }

    /// Validates the current configuration against the schema and semantic rules
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let as_json = serde_json::to_value(&self.config)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        schema::validate_config_against_schema(&as_json)
            .map_err(ConfigError::ValidationError)?;

        validator::ConfigValidator::new().validate(&self.config)?;

        self.validated = true;
        debug!("Configuration validated successfully");

        Ok(())
    }

    /// Gets the current configuration
    pub fn get_config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Path the configuration was loaded from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Whether `validate` has succeeded for the current configuration
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Resolves secret sources referenced by the configuration
    pub fn resolve_secrets(&mut self) -> Result<(), ConfigError> {
        let token = self.config.kms.iam_token.resolve()?;
        debug!("Resolved KMS bearer token");
        self.iam_token = Some(token);
        Ok(())
    }

    /// The resolved KMS bearer token
    pub fn iam_token(&self) -> Result<SecretString, ConfigError> {
        self.iam_token
            .clone()
            .ok_or_else(|| ConfigError::InvalidSecretReference("kms.iam_token not resolved".to_string()))
    }

    /// Creates a default configuration
    pub fn default_config() -> OrchestratorConfig {
        OrchestratorConfig {
            version: "1.0".to_string(),
            paths: PathsConfig {
                secrets_dir: PathBuf::from("/var/lib/shipyard/secrets"),
                projects_dir: PathBuf::from("/var/lib/shipyard/projects"),
                templates_dir: PathBuf::from("/etc/shipyard/templates"),
                proxy_site_config: PathBuf::from("/etc/nginx/sites-available/default"),
            },
            tls: TlsConfig {
                ssl_path: "/etc/ssl/shipyard".to_string(),
                cert_path: "/etc/ssl/shipyard/fullchain.pem".to_string(),
                key_path: "/etc/ssl/shipyard/privkey.pem".to_string(),
                verify_files: false,
            },
            kms: KmsConfig {
                endpoints: KmsEndpoints {
                    create: "https://kms.api.cloud.yandex.net/kms/v1/keys".to_string(),
                    list: "https://kms.api.cloud.yandex.net/kms/v1/keys".to_string(),
                    encrypt: "https://kms.yandex/kms/v1/keys/{keyId}:encrypt".to_string(),
                    decrypt: "https://kms.yandex/kms/v1/keys/{keyId}:decrypt".to_string(),
                },
                folder_id: String::new(),
                iam_token: SecretSource("env:YC_IAM_TOKEN".to_string()),
                algorithm: "AES_256".to_string(),
                rotation_period: "604800s".to_string(),
                request_timeout_seconds: 30,
            },
            tools: ToolsConfig {
                git: "git".to_string(),
                scanner: ScannerConfig {
                    program: "bandit".to_string(),
                    args: vec![
                        "-r".to_string(),
                        "{file}".to_string(),
                        "--severity-level".to_string(),
                        "medium".to_string(),
                        "--confidence-level".to_string(),
                        "high".to_string(),
                    ],
                    exclude: vec![],
                },
                docker: "docker".to_string(),
                proxy_reload: vec![
                    "sudo".to_string(),
                    "service".to_string(),
                    "nginx".to_string(),
                    "restart".to_string(),
                ],
                privileged_remove: vec!["sudo".to_string(), "rm".to_string(), "-rf".to_string()],
                timeouts: TimeoutConfig {
                    clone_seconds: 300,
                    scan_seconds: 60,
                    build_seconds: 1800,
                    up_seconds: 300,
                    down_seconds: 300,
                    reload_seconds: 60,
                },
            },
            deployment: DeploymentConfig {
                base_domain: "ewdbot.com".to_string(),
                manifest_file: "requirements.txt".to_string(),
                required_variables: default_required_variables(),
            },
            observability: ObservabilityConfig {
                logging: LoggingConfig {
                    level: LogLevel::Info,
                    format: LogFormat::Plain,
                },
                metrics: MetricsConfig {
                    enabled: false,
                    listen_addr: None,
                },
            },
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The variables every Django bundle must carry
pub fn default_required_variables() -> Vec<RequiredGroup> {
    let group = |name: &str, names: &[&str]| RequiredGroup {
        group: name.to_string(),
        names: names.iter().map(|n| n.to_string()).collect(),
    };

    vec![
        group("SETTINGS", &["DJANGO_SETTINGS_MODULE", "SECRET_KEY"]),
        group("DB", &["DATABASE_NAME", "DATABASE_USER", "DATABASE_PASSWORD"]),
        group("ADMIN", &["ADMIN_USERNAME", "ADMIN_EMAIL", "ADMIN_PASSWORD"]),
    ]
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read configuration file {path}: {error}")]
    FileReadError {
        /// Path involved
        path: String,
        /// Underlying failure
        error: String,
    },

    /// Configuration file could not be written
    #[error("Failed to write configuration file {path}: {error}")]
    FileWriteError {
        /// Path involved
        path: String,
        /// Underlying failure
        error: String,
    },

    /// Configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Configuration could not be serialized
    #[error("Failed to serialize configuration: {0}")]
    SerializationError(String),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Malformed secret reference
    #[error("Invalid secret reference: {0}")]
    InvalidSecretReference(String),

    /// Unusable secret source
    #[error("Invalid secret source: {0}")]
    InvalidSecretSource(String),

    /// Secret reference could not be resolved
    #[error("Failed to resolve secret {reference}: {error}")]
    SecretResolutionError {
        /// Secret reference, never the secret itself
        reference: String,
        /// Underlying failure
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn default_config_validates_without_tls_file_checks() {
        let mut manager = ConfigManager::new();
        manager.validate().unwrap();
        assert!(manager.is_validated());
    }

    #[test]
    fn secret_source_reads_file_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token");
        fs::write(&token_path, "t1.abcdef\n").unwrap();

        let source = SecretSource(format!("file:{}", token_path.display()));
        assert_eq!(source.resolve().unwrap().expose_secret(), "t1.abcdef");
    }

    #[test]
    fn secret_source_debug_never_prints_literals() {
        let source = SecretSource("t1.very-secret".to_string());
        assert_eq!(format!("{:?}", source), "SecretSource([REDACTED])");

        let source = SecretSource("env:YC_IAM_TOKEN".to_string());
        assert_eq!(format!("{:?}", source), "SecretSource(env:YC_IAM_TOKEN)");
    }

    #[test]
    fn missing_env_secret_is_a_resolution_error() {
        let source = SecretSource("env:SHIPYARD_TEST_SURELY_UNSET_VARIABLE".to_string());
        match source.resolve() {
            Err(ConfigError::SecretResolutionError { reference, error }) => {
                assert_eq!(reference, "env:SHIPYARD_TEST_SURELY_UNSET_VARIABLE");
                assert!(error.contains("SHIPYARD_TEST_SURELY_UNSET_VARIABLE"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn yaml_round_trip_through_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipyard.yaml");

        let manager = ConfigManager::new();
        manager.save_to_file(&path).unwrap();

        let loaded = ConfigManager::load_from_file(&path).unwrap();
        assert_eq!(loaded.get_config().deployment.base_domain, "ewdbot.com");
        assert_eq!(loaded.get_config().deployment.required_variables, default_required_variables());
        assert_eq!(loaded.config_path(), Some(path.as_path()));
    }
}
