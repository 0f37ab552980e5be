// src/security/vault.rs

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::SecretString;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::bundle::SettingsMap;
use crate::security::kms::{KeyManagementService, KmsError, KmsKey};

/// Per-user encrypted storage of settings bundles.
///
/// One key per user, created lazily and matched by description. One record
/// per `(user, project)` under the secrets directory. Plaintext is never
/// cached; every decrypt goes through the key service.
pub struct SecretVault {
    /// Key-management backend
    kms: Arc<dyn KeyManagementService>,

    /// Root of the record tree
    secrets_dir: PathBuf,
}

impl SecretVault {
    /// Creates a vault storing records under `secrets_dir`
    pub fn new(kms: Arc<dyn KeyManagementService>, secrets_dir: impl Into<PathBuf>) -> Self {
        Self {
            kms,
            secrets_dir: secrets_dir.into(),
        }
    }

    /// Name given to a user's key
    pub fn key_name(user_id: &str) -> String {
        format!("shipyard-user-{}", user_id)
    }

    /// Returns the user's key id, creating the key if none exists
    #[instrument(skip(self))]
    pub async fn ensure_key(&self, user_id: &str) -> Result<String, VaultError> {
        if let Some(key) = self.find_key(user_id).await? {
            debug!("Reusing key {} for user {}", key.id, user_id);
            return Ok(key.id);
        }

        let key_id = self
            .kms
            .create_key(user_id, &Self::key_name(user_id))
            .await?;
        info!("Created key {} for user {}", key_id, user_id);

        Ok(key_id)
    }

    async fn find_key(&self, user_id: &str) -> Result<Option<KmsKey>, KmsError> {
        let keys = self.kms.list_keys().await?;
        Ok(keys.into_iter().find(|k| k.description == user_id))
    }

    /// Encrypts the env rendering of `settings` into the `(user, project)` record
    #[instrument(skip(self, settings), fields(variables = settings.len()))]
    pub async fn encrypt(&self, user_id: &str, project_name: &str, settings: &SettingsMap) -> Result<(), VaultError> {
        let path = self.record_path(user_id, project_name)?;

        let key = self
            .find_key(user_id)
            .await
            .map_err(|e| VaultError::Encryption(e.to_string()))?
            .ok_or_else(|| VaultError::Encryption(format!("no key exists for user {}", user_id)))?;

        let plaintext = Zeroizing::new(settings.to_env_format());
        let encoded = Zeroizing::new(STANDARD.encode(plaintext.as_bytes()));

        let ciphertext_b64 = self
            .kms
            .encrypt(&key.id, &encoded)
            .await
            .map_err(|e| VaultError::Encryption(e.to_string()))?;
        let ciphertext = STANDARD
            .decode(ciphertext_b64.as_bytes())
            .map_err(|e| VaultError::Encryption(format!("ciphertext is not base64: {}", e)))?;

        write_atomically(&path, &ciphertext)?;
        debug!("Wrote {} byte secret record to {}", ciphertext.len(), path.display());

        Ok(())
    }

    /// Decrypts the `(user, project)` record back to its env rendering
    #[instrument(skip(self))]
    pub async fn decrypt(&self, user_id: &str, project_name: &str) -> Result<SecretString, VaultError> {
        let path = self.record_path(user_id, project_name)?;

        let ciphertext = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VaultError::Decryption(format!("no secret record at {}", path.display())))
            }
            Err(e) => {
                return Err(VaultError::Io {
                    path: path.display().to_string(),
                    error: e.to_string(),
                })
            }
        };

        let key = self
            .find_key(user_id)
            .await
            .map_err(|e| VaultError::Decryption(e.to_string()))?
            .ok_or_else(|| VaultError::Decryption(format!("no key exists for user {}", user_id)))?;

        let plaintext_b64 = Zeroizing::new(
            self.kms
                .decrypt(&key.id, &STANDARD.encode(&ciphertext))
                .await
                .map_err(|e| VaultError::Decryption(e.to_string()))?,
        );
        let bytes = Zeroizing::new(
            STANDARD
                .decode(plaintext_b64.as_bytes())
                .map_err(|e| VaultError::Decryption(format!("plaintext is not base64: {}", e)))?,
        );
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| VaultError::Decryption("plaintext is not UTF-8".to_string()))?;

        Ok(SecretString::new(text))
    }

    /// Deletes the `(user, project)` record; returns whether one existed
    pub fn remove_record(&self, user_id: &str, project_name: &str) -> Result<bool, VaultError> {
        let path = self.record_path(user_id, project_name)?;

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed secret record {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VaultError::Io {
                path: path.display().to_string(),
                error: e.to_string(),
            }),
        }
    }

    /// Location of the `(user, project)` record
    pub fn record_path(&self, user_id: &str, project_name: &str) -> Result<PathBuf, VaultError> {
        for segment in [user_id, project_name] {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') || segment.contains('\\') {
                return Err(VaultError::InvalidRecordName(segment.to_string()));
            }
        }

        Ok(self.secrets_dir.join(user_id).join(project_name))
    }
}

/// Writes via a temporary file in the target directory, then renames over the target
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), VaultError> {
    let io_error = |e: std::io::Error| VaultError::Io {
        path: path.display().to_string(),
        error: e.to_string(),
    };

    let dir = path
        .parent()
        .ok_or_else(|| VaultError::InvalidRecordName(path.display().to_string()))?;
    fs::create_dir_all(dir).map_err(io_error)?;

    let mut file = NamedTempFile::new_in(dir).map_err(io_error)?;
    file.write_all(contents).map_err(io_error)?;
    file.as_file().sync_all().map_err(io_error)?;
    file.persist(path).map_err(|e| io_error(e.error))?;

    Ok(())
}

/// Secret vault errors
#[derive(Debug, Error)]
pub enum VaultError {
    /// Encryption failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Key service failure
    #[error("Key service error: {0}")]
    KeyService(#[from] KmsError),

    /// User or project name is unsafe as a file name
    #[error("Invalid secret record name: {0}")]
    InvalidRecordName(String),

    /// Record I/O failure
    #[error("Secret record I/O error at {path}: {error}")]
    Io {
        /// Path involved
        path: String,
        /// Underlying failure
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use secrecy::ExposeSecret;
    use std::sync::Mutex;

    /// Reversible stand-in: ciphertext is the plaintext bytes reversed
    #[derive(Default)]
    struct ReversingKms {
        keys: Mutex<Vec<KmsKey>>,
        creates: Mutex<usize>,
        reject_decrypt: bool,
    }

    #[async_trait]
    impl KeyManagementService for ReversingKms {
        async fn create_key(&self, owner_id: &str, name: &str) -> Result<String, KmsError> {
            *self.creates.lock().unwrap() += 1;
            let mut keys = self.keys.lock().unwrap();
            let id = format!("key-{}", keys.len() + 1);
            keys.push(KmsKey {
                id: id.clone(),
                name: name.to_string(),
                description: owner_id.to_string(),
                status: "ACTIVE".to_string(),
                primary_version: None,
            });
            Ok(id)
        }

        async fn list_keys(&self) -> Result<Vec<KmsKey>, KmsError> {
            Ok(self.keys.lock().unwrap().clone())
        }

        async fn encrypt(&self, _key_id: &str, plaintext_b64: &str) -> Result<String, KmsError> {
            let mut bytes = STANDARD.decode(plaintext_b64).unwrap();
            bytes.reverse();
            Ok(STANDARD.encode(bytes))
        }

        async fn decrypt(&self, key_id: &str, ciphertext_b64: &str) -> Result<String, KmsError> {
            if self.reject_decrypt {
                return Err(KmsError::Status {
                    operation: "decrypt",
                    status: 400,
                    body: format!("ciphertext does not belong to {}", key_id),
                });
            }
            self.encrypt(key_id, ciphertext_b64).await
        }
    }

    fn settings() -> SettingsMap {
        vec![("SECRET_KEY", "abc=="), ("DATABASE_PASSWORD", "p"), ("DEBUG", "")]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn ensure_key_is_idempotent() {
        let kms = Arc::new(ReversingKms::default());
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretVault::new(kms.clone(), dir.path());

        let first = vault.ensure_key("7").await.unwrap();
        let second = vault.ensure_key("7").await.unwrap();
        let other = vault.ensure_key("8").await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(*kms.creates.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn round_trip_reproduces_env_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretVault::new(Arc::new(ReversingKms::default()), dir.path());
        let settings = settings();

        vault.ensure_key("7").await.unwrap();
        vault.encrypt("7", "blog", &settings).await.unwrap();

        let record = dir.path().join("7").join("blog");
        let stored = fs::read(&record).unwrap();
        assert!(!stored.is_empty());
        assert_ne!(stored, settings.to_env_format().into_bytes());

        let plaintext = vault.decrypt("7", "blog").await.unwrap();
        assert_eq!(plaintext.expose_secret(), &settings.to_env_format());
    }

    #[tokio::test]
    async fn encrypt_without_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretVault::new(Arc::new(ReversingKms::default()), dir.path());

        let err = vault.encrypt("7", "blog", &settings()).await.unwrap_err();
        assert!(matches!(err, VaultError::Encryption(_)));
        assert!(!dir.path().join("7").join("blog").exists());
    }

    #[tokio::test]
    async fn decrypt_without_record_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretVault::new(Arc::new(ReversingKms::default()), dir.path());
        vault.ensure_key("7").await.unwrap();

        assert!(matches!(vault.decrypt("7", "blog").await, Err(VaultError::Decryption(_))));
    }

    #[tokio::test]
    async fn rejected_ciphertext_is_a_decryption_error() {
        let dir = tempfile::tempdir().unwrap();
        let kms = Arc::new(ReversingKms {
            reject_decrypt: true,
            ..Default::default()
        });
        let vault = SecretVault::new(kms, dir.path());

        vault.ensure_key("7").await.unwrap();
        vault.encrypt("7", "blog", &settings()).await.unwrap();

        let err = vault.decrypt("7", "blog").await.unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));
    }

    #[tokio::test]
    async fn records_are_removed_once() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretVault::new(Arc::new(ReversingKms::default()), dir.path());

        vault.ensure_key("7").await.unwrap();
        vault.encrypt("7", "blog", &settings()).await.unwrap();

        assert!(vault.remove_record("7", "blog").unwrap());
        assert!(!vault.remove_record("7", "blog").unwrap());
    }

    #[test]
    fn record_names_cannot_escape_the_secrets_dir() {
        let vault = SecretVault::new(Arc::new(ReversingKms::default()), "/var/lib/shipyard/secrets");

        assert!(vault.record_path("7", "../etc").is_err());
        assert!(vault.record_path("..", "blog").is_err());
        assert!(vault.record_path("7", "").is_err());
        assert_eq!(
            vault.record_path("7", "blog").unwrap(),
            PathBuf::from("/var/lib/shipyard/secrets/7/blog")
        );
    }
}
