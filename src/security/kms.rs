// src/security/kms.rs

//! Key-management service client.
//!
//! Speaks the Yandex Cloud KMS REST dialect: keys live in a folder, are
//! listed page by page, and encrypt/decrypt take base64 payloads.

use std::time::Duration;
use async_trait::async_trait;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::{KmsConfig, KmsEndpoints};

/// A symmetric key as reported by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmsKey {
    /// Key id, substituted for `{keyId}` in the encrypt/decrypt endpoints
    pub id: String,

    /// Key name
    #[serde(default)]
    pub name: String,

    /// Free-form description; holds the owning user id
    #[serde(default)]
    pub description: String,

    /// Key status (ACTIVE, INACTIVE, ...)
    #[serde(default)]
    pub status: String,

    /// Current primary version
    #[serde(default)]
    pub primary_version: Option<KeyVersion>,
}

/// A key version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyVersion {
    /// Version id
    pub id: String,

    /// Owning key id
    #[serde(default)]
    pub key_id: String,
}

/// Operations the pipeline needs from a key-management service
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// Creates a key owned by `owner_id` and returns its id
    async fn create_key(&self, owner_id: &str, name: &str) -> Result<String, KmsError>;

    /// Lists every key in the configured folder
    async fn list_keys(&self) -> Result<Vec<KmsKey>, KmsError>;

    /// Encrypts base64 plaintext, returning base64 ciphertext
    async fn encrypt(&self, key_id: &str, plaintext_b64: &str) -> Result<String, KmsError>;

    /// Decrypts base64 ciphertext, returning base64 plaintext
    async fn decrypt(&self, key_id: &str, ciphertext_b64: &str) -> Result<String, KmsError>;
}

/// HTTPS client for the key-management REST API
pub struct HttpKms {
    /// HTTP client with the request timeout applied
    client: Client,

    /// Service endpoints
    endpoints: KmsEndpoints,

    /// Folder owning the keys
    folder_id: String,

    /// Bearer token
    token: SecretString,

    /// Algorithm for new keys
    algorithm: String,

    /// Rotation period for new keys
    rotation_period: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListKeysResponse {
    #[serde(default)]
    keys: Vec<KmsKey>,

    #[serde(default)]
    next_page_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationMetadata {
    key_id: String,
}

/// Key creation returns an operation wrapping the new key
#[derive(Deserialize)]
struct CreateKeyResponse {
    #[serde(default)]
    id: Option<String>,

    #[serde(default)]
    metadata: Option<OperationMetadata>,

    #[serde(default)]
    response: Option<KmsKey>,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

impl HttpKms {
    /// Creates a client from configuration and a resolved bearer token
    pub fn new(config: &KmsConfig, token: SecretString) -> Result<Self, KmsError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| KmsError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoints: config.endpoints.clone(),
            folder_id: config.folder_id.clone(),
            token,
            algorithm: config.algorithm.clone(),
            rotation_period: config.rotation_period.clone(),
        })
    }

    fn key_endpoint(template: &str, key_id: &str) -> String {
        template.replace("{keyId}", key_id)
    }

    /// Fails on any non-2xx response
    async fn check(operation: &'static str, response: Response) -> Result<Response, KmsError> {
        let status = response.status();
        metrics::increment_counter!(
            "shipyard_kms_requests_total",
            "operation" => operation,
            "status" => status.as_u16().to_string()
        );

        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(KmsError::Status {
                operation,
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn post(&self, operation: &'static str, url: &str, body: serde_json::Value) -> Result<Response, KmsError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| KmsError::Transport(e.to_string()))?;

        Self::check(operation, response).await
    }
}

#[async_trait]
impl KeyManagementService for HttpKms {
    async fn create_key(&self, owner_id: &str, name: &str) -> Result<String, KmsError> {
        let body = json!({
            "folderId": self.folder_id,
            "name": name,
            "description": owner_id,
            "defaultAlgorithm": self.algorithm,
            "rotationPeriod": self.rotation_period,
            "deletionProtection": false,
        });

        let response = self.post("create", &self.endpoints.create, body).await?;
        let created: CreateKeyResponse = response
            .json()
            .await
            .map_err(|e| KmsError::InvalidResponse(e.to_string()))?;

        created
            .metadata
            .map(|m| m.key_id)
            .or_else(|| created.response.map(|k| k.id))
            .or(created.id)
            .ok_or_else(|| KmsError::InvalidResponse("key creation returned no key id".to_string()))
    }

    async fn list_keys(&self) -> Result<Vec<KmsKey>, KmsError> {
        let mut keys = Vec::new();
        let mut page_token = String::new();

        loop {
            let mut request = self
                .client
                .get(&self.endpoints.list)
                .bearer_auth(self.token.expose_secret())
                .query(&[("folderId", self.folder_id.as_str())]);
            if !page_token.is_empty() {
                request = request.query(&[("pageToken", page_token.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| KmsError::Transport(e.to_string()))?;
            let page: ListKeysResponse = Self::check("list", response)
                .await?
                .json()
                .await
                .map_err(|e| KmsError::InvalidResponse(e.to_string()))?;

            keys.extend(page.keys);
            if page.next_page_token.is_empty() {
                break;
            }
            page_token = page.next_page_token;
        }

        debug!("Listed {} keys in folder {}", keys.len(), self.folder_id);
        Ok(keys)
    }

    async fn encrypt(&self, key_id: &str, plaintext_b64: &str) -> Result<String, KmsError> {
        let url = Self::key_endpoint(&self.endpoints.encrypt, key_id);
        let response = self
            .post("encrypt", &url, json!({ "plaintext": plaintext_b64 }))
            .await?;

        let encrypted: EncryptResponse = response
            .json()
            .await
            .map_err(|e| KmsError::InvalidResponse(e.to_string()))?;
        Ok(encrypted.ciphertext)
    }

    async fn decrypt(&self, key_id: &str, ciphertext_b64: &str) -> Result<String, KmsError> {
        let url = Self::key_endpoint(&self.endpoints.decrypt, key_id);
        let response = self
            .post("decrypt", &url, json!({ "ciphertext": ciphertext_b64 }))
            .await?;

        let decrypted: DecryptResponse = response
            .json()
            .await
            .map_err(|e| KmsError::InvalidResponse(e.to_string()))?;
        Ok(decrypted.plaintext)
    }
}

/// Key-management client errors
#[derive(Debug, Error)]
pub enum KmsError {
    /// Request did not complete
    #[error("Key service unreachable: {0}")]
    Transport(String),

    /// Service answered with a non-success status
    #[error("Key service rejected {operation} with status {status}: {body}")]
    Status {
        /// KMS operation
        operation: &'static str,
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },

    /// Response body was not understood
    #[error("Unexpected key service response: {0}")]
    InvalidResponse(String),
}
