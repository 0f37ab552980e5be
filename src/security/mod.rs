// Security subsystem

/// Static-analysis gate
pub mod gate;
/// Key-management service client
pub mod kms;
/// Encrypted secret records
pub mod vault;

// Re-exports
pub use gate::{GateError, SecurityGate};
pub use kms::{HttpKms, KeyManagementService, KmsError, KmsKey};
pub use vault::{SecretVault, VaultError};
