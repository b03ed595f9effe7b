use chrono::{DateTime, Utc};

/// The reposign error type.
#[derive(Debug, thiserror::Error)]
pub enum RSError {
    #[error("Internal error: [{0}]")]
    InternalError(String),

    #[error("I/O error")]
    IOError(#[from] std::io::Error),

    #[error("Ed25519 signature function error")]
    CryptoError(#[from] ed25519_compact::Error),

    #[error("JSON serialization error")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid threshold: {0} (must be at least 1)")]
    InvalidThreshold(u32),

    #[error("Unknown role: {0}")]
    RoleNotFound(String),

    #[error("Role already exists: {0}")]
    DuplicateRole(String),

    #[error("Role '{0}' cannot hold targets or delegations")]
    InvalidParentRole(String),

    #[error("Delegation for role '{0}' has an empty scope")]
    EmptyDelegationScope(String),

    #[error("Invalid bin count: {0} (must be a power of two, at most 65536)")]
    InvalidBinCount(u32),

    #[error("Path '{path}' is outside the scope of role '{role}'")]
    ScopeViolation { role: String, path: String },

    #[error("Hashed bins under '{0}' do not partition the hash space")]
    IncompletePartition(String),

    #[error("No verification key with keyid {keyid} on role '{role}'")]
    KeyMismatch { role: String, keyid: String },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Unable to decrypt private key (wrong passphrase?)")]
    DecryptionError,

    #[error("Unsupported key type")]
    UnsupportedKeyType,

    #[error("Role '{role}' has {valid} valid signatures, threshold is {threshold}")]
    InsufficientSignatures {
        role: String,
        valid: usize,
        threshold: u32,
    },

    #[error("Metadata for role '{role}' expired at {expires}")]
    ExpiredMetadata {
        role: String,
        expires: DateTime<Utc>,
    },

    #[error("Repository is locked by another writer")]
    RepositoryLocked,
}
