//! Encrypted key persistence with restrictive permissions
//!
//! Private keys are encrypted at rest with a passphrase-derived key
//! (Argon2id + ChaCha20-Poly1305) and written with mode 0600 on Unix so the
//! key material is never readable by other users. Public keys are stored as
//! plain hex. Passphrases reach this module either directly or through a
//! [`CredentialProvider`], so core logic never blocks on interactive input.

use crate::error::RSError;
use crate::keys::{KeyPair, PublicKey, SecretKey};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Salt length for the passphrase KDF.
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

/// The restrictive permission mode for key files (owner read/write only)
#[cfg(unix)]
const SECURE_FILE_MODE: u32 = 0o600;

/// Maps a key name to its passphrase.
///
/// The original workflow prompted the operator at decryption time; embedding
/// applications implement this trait instead (environment, agent, prompt),
/// which keeps key loading synchronous and testable.
pub trait CredentialProvider {
    /// Return the passphrase for the named key, or [`RSError::KeyNotFound`]
    /// if no credential is known for it.
    fn passphrase(&self, key_name: &str) -> Result<String, RSError>;
}

/// In-memory credential provider for tests and pre-configured deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: BTreeMap<String, String>,
}

impl StaticCredentials {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a passphrase for a key name.
    pub fn insert(&mut self, key_name: &str, passphrase: &str) {
        self.credentials
            .insert(key_name.to_string(), passphrase.to_string());
    }
}

impl CredentialProvider for StaticCredentials {
    fn passphrase(&self, key_name: &str) -> Result<String, RSError> {
        self.credentials
            .get(key_name)
            .cloned()
            .ok_or_else(|| RSError::KeyNotFound(key_name.to_string()))
    }
}

/// On-disk format of an encrypted private key.
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeyFile {
    kdf: String,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Generate a key pair and persist both halves: `<path>` holds the encrypted
/// private key, `<path>.pub` the public key.
pub fn generate_and_persist_keypair(path: &Path, passphrase: &str) -> Result<KeyPair, RSError> {
    let kp = KeyPair::generate();
    persist_private_key(&kp.sk, path, passphrase)?;
    let mut pub_path = path.as_os_str().to_owned();
    pub_path.push(".pub");
    persist_public_key(&kp.pk, Path::new(&pub_path))?;
    Ok(kp)
}

/// Encrypt a private key with a passphrase and write it to `path`.
pub fn persist_private_key(
    sk: &SecretKey,
    path: &Path,
    passphrase: &str,
) -> Result<(), RSError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut salt)
        .and_then(|_| getrandom::getrandom(&mut nonce))
        .map_err(|e| RSError::InternalError(format!("RNG failure: {}", e)))?;

    let key = derive_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), sk.to_bytes().as_slice())
        .map_err(|_| RSError::InternalError("key encryption failed".to_string()))?;

    let file = EncryptedKeyFile {
        kdf: "argon2id".to_string(),
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    };
    let bytes = serde_json::to_vec_pretty(&file)?;
    write_secure(path, &bytes)?;
    log::debug!("persisted encrypted private key to {}", path.display());
    Ok(())
}

/// Load and decrypt a private key.
///
/// Fails with [`RSError::KeyNotFound`] if `path` does not exist and
/// [`RSError::DecryptionError`] if the passphrase is wrong or the file has
/// been tampered with.
pub fn load_private_key(path: &Path, passphrase: &str) -> Result<SecretKey, RSError> {
    if !path.exists() {
        return Err(RSError::KeyNotFound(path.display().to_string()));
    }
    let bytes = fs::read(path)?;
    let file: EncryptedKeyFile =
        serde_json::from_slice(&bytes).map_err(|_| RSError::DecryptionError)?;

    let salt = hex::decode(&file.salt).map_err(|_| RSError::DecryptionError)?;
    let nonce = hex::decode(&file.nonce).map_err(|_| RSError::DecryptionError)?;
    let ciphertext = hex::decode(&file.ciphertext).map_err(|_| RSError::DecryptionError)?;
    if nonce.len() != NONCE_LEN {
        return Err(RSError::DecryptionError);
    }

    let key = derive_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| RSError::DecryptionError)?;

    SecretKey::from_bytes(&plaintext)
}

/// Load a private key, resolving the passphrase through a credential provider.
pub fn load_private_key_with(
    provider: &dyn CredentialProvider,
    key_name: &str,
    path: &Path,
) -> Result<SecretKey, RSError> {
    let passphrase = provider.passphrase(key_name)?;
    load_private_key(path, &passphrase)
}

/// Write a public key to `path` as hex.
pub fn persist_public_key(pk: &PublicKey, path: &Path) -> Result<(), RSError> {
    fs::write(path, pk.to_hex())?;
    Ok(())
}

/// Load a public key written by [`persist_public_key`].
pub fn load_public_key(path: &Path) -> Result<PublicKey, RSError> {
    if !path.exists() {
        return Err(RSError::KeyNotFound(path.display().to_string()));
    }
    let encoded = fs::read_to_string(path)?;
    PublicKey::from_hex(encoded.trim())
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], RSError> {
    let mut key = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| RSError::InternalError(format!("KDF failure: {}", e)))?;
    Ok(key)
}

/// Create the file with mode 0600 before any data is written, so the key is
/// never briefly world-readable.
#[cfg(unix)]
fn write_secure(path: &Path, data: &[u8]) -> Result<(), RSError> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(SECURE_FILE_MODE)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn write_secure(path: &Path, data: &[u8]) -> Result<(), RSError> {
    log::warn!(
        "Writing key file '{}' without restrictive permissions: not supported on this platform",
        path.display()
    );
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}
