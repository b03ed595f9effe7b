pub use crate::error::*;

use ct_codecs::{Encoder, Hex};
use std::fmt;

/// A stable identifier for a public key: the lowercase hex SHA-256 digest of
/// the raw public key bytes. Two keys with the same keyid are the same key.
pub type KeyId = String;

/// A public verification key.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PublicKey {
    pub pk: ed25519_compact::PublicKey,
}

impl PublicKey {
    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RSError> {
        Ok(Self {
            pk: ed25519_compact::PublicKey::from_slice(bytes)?,
        })
    }

    /// Parse a hex-encoded public key, as it appears in metadata documents.
    pub fn from_hex(encoded: &str) -> Result<Self, RSError> {
        let bytes = hex::decode(encoded).map_err(|_| RSError::UnsupportedKeyType)?;
        Self::from_bytes(&bytes)
    }

    /// Return the public key as raw bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.pk.as_ref().to_vec()
    }

    /// Hex-encode the public key for inclusion in metadata documents.
    pub fn to_hex(&self) -> String {
        hex::encode(self.pk.as_ref())
    }

    /// Compute the content-derived key identifier for this public key.
    pub fn key_id(&self) -> KeyId {
        hex::encode(hmac_sha256::Hash::hash(self.pk.as_ref()))
    }

    /// Verify a signature over `message`. Malformed signatures verify as false.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match ed25519_compact::Signature::from_slice(signature) {
            Ok(sig) => self.pk.verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PublicKey {{ [{}] - keyid: [{}] }}",
            Hex::encode_to_string(self.pk.as_ref()).unwrap(),
            self.key_id()
        )
    }
}

/// A secret signing key.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct SecretKey {
    pub sk: ed25519_compact::SecretKey,
}

impl SecretKey {
    /// Create a secret key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RSError> {
        Ok(Self {
            sk: ed25519_compact::SecretKey::from_slice(bytes)?,
        })
    }

    /// Return the secret key as raw bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.sk.as_ref().to_vec()
    }

    /// Return the public half of this key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            pk: self.sk.public_key(),
        }
    }

    /// The keyid of the public half.
    pub fn key_id(&self) -> KeyId {
        self.public_key().key_id()
    }

    /// Sign a message, returning the raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.sk.sign(message, None).as_ref().to_vec()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey {{ keyid: [{}] }}", self.key_id())
    }
}

/// A key pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyPair {
    /// The public key.
    pub pk: PublicKey,
    /// The secret key.
    pub sk: SecretKey,
}

impl KeyPair {
    /// Generate a new Ed25519 key pair.
    pub fn generate() -> Self {
        let kp = ed25519_compact::KeyPair::from_seed(ed25519_compact::Seed::generate());
        KeyPair {
            pk: PublicKey { pk: kp.pk },
            sk: SecretKey { sk: kp.sk },
        }
    }
}
