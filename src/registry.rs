//! Role registry
//!
//! The in-memory tree of roles: the four top-level roles plus any delegated
//! sub-roles. Roles are addressed through an explicit name-keyed map, looked
//! up with [`RSError::RoleNotFound`] on misses. All mutation happens through
//! registry operations so a role is never in a partially-updated state.

use crate::error::RSError;
use crate::keys::{KeyId, PublicKey, SecretKey};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

/// The four top-level role names.
pub const ROOT: &str = "root";
pub const TARGETS: &str = "targets";
pub const SNAPSHOT: &str = "snapshot";
pub const TIMESTAMP: &str = "timestamp";

/// Default lifetimes for freshly created top-level roles.
const ROOT_LIFETIME_DAYS: i64 = 365;
const TARGETS_LIFETIME_DAYS: i64 = 90;
const SNAPSHOT_LIFETIME_DAYS: i64 = 7;
const TIMESTAMP_LIFETIME_DAYS: i64 = 1;

/// A named trust unit: threshold, verification keys, loaded signing keys,
/// current version and expiration.
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub threshold: u32,
    verification_keys: BTreeMap<KeyId, PublicKey>,
    signing_keys: BTreeMap<KeyId, SecretKey>,
    /// Version of the last written metadata; 0 until first written.
    pub version: u64,
    pub expires: DateTime<Utc>,
}

impl Role {
    pub(crate) fn new(name: &str, expires: DateTime<Utc>) -> Self {
        Role {
            name: name.to_string(),
            threshold: 1,
            verification_keys: BTreeMap::new(),
            signing_keys: BTreeMap::new(),
            version: 0,
            expires,
        }
    }

    /// The trusted verification keys, keyed by keyid.
    pub fn verification_keys(&self) -> &BTreeMap<KeyId, PublicKey> {
        &self.verification_keys
    }

    /// The signing keys currently loaded, keyed by keyid.
    pub fn signing_keys(&self) -> &BTreeMap<KeyId, SecretKey> {
        &self.signing_keys
    }

    /// Sorted keyids of the verification keys.
    pub fn keyids(&self) -> Vec<KeyId> {
        self.verification_keys.keys().cloned().collect()
    }
}

/// Name-keyed mapping from role name to [`Role`].
#[derive(Debug, Clone)]
pub struct RoleRegistry {
    roles: BTreeMap<String, Role>,
    strict: bool,
}

impl RoleRegistry {
    /// Create a registry seeded with the four top-level roles at their
    /// default lifetimes.
    pub fn new() -> Self {
        let now = Utc::now();
        let mut roles = BTreeMap::new();
        for (name, days) in [
            (ROOT, ROOT_LIFETIME_DAYS),
            (TARGETS, TARGETS_LIFETIME_DAYS),
            (SNAPSHOT, SNAPSHOT_LIFETIME_DAYS),
            (TIMESTAMP, TIMESTAMP_LIFETIME_DAYS),
        ] {
            roles.insert(name.to_string(), Role::new(name, now + Duration::days(days)));
        }
        RoleRegistry {
            roles,
            strict: true,
        }
    }

    /// In strict mode (the default), loading a signing key whose keyid has no
    /// matching verification key on the role is rejected.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Look up a role by name.
    pub fn get_role(&self, name: &str) -> Result<&Role, RSError> {
        self.roles
            .get(name)
            .ok_or_else(|| RSError::RoleNotFound(name.to_string()))
    }

    pub(crate) fn get_role_mut(&mut self, name: &str) -> Result<&mut Role, RSError> {
        self.roles
            .get_mut(name)
            .ok_or_else(|| RSError::RoleNotFound(name.to_string()))
    }

    /// Whether a role with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    /// All role names, sorted.
    pub fn role_names(&self) -> Vec<String> {
        self.roles.keys().cloned().collect()
    }

    pub(crate) fn insert_role(&mut self, role: Role) -> Result<(), RSError> {
        if self.roles.contains_key(&role.name) {
            return Err(RSError::DuplicateRole(role.name));
        }
        self.roles.insert(role.name.clone(), role);
        Ok(())
    }

    /// Set a role's signature threshold.
    pub fn set_threshold(&mut self, role: &str, threshold: u32) -> Result<(), RSError> {
        if threshold < 1 {
            return Err(RSError::InvalidThreshold(threshold));
        }
        self.get_role_mut(role)?.threshold = threshold;
        Ok(())
    }

    /// Set a role's expiration.
    pub fn set_expiration(&mut self, role: &str, expires: DateTime<Utc>) -> Result<(), RSError> {
        self.get_role_mut(role)?.expires = expires;
        Ok(())
    }

    /// Add a verification key to a role. Idempotent by keyid: adding a key
    /// the role already trusts is a no-op.
    pub fn add_verification_key(&mut self, role: &str, key: PublicKey) -> Result<(), RSError> {
        let role = self.get_role_mut(role)?;
        role.verification_keys.entry(key.key_id()).or_insert(key);
        Ok(())
    }

    /// Load a signing key onto a role for later signing. Re-loading a key the
    /// role already holds replaces it.
    pub fn load_signing_key(&mut self, role: &str, key: SecretKey) -> Result<(), RSError> {
        let strict = self.strict;
        let role = self.get_role_mut(role)?;
        let keyid = key.key_id();
        if strict && !role.verification_keys.contains_key(&keyid) {
            return Err(RSError::KeyMismatch {
                role: role.name.clone(),
                keyid,
            });
        }
        role.signing_keys.insert(keyid, key);
        Ok(())
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
