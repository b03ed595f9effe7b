//! Signed metadata documents
//!
//! Every persisted document is an envelope `{"signed": <body>,
//! "signatures": [{"keyid", "sig"}]}` around a role-specific body. Bodies
//! keep all maps in `BTreeMap`s so serialization is deterministic, which the
//! canonical form used for signing depends on.

use crate::delegation::RoleScope;
use crate::error::RSError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Hash algorithm recorded for target files and metadata digests.
pub const HASH_ALGORITHM: &str = "sha256";

/// SHA-256 digest as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(hmac_sha256::Hash::hash(data))
}

/// A signature over the canonical form of a signed body, keyed by the keyid
/// of the public key that verifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    /// Hex-encoded Ed25519 signature bytes.
    pub sig: String,
}

/// The signed envelope persisted for each role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub signed: RoleBody,
    pub signatures: Vec<Signature>,
}

impl Metadata {
    /// Serialize to the on-disk JSON form.
    pub fn to_json(&self) -> Result<Vec<u8>, RSError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize from the on-disk JSON form.
    pub fn from_json(data: &[u8]) -> Result<Self, RSError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A role-specific signed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RoleBody {
    Root(RootBody),
    Targets(TargetsBody),
    Snapshot(SnapshotBody),
    Timestamp(TimestampBody),
}

impl RoleBody {
    /// The version recorded in the body.
    pub fn version(&self) -> u64 {
        match self {
            RoleBody::Root(b) => b.version,
            RoleBody::Targets(b) => b.version,
            RoleBody::Snapshot(b) => b.version,
            RoleBody::Timestamp(b) => b.version,
        }
    }

    /// The expiration recorded in the body.
    pub fn expires(&self) -> DateTime<Utc> {
        match self {
            RoleBody::Root(b) => b.expires,
            RoleBody::Targets(b) => b.expires,
            RoleBody::Snapshot(b) => b.expires,
            RoleBody::Timestamp(b) => b.expires,
        }
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        match self {
            RoleBody::Root(b) => b.version = version,
            RoleBody::Targets(b) => b.version = version,
            RoleBody::Snapshot(b) => b.version = version,
            RoleBody::Timestamp(b) => b.version = version,
        }
    }
}

/// A public key as recorded in root metadata and delegation key tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub keytype: String,
    /// Hex-encoded public key material.
    pub public: String,
}

/// Key IDs and threshold for one role, as recorded in root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

/// The root body: which keys are authorized for which top-level roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootBody {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub keys: BTreeMap<String, KeyInfo>,
    pub roles: BTreeMap<String, RoleKeys>,
}

/// Length and hashes of a target file, keyed by its repository path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMeta {
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
}

/// A target file: immutable once hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFile {
    /// Repository-relative path, forward slashes.
    pub path: String,
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
}

impl TargetFile {
    /// Describe in-memory content.
    pub fn from_bytes(path: &str, content: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert(HASH_ALGORITHM.to_string(), sha256_hex(content));
        TargetFile {
            path: path.to_string(),
            length: content.len() as u64,
            hashes,
        }
    }

    /// Hash a file on disk, recording it under the given repository path.
    pub fn from_path(path: &str, file: impl AsRef<Path>) -> Result<Self, RSError> {
        let mut fp = File::open(file)?;
        let mut hash = hmac_sha256::Hash::new();
        let mut buf = [0u8; 8 * 1024];
        let mut length = 0u64;
        loop {
            let n = fp.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hash.update(&buf[..n]);
            length += n as u64;
        }
        let mut hashes = BTreeMap::new();
        hashes.insert(HASH_ALGORITHM.to_string(), hex::encode(hash.finalize()));
        Ok(TargetFile {
            path: path.to_string(),
            length,
            hashes,
        })
    }

    /// The body entry for this target.
    pub fn meta(&self) -> TargetMeta {
        TargetMeta {
            length: self.length,
            hashes: self.hashes.clone(),
        }
    }
}

/// Keys and scoped roles delegated by a targets-type role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationInfo {
    pub keys: BTreeMap<String, KeyInfo>,
    pub roles: Vec<DelegatedRoleInfo>,
}

/// One delegated role entry in a targets body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatedRoleInfo {
    pub name: String,
    pub keyids: Vec<String>,
    pub threshold: u32,
    #[serde(flatten)]
    pub scope: RoleScope,
}

/// The targets body: target files plus any delegations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetsBody {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub targets: BTreeMap<String, TargetMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegations: Option<DelegationInfo>,
}

/// Version, length and hashes of one metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFileInfo {
    pub version: u64,
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
}

impl MetaFileInfo {
    /// Describe a just-serialized metadata document.
    pub fn describe(version: u64, document: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert(HASH_ALGORITHM.to_string(), sha256_hex(document));
        MetaFileInfo {
            version,
            length: document.len() as u64,
            hashes,
        }
    }
}

/// The snapshot body: pins every other role's current metadata file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBody {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFileInfo>,
}

/// The timestamp body: pins the current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampBody {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFileInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_expires() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2044, 10, 28, 12, 8, 0).unwrap()
    }

    #[test]
    fn test_target_file_from_bytes() {
        let t = TargetFile::from_bytes("packages/demo-1.0.tar.gz", b"payload");
        assert_eq!(t.length, 7);
        assert_eq!(t.hashes.len(), 1);
        assert_eq!(t.hashes[HASH_ALGORITHM], sha256_hex(b"payload"));
    }

    #[test]
    fn test_target_file_from_path() {
        let path = std::env::temp_dir().join("reposign_test_target.bin");
        std::fs::write(&path, b"on disk content").unwrap();

        let t = TargetFile::from_path("packages/a.bin", &path).unwrap();
        assert_eq!(t.length, 15);
        assert_eq!(t.hashes[HASH_ALGORITHM], sha256_hex(b"on disk content"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_role_body_type_tags() {
        let body = RoleBody::Timestamp(TimestampBody {
            version: 3,
            expires: test_expires(),
            meta: BTreeMap::new(),
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "timestamp");
        assert_eq!(json["version"], 3);

        let back: RoleBody = serde_json::from_value(json).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn test_targets_body_omits_empty_delegations() {
        let body = TargetsBody {
            version: 1,
            expires: test_expires(),
            targets: BTreeMap::new(),
            delegations: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("delegations").is_none());
    }

    #[test]
    fn test_delegated_role_scope_flattens() {
        let info = DelegatedRoleInfo {
            name: "bins-0".to_string(),
            keyids: vec!["aa".to_string()],
            threshold: 1,
            scope: RoleScope::HashPrefixes(vec!["0".to_string()]),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["path_hash_prefixes"][0], "0");
        assert!(json.get("paths").is_none());

        let info = DelegatedRoleInfo {
            name: "projects".to_string(),
            keyids: vec![],
            threshold: 1,
            scope: RoleScope::Paths(vec!["packages/*".to_string()]),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["paths"][0], "packages/*");
    }

    #[test]
    fn test_metadata_envelope_roundtrip() {
        let md = Metadata {
            signed: RoleBody::Snapshot(SnapshotBody {
                version: 2,
                expires: test_expires(),
                meta: BTreeMap::new(),
            }),
            signatures: vec![Signature {
                keyid: "ab".to_string(),
                sig: "cd".to_string(),
            }],
        };
        let json = md.to_json().unwrap();
        let back = Metadata::from_json(&json).unwrap();
        assert_eq!(back, md);
    }

    #[test]
    fn test_meta_file_info_describe() {
        let doc = b"serialized metadata";
        let info = MetaFileInfo::describe(4, doc);
        assert_eq!(info.version, 4);
        assert_eq!(info.length, doc.len() as u64);
        assert_eq!(info.hashes[HASH_ALGORITHM], sha256_hex(doc));
    }
}
