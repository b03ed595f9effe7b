//! Repository orchestration
//!
//! A [`Repository`] is an explicit value holding the role registry, the
//! delegation tree, per-role target assignments and the index of currently
//! emitted metadata documents. Configuration is pure in-memory mutation; all
//! disk effect happens in one place, [`Repository::write`], which builds the
//! whole metadata batch in dependency order (targets → snapshot → timestamp),
//! validates it with zero disk effect, then persists each changed document
//! atomically. A role's version is bumped by exactly 1 when and only when its
//! signed body changed.

mod storage;

use crate::delegation::{validate_partition, Delegation, RoleScope};
use crate::error::RSError;
use crate::metadata::{
    DelegatedRoleInfo, DelegationInfo, KeyInfo, MetaFileInfo, Metadata, RoleBody, RoleKeys,
    RootBody, SnapshotBody, TargetFile, TargetsBody, TimestampBody,
};
use crate::registry::{Role, RoleRegistry, ROOT, SNAPSHOT, TARGETS, TIMESTAMP};
use crate::signer;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Key type recorded in metadata key tables.
const KEYTYPE: &str = "ed25519";

/// Default lifetime for freshly delegated roles.
const DELEGATED_LIFETIME_DAYS: i64 = 90;

/// Write lifecycle of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// No write has completed yet.
    Unwritten,
    /// A write is validating the pending batch; no disk effect.
    Validating,
    /// A write is persisting the batch.
    Writing,
    /// The last write completed; on-disk metadata matches the emitted index.
    Written,
}

/// A snapshot of the repository's write state and pending changes.
#[derive(Debug, Clone)]
pub struct RepositoryStatus {
    pub state: WriteState,
    /// Roles whose signed body differs from the last written document.
    /// Snapshot and timestamp follow these automatically.
    pub dirty_roles: Vec<String>,
}

/// A metadata document as last persisted.
#[derive(Debug, Clone)]
struct EmittedDoc {
    body_canonical: Vec<u8>,
    document: Vec<u8>,
    version: u64,
}

/// A changed document staged for this write.
struct Candidate {
    name: String,
    metadata: Metadata,
    document: Vec<u8>,
    body_canonical: Vec<u8>,
    version: u64,
}

/// The repository aggregate: roles, delegations, targets and emitted
/// metadata, bound to one metadata directory.
#[derive(Debug)]
pub struct Repository {
    registry: RoleRegistry,
    /// Delegation records, keyed by child role name.
    delegations: BTreeMap<String, Delegation>,
    /// Target files, keyed by owning role then repository path.
    assignments: BTreeMap<String, BTreeMap<String, TargetFile>>,
    emitted: BTreeMap<String, EmittedDoc>,
    metadata_dir: PathBuf,
    state: WriteState,
}

impl Repository {
    /// Create a repository rooted at `metadata_dir`, creating the directory
    /// if needed.
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Result<Self, RSError> {
        let metadata_dir = metadata_dir.into();
        std::fs::create_dir_all(&metadata_dir)?;
        Ok(Repository {
            registry: RoleRegistry::new(),
            delegations: BTreeMap::new(),
            assignments: BTreeMap::new(),
            emitted: BTreeMap::new(),
            metadata_dir,
            state: WriteState::Unwritten,
        })
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RoleRegistry {
        &mut self.registry
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    /// The delegation record naming `role` as child, if it is delegated.
    pub fn delegation_for(&self, role: &str) -> Option<&Delegation> {
        self.delegations.get(role)
    }

    /// Current write state plus the roles with pending changes.
    pub fn status(&self) -> Result<RepositoryStatus, RSError> {
        let mut dirty_roles = Vec::new();
        let root_version = self.registry.get_role(ROOT)?.version;
        if self.is_dirty(ROOT, &RoleBody::Root(self.build_root_body(root_version)?))? {
            dirty_roles.push(ROOT.to_string());
        }
        for name in self.targets_type_roles() {
            let version = self.registry.get_role(&name)?.version;
            let body = RoleBody::Targets(self.build_targets_body(&name, version)?);
            if self.is_dirty(&name, &body)? {
                dirty_roles.push(name);
            }
        }
        Ok(RepositoryStatus {
            state: self.state,
            dirty_roles,
        })
    }

    /// Persist all pending metadata, blocking if another writer holds the
    /// repository lock.
    pub fn write(&mut self) -> Result<(), RSError> {
        let lock = storage::RepoLock::acquire(&self.metadata_dir)?;
        self.commit(lock)
    }

    /// Persist all pending metadata, failing fast with
    /// [`RSError::RepositoryLocked`] if another writer holds the lock.
    pub fn try_write(&mut self) -> Result<(), RSError> {
        let lock = storage::RepoLock::try_acquire(&self.metadata_dir)?;
        self.commit(lock)
    }

    fn commit(&mut self, _lock: storage::RepoLock) -> Result<(), RSError> {
        let prior = self.state;
        self.state = WriteState::Validating;
        match self.run_write() {
            Ok(()) => {
                self.state = WriteState::Written;
                Ok(())
            }
            Err(e) => {
                self.state = prior;
                Err(e)
            }
        }
    }

    fn run_write(&mut self) -> Result<(), RSError> {
        let now = Utc::now();

        // Hashed-bin sets must still partition the hash space.
        let mut bins_by_parent: BTreeMap<&str, Vec<&RoleScope>> = BTreeMap::new();
        for delegation in self.delegations.values() {
            if matches!(delegation.scope, RoleScope::HashPrefixes(_)) {
                bins_by_parent
                    .entry(delegation.parent.as_str())
                    .or_default()
                    .push(&delegation.scope);
            }
        }
        for (parent, scopes) in &bins_by_parent {
            validate_partition(parent, scopes)?;
        }

        // Stage every changed role: root first, then targets and delegations.
        let mut batch: Vec<Candidate> = Vec::new();
        let root_version = self.registry.get_role(ROOT)?.version;
        let root_body = RoleBody::Root(self.build_root_body(root_version)?);
        if let Some(candidate) = self.prepare_role(ROOT, root_body)? {
            batch.push(candidate);
        }
        for name in self.targets_type_roles() {
            let version = self.registry.get_role(&name)?.version;
            let body = RoleBody::Targets(self.build_targets_body(&name, version)?);
            if let Some(candidate) = self.prepare_role(&name, body)? {
                batch.push(candidate);
            }
        }

        // Dry validation pass: no disk has been touched yet.
        for candidate in &batch {
            self.validate_candidate(candidate, now)?;
        }

        // Snapshot pins every role file except timestamp.
        let mut meta = BTreeMap::new();
        let mut pinned = vec![ROOT.to_string()];
        pinned.extend(self.targets_type_roles());
        for name in pinned {
            let info = match batch.iter().find(|c| c.name == name) {
                Some(candidate) => MetaFileInfo::describe(candidate.version, &candidate.document),
                None => match self.emitted.get(&name) {
                    Some(prev) => MetaFileInfo::describe(prev.version, &prev.document),
                    None => {
                        return Err(RSError::InternalError(format!(
                            "role '{}' has no staged or emitted document",
                            name
                        )))
                    }
                },
            };
            meta.insert(format!("{}.json", name), info);
        }
        let snapshot_role = self.registry.get_role(SNAPSHOT)?;
        let body = RoleBody::Snapshot(SnapshotBody {
            version: snapshot_role.version,
            expires: snapshot_role.expires,
            meta,
        });
        let snapshot_candidate = self.prepare_role(SNAPSHOT, body)?;
        if let Some(candidate) = &snapshot_candidate {
            self.validate_candidate(candidate, now)?;
        }

        // Timestamp pins the snapshot.
        let snapshot_info = match &snapshot_candidate {
            Some(candidate) => MetaFileInfo::describe(candidate.version, &candidate.document),
            None => match self.emitted.get(SNAPSHOT) {
                Some(prev) => MetaFileInfo::describe(prev.version, &prev.document),
                None => {
                    return Err(RSError::InternalError(
                        "snapshot has no staged or emitted document".to_string(),
                    ))
                }
            },
        };
        let mut meta = BTreeMap::new();
        meta.insert("snapshot.json".to_string(), snapshot_info);
        let timestamp_role = self.registry.get_role(TIMESTAMP)?;
        let body = RoleBody::Timestamp(TimestampBody {
            version: timestamp_role.version,
            expires: timestamp_role.expires,
            meta,
        });
        let timestamp_candidate = self.prepare_role(TIMESTAMP, body)?;
        if let Some(candidate) = &timestamp_candidate {
            self.validate_candidate(candidate, now)?;
        }

        batch.extend(snapshot_candidate);
        batch.extend(timestamp_candidate);
        if batch.is_empty() {
            log::debug!("no metadata changed; nothing to write");
            return Ok(());
        }

        // Persist in dependency order; snapshot and timestamp land last, so a
        // partial batch is never trusted by a consumer.
        self.state = WriteState::Writing;
        for candidate in &batch {
            let path = self.metadata_dir.join(format!("{}.json", candidate.name));
            storage::atomic_write(&path, &candidate.document)?;
        }

        // Commit versions and the emitted index only after every rename.
        let written = batch.len();
        for candidate in batch {
            self.registry.get_role_mut(&candidate.name)?.version = candidate.version;
            self.emitted.insert(
                candidate.name,
                EmittedDoc {
                    body_canonical: candidate.body_canonical,
                    document: candidate.document,
                    version: candidate.version,
                },
            );
        }
        log::info!(
            "wrote {} metadata documents to {}",
            written,
            self.metadata_dir.display()
        );
        Ok(())
    }

    /// Stage a role whose body (built at its current version) differs from
    /// the last emitted document: bump the version, re-canonicalize and sign.
    fn prepare_role(&self, name: &str, mut body: RoleBody) -> Result<Option<Candidate>, RSError> {
        let canonical = signer::canonical_bytes(&body)?;
        if let Some(prev) = self.emitted.get(name) {
            if prev.body_canonical == canonical {
                return Ok(None);
            }
        }
        let role = self.registry.get_role(name)?;
        let version = role.version + 1;
        body.set_version(version);
        let body_canonical = signer::canonical_bytes(&body)?;
        let metadata = signer::sign_body(role, &body, &[])?;
        let document = metadata.to_json()?;
        Ok(Some(Candidate {
            name: name.to_string(),
            metadata,
            document,
            body_canonical,
            version,
        }))
    }

    fn validate_candidate(&self, candidate: &Candidate, now: DateTime<Utc>) -> Result<(), RSError> {
        let role = self.registry.get_role(&candidate.name)?;
        let valid = signer::valid_signature_count(role, &candidate.metadata)?;
        if valid < role.threshold as usize {
            return Err(RSError::InsufficientSignatures {
                role: role.name.clone(),
                valid,
                threshold: role.threshold,
            });
        }
        let expires = candidate.metadata.signed.expires();
        if expires <= now {
            return Err(RSError::ExpiredMetadata {
                role: role.name.clone(),
                expires,
            });
        }
        Ok(())
    }

    fn is_dirty(&self, name: &str, body: &RoleBody) -> Result<bool, RSError> {
        let canonical = signer::canonical_bytes(body)?;
        Ok(match self.emitted.get(name) {
            Some(prev) => prev.body_canonical != canonical,
            None => true,
        })
    }

    /// The top-level targets role followed by every delegated role, sorted.
    fn targets_type_roles(&self) -> Vec<String> {
        let mut roles = vec![TARGETS.to_string()];
        roles.extend(self.delegations.keys().cloned());
        roles
    }

    fn children_of(&self, parent: &str) -> Vec<&Delegation> {
        self.delegations
            .values()
            .filter(|d| d.parent == parent)
            .collect()
    }

    fn build_root_body(&self, version: u64) -> Result<RootBody, RSError> {
        let root = self.registry.get_role(ROOT)?;
        let mut keys = BTreeMap::new();
        let mut roles = BTreeMap::new();
        for name in [ROOT, TARGETS, SNAPSHOT, TIMESTAMP] {
            let role = self.registry.get_role(name)?;
            for (keyid, pk) in role.verification_keys() {
                keys.insert(
                    keyid.clone(),
                    KeyInfo {
                        keytype: KEYTYPE.to_string(),
                        public: pk.to_hex(),
                    },
                );
            }
            roles.insert(
                name.to_string(),
                RoleKeys {
                    keyids: role.keyids(),
                    threshold: role.threshold,
                },
            );
        }
        Ok(RootBody {
            version,
            expires: root.expires,
            keys,
            roles,
        })
    }

    fn build_targets_body(&self, name: &str, version: u64) -> Result<TargetsBody, RSError> {
        let role = self.registry.get_role(name)?;
        let targets = self
            .assignments
            .get(name)
            .map(|targets| {
                targets
                    .iter()
                    .map(|(path, target)| (path.clone(), target.meta()))
                    .collect()
            })
            .unwrap_or_default();

        let children = self.children_of(name);
        let delegations = if children.is_empty() {
            None
        } else {
            let mut keys = BTreeMap::new();
            let mut roles = Vec::new();
            for delegation in children {
                let child = self.registry.get_role(&delegation.child)?;
                for (keyid, pk) in child.verification_keys() {
                    keys.insert(
                        keyid.clone(),
                        KeyInfo {
                            keytype: KEYTYPE.to_string(),
                            public: pk.to_hex(),
                        },
                    );
                }
                roles.push(DelegatedRoleInfo {
                    name: delegation.child.clone(),
                    keyids: child.keyids(),
                    threshold: child.threshold,
                    scope: delegation.scope.clone(),
                });
            }
            Some(DelegationInfo { keys, roles })
        };

        Ok(TargetsBody {
            version,
            expires: role.expires,
            targets,
            delegations,
        })
    }

    pub(crate) fn insert_delegated_role(
        &mut self,
        parent: &str,
        name: &str,
        verification_keys: &[crate::keys::PublicKey],
        threshold: u32,
        scope: RoleScope,
    ) -> Result<(), RSError> {
        if scope.is_empty() {
            return Err(RSError::EmptyDelegationScope(name.to_string()));
        }
        let mut role = Role::new(name, Utc::now() + Duration::days(DELEGATED_LIFETIME_DAYS));
        role.threshold = threshold;
        self.registry.insert_role(role)?;
        for key in verification_keys {
            self.registry.add_verification_key(name, key.clone())?;
        }
        self.delegations.insert(
            name.to_string(),
            Delegation {
                parent: parent.to_string(),
                child: name.to_string(),
                scope,
            },
        );
        Ok(())
    }

    pub(crate) fn assign_target(&mut self, role: &str, target: TargetFile) {
        self.assignments
            .entry(role.to_string())
            .or_default()
            .insert(target.path.clone(), target);
    }
}
