//! Producer-side trust metadata for secure package distribution.
//!
//! This crate builds and signs the versioned metadata set that a package
//! repository publishes to delegate trust: which keys act for which roles,
//! which delegated sub-roles sign for which path subsets, and how large
//! target populations are sharded across hashed-bin delegations. It enforces
//! the invariants that keep the trust chain sound: signature thresholds,
//! strictly monotonic versioning, expiration, delegation scoping, and exact
//! partitioning of hashed bins.
//!
//! Configuration is pure in-memory mutation of an explicit [`Repository`]
//! value; persistence happens in a single [`Repository::write`] call that
//! validates the whole batch first, then renames each document into place
//! atomically with snapshot and timestamp last. The client-side update
//! workflow that consumes this metadata is out of scope.

#![forbid(unsafe_code)]

mod error;

/// Key material: Ed25519 wrappers and content-derived key identifiers.
pub mod keys;

/// Encrypted key persistence and credential resolution.
pub mod keystore;

/// Signed bodies, envelopes and target file descriptions.
pub mod metadata;

/// The name-keyed role registry.
pub mod registry;

/// Scoped delegations and hashed-bin partitioning.
pub mod delegation;

/// Canonicalization, signing and threshold verification.
pub mod signer;

/// The repository aggregate and its atomic write pipeline.
pub mod repository;

pub use error::*;
pub use keys::{KeyId, KeyPair, PublicKey, SecretKey};
pub use metadata::{Metadata, RoleBody, Signature, TargetFile};
pub use registry::{Role, RoleRegistry, ROOT, SNAPSHOT, TARGETS, TIMESTAMP};
pub use delegation::RoleScope;
pub use repository::{Repository, RepositoryStatus, WriteState};
