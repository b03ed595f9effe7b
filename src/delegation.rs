//! Delegation engine
//!
//! Creates scoped delegated roles and hashed-bin delegation sets. A
//! delegation grants a named child role signing authority over a subset of
//! the parent's target namespace, expressed either as path patterns or as a
//! contiguous range of hash prefixes. Hashed bins shard a large target
//! population across disjoint key groups: the hash space is split into
//! `num_bins` equal ranges and every target lands in exactly one bin by the
//! leading hex digits of the SHA-256 of its path.

use crate::error::RSError;
use crate::keys::PublicKey;
use crate::metadata::{sha256_hex, TargetFile};
use crate::registry::{Role, TARGETS};
use crate::repository::Repository;
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// The subset of the target namespace a delegated role is trusted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleScope {
    /// Shell-style path patterns; a pattern ending in `/` matches every path
    /// below that directory.
    #[serde(rename = "paths")]
    Paths(Vec<String>),
    /// Hex prefixes of SHA-256(path); used by hashed-bin delegations.
    #[serde(rename = "path_hash_prefixes")]
    HashPrefixes(Vec<String>),
}

impl RoleScope {
    pub fn is_empty(&self) -> bool {
        match self {
            RoleScope::Paths(patterns) => patterns.is_empty(),
            RoleScope::HashPrefixes(prefixes) => prefixes.is_empty(),
        }
    }

    /// Whether a target path falls inside this scope.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            RoleScope::Paths(patterns) => patterns.iter().any(|p| pattern_matches(p, path)),
            RoleScope::HashPrefixes(prefixes) => {
                let digest = sha256_hex(path.as_bytes());
                prefixes.iter().any(|p| digest.starts_with(p.as_str()))
            }
        }
    }
}

/// A delegation record: which parent granted which scope to which child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    pub parent: String,
    pub child: String,
    pub scope: RoleScope,
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(dir) = pattern.strip_suffix('/') {
        if path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/')) {
            return true;
        }
        return path.starts_with(pattern);
    }
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(_) => false,
    }
}

/// Whether `child` (a pattern) is covered by at least one parent pattern, so
/// a child delegation never widens its parent's scope.
fn pattern_covered(child: &str, parents: &[String]) -> bool {
    parents.iter().any(|parent| {
        if pattern_matches(parent, child) {
            return true;
        }
        if let Some(stem) = parent.strip_suffix('*') {
            return child.starts_with(stem);
        }
        parent.strip_suffix('/').is_some_and(|dir| {
            child
                .strip_prefix(dir)
                .is_some_and(|rest| rest.starts_with('/'))
        })
    })
}

/// Layout of a hashed-bin partition: every bin spans `prefixes_per_bin`
/// consecutive hex prefixes of length `prefix_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BinLayout {
    pub num_bins: u32,
    pub prefix_len: usize,
    pub prefixes_per_bin: u64,
}

pub(crate) fn bin_layout(num_bins: u32) -> Result<BinLayout, RSError> {
    if num_bins == 0 || !num_bins.is_power_of_two() || num_bins > 65536 {
        return Err(RSError::InvalidBinCount(num_bins));
    }
    let mut prefix_len = 1;
    while 16u64.pow(prefix_len as u32) < num_bins as u64 {
        prefix_len += 1;
    }
    let total = 16u64.pow(prefix_len as u32);
    Ok(BinLayout {
        num_bins,
        prefix_len,
        prefixes_per_bin: total / num_bins as u64,
    })
}

impl BinLayout {
    /// The range identifier naming bin `index`, e.g. `"00-07"`, or a single
    /// prefix when the bin spans exactly one.
    pub fn bin_name(&self, index: u32) -> String {
        let first = index as u64 * self.prefixes_per_bin;
        let last = first + self.prefixes_per_bin - 1;
        if self.prefixes_per_bin == 1 {
            format!("{:0width$x}", first, width = self.prefix_len)
        } else {
            format!(
                "{:0width$x}-{:0width$x}",
                first,
                last,
                width = self.prefix_len
            )
        }
    }

    /// The hex prefixes spanned by bin `index`.
    pub fn bin_prefixes(&self, index: u32) -> Vec<String> {
        let first = index as u64 * self.prefixes_per_bin;
        (first..first + self.prefixes_per_bin)
            .map(|p| format!("{:0width$x}", p, width = self.prefix_len))
            .collect()
    }

    /// The bin a target path falls into.
    pub fn bin_index(&self, path: &str) -> u32 {
        let digest = sha256_hex(path.as_bytes());
        let prefix = u64::from_str_radix(&digest[..self.prefix_len], 16)
            .expect("hex digest prefix is valid hex");
        (prefix / self.prefixes_per_bin) as u32
    }
}

/// Check that a set of hash-prefix scopes partitions the full hash space:
/// equal-length prefixes, no gaps, no overlaps.
pub(crate) fn validate_partition(parent: &str, scopes: &[&RoleScope]) -> Result<(), RSError> {
    let mut prefixes = BTreeSet::new();
    let mut prefix_len = None;
    for scope in scopes {
        let RoleScope::HashPrefixes(list) = scope else {
            return Err(RSError::IncompletePartition(parent.to_string()));
        };
        for prefix in list {
            match prefix_len {
                None => prefix_len = Some(prefix.len()),
                Some(len) if len != prefix.len() => {
                    return Err(RSError::IncompletePartition(parent.to_string()))
                }
                _ => {}
            }
            if !prefixes.insert(prefix.clone()) {
                // overlap
                return Err(RSError::IncompletePartition(parent.to_string()));
            }
        }
    }
    let Some(len) = prefix_len else {
        return Err(RSError::IncompletePartition(parent.to_string()));
    };
    if len == 0 || len > 4 || prefixes.len() as u64 != 16u64.pow(len as u32) {
        return Err(RSError::IncompletePartition(parent.to_string()));
    }
    Ok(())
}

impl Repository {
    /// Delegate a path-scoped child role from `parent`.
    ///
    /// The parent must be `targets` or an existing delegated role; a child of
    /// a path-scoped parent must stay inside the parent's scope.
    pub fn delegate(
        &mut self,
        parent: &str,
        name: &str,
        verification_keys: &[PublicKey],
        threshold: u32,
        path_patterns: &[String],
    ) -> Result<&Role, RSError> {
        if threshold < 1 {
            return Err(RSError::InvalidThreshold(threshold));
        }
        if path_patterns.is_empty() {
            return Err(RSError::EmptyDelegationScope(name.to_string()));
        }
        for pattern in path_patterns {
            if !pattern.ends_with('/') {
                Glob::new(pattern).map_err(|e| {
                    RSError::InternalError(format!("invalid path pattern '{}': {}", pattern, e))
                })?;
            }
        }
        self.check_delegation_parent(parent)?;
        if self.registry().contains(name) {
            return Err(RSError::DuplicateRole(name.to_string()));
        }

        // A child of a path-scoped parent must not widen the parent's scope.
        if let Some(delegation) = self.delegation_for(parent) {
            match &delegation.scope {
                RoleScope::Paths(parent_patterns) => {
                    for pattern in path_patterns {
                        if !pattern_covered(pattern, parent_patterns) {
                            return Err(RSError::ScopeViolation {
                                role: parent.to_string(),
                                path: pattern.clone(),
                            });
                        }
                    }
                }
                // Path delegations below a hashed bin cannot be expressed as
                // a subset of a hash range.
                RoleScope::HashPrefixes(_) => {
                    return Err(RSError::InvalidParentRole(parent.to_string()))
                }
            }
        }

        let scope = RoleScope::Paths(path_patterns.to_vec());
        self.insert_delegated_role(parent, name, verification_keys, threshold, scope)?;
        log::debug!("delegated '{}' from '{}'", name, parent);
        self.registry().get_role(name)
    }

    /// Create a hashed-bin delegation set under `parent`.
    ///
    /// `num_bins` must be a power of two. The bins partition the full hash
    /// space into equal contiguous ranges; every target in `target_population`
    /// is assigned to exactly one bin. An empty population still creates all
    /// bins, so they can be populated later without renegotiating boundaries.
    /// Returns the created role names in bin order.
    pub fn delegate_hashed_bins(
        &mut self,
        parent: &str,
        target_population: &[TargetFile],
        verification_keys: &[PublicKey],
        threshold: u32,
        num_bins: u32,
    ) -> Result<Vec<String>, RSError> {
        if threshold < 1 {
            return Err(RSError::InvalidThreshold(threshold));
        }
        let layout = bin_layout(num_bins)?;
        self.check_delegation_parent(parent)?;

        let names: Vec<String> = (0..num_bins).map(|i| layout.bin_name(i)).collect();
        for name in &names {
            if self.registry().contains(name) {
                return Err(RSError::DuplicateRole(name.clone()));
            }
        }

        for (index, name) in names.iter().enumerate() {
            let scope = RoleScope::HashPrefixes(layout.bin_prefixes(index as u32));
            self.insert_delegated_role(parent, name, verification_keys, threshold, scope)?;
        }

        for target in target_population {
            let bin = layout.bin_index(&target.path);
            self.assign_target(&names[bin as usize], target.clone());
        }
        log::info!(
            "delegated {} hashed bins from '{}' covering {} targets",
            num_bins,
            parent,
            target_population.len()
        );
        Ok(names)
    }

    /// Assign a target file to the role that signs for it. The path must be
    /// inside the role's scope.
    pub fn add_target(&mut self, role: &str, target: TargetFile) -> Result<(), RSError> {
        self.check_delegation_parent(role)?;
        if let Some(delegation) = self.delegation_for(role) {
            if !delegation.scope.matches(&target.path) {
                return Err(RSError::ScopeViolation {
                    role: role.to_string(),
                    path: target.path,
                });
            }
        }
        self.assign_target(role, target);
        Ok(())
    }

    /// Hash every regular file below `dir` (recursively, in sorted order) and
    /// assign it to `role` under its path relative to `dir`. Returns the
    /// number of targets added.
    pub fn add_targets_from_dir(&mut self, role: &str, dir: &Path) -> Result<usize, RSError> {
        let mut files = Vec::new();
        collect_files(dir, &mut files)?;
        files.sort();
        let mut added = 0;
        for file in files {
            let rel = file
                .strip_prefix(dir)
                .map_err(|e| RSError::InternalError(e.to_string()))?;
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            self.add_target(role, TargetFile::from_path(&name, &file)?)?;
            added += 1;
        }
        Ok(added)
    }

    fn check_delegation_parent(&self, parent: &str) -> Result<(), RSError> {
        self.registry().get_role(parent)?;
        if parent != TARGETS && self.delegation_for(parent).is_none() {
            return Err(RSError::InvalidParentRole(parent.to_string()));
        }
        Ok(())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<(), RSError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_layout_requires_power_of_two() {
        for bad in [0u32, 3, 12, 100, 65537] {
            let result = bin_layout(bad);
            assert!(
                matches!(result.unwrap_err(), RSError::InvalidBinCount(n) if n == bad),
                "expected InvalidBinCount for {}",
                bad
            );
        }
        for good in [1u32, 2, 16, 32, 256, 65536] {
            assert!(bin_layout(good).is_ok());
        }
    }

    #[test]
    fn test_bin_layout_sixteen() {
        let layout = bin_layout(16).unwrap();
        assert_eq!(layout.prefix_len, 1);
        assert_eq!(layout.prefixes_per_bin, 1);
        assert_eq!(layout.bin_name(0), "0");
        assert_eq!(layout.bin_name(15), "f");
        assert_eq!(layout.bin_prefixes(10), vec!["a"]);
    }

    #[test]
    fn test_bin_layout_two() {
        let layout = bin_layout(2).unwrap();
        assert_eq!(layout.prefix_len, 1);
        assert_eq!(layout.prefixes_per_bin, 8);
        assert_eq!(layout.bin_name(0), "0-7");
        assert_eq!(layout.bin_name(1), "8-f");
    }

    #[test]
    fn test_bin_layout_thirty_two() {
        let layout = bin_layout(32).unwrap();
        assert_eq!(layout.prefix_len, 2);
        assert_eq!(layout.prefixes_per_bin, 8);
        assert_eq!(layout.bin_name(0), "00-07");
        assert_eq!(layout.bin_name(31), "f8-ff");
    }

    #[test]
    fn test_bin_index_matches_prefixes() {
        let layout = bin_layout(16).unwrap();
        for path in ["a", "packages/x.tar.gz", "some/deep/path.bin"] {
            let index = layout.bin_index(path);
            let prefixes = layout.bin_prefixes(index);
            let digest = sha256_hex(path.as_bytes());
            assert!(prefixes.iter().any(|p| digest.starts_with(p.as_str())));
        }
    }

    #[test]
    fn test_bins_partition_whole_space() {
        for num_bins in [1u32, 2, 4, 16, 64] {
            let layout = bin_layout(num_bins).unwrap();
            let scopes: Vec<RoleScope> = (0..num_bins)
                .map(|i| RoleScope::HashPrefixes(layout.bin_prefixes(i)))
                .collect();
            let refs: Vec<&RoleScope> = scopes.iter().collect();
            validate_partition("targets", &refs).unwrap();
        }
    }

    #[test]
    fn test_validate_partition_detects_gap() {
        let layout = bin_layout(16).unwrap();
        let scopes: Vec<RoleScope> = (0..15) // one bin missing
            .map(|i| RoleScope::HashPrefixes(layout.bin_prefixes(i)))
            .collect();
        let refs: Vec<&RoleScope> = scopes.iter().collect();
        let result = validate_partition("targets", &refs);
        assert!(matches!(
            result.unwrap_err(),
            RSError::IncompletePartition(_)
        ));
    }

    #[test]
    fn test_validate_partition_detects_overlap() {
        let layout = bin_layout(16).unwrap();
        let mut scopes: Vec<RoleScope> = (0..16)
            .map(|i| RoleScope::HashPrefixes(layout.bin_prefixes(i)))
            .collect();
        scopes[1] = RoleScope::HashPrefixes(vec!["0".to_string()]); // duplicates bin 0
        let refs: Vec<&RoleScope> = scopes.iter().collect();
        let result = validate_partition("targets", &refs);
        assert!(matches!(
            result.unwrap_err(),
            RSError::IncompletePartition(_)
        ));
    }

    #[test]
    fn test_scope_matches_paths() {
        let scope = RoleScope::Paths(vec!["packages/*.tar.gz".to_string()]);
        assert!(scope.matches("packages/demo-1.0.tar.gz"));
        assert!(!scope.matches("packages/demo-1.0.zip"));
        assert!(!scope.matches("other/demo-1.0.tar.gz"));
    }

    #[test]
    fn test_scope_matches_directory_prefix() {
        let scope = RoleScope::Paths(vec!["packages/".to_string()]);
        assert!(scope.matches("packages/demo.tar.gz"));
        assert!(scope.matches("packages/nested/demo.tar.gz"));
        assert!(!scope.matches("packagesx/demo.tar.gz"));
    }

    #[test]
    fn test_scope_matches_hash_prefixes() {
        let digest = sha256_hex(b"packages/a.bin");
        let scope = RoleScope::HashPrefixes(vec![digest[..1].to_string()]);
        assert!(scope.matches("packages/a.bin"));

        let other = format!("{:x}", (u32::from_str_radix(&digest[..1], 16).unwrap() + 1) % 16);
        let scope = RoleScope::HashPrefixes(vec![other]);
        assert!(!scope.matches("packages/a.bin"));
    }

    #[test]
    fn test_pattern_covered() {
        let parents = vec!["packages/".to_string()];
        assert!(pattern_covered("packages/py/*.whl", &parents));
        assert!(!pattern_covered("other/*.whl", &parents));

        let parents = vec!["packages/*".to_string()];
        assert!(pattern_covered("packages/demo.tar.gz", &parents));
        assert!(pattern_covered("packages/py/*.whl", &parents));
    }
}
