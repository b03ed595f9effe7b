//! Metadata signing and threshold verification
//!
//! Signed bodies are canonicalized to canonical JSON so the bytes being
//! signed are independent of field order and reproducible across processes.
//! Signatures are keyed by keyid: re-signing with the same key replaces its
//! signature, and verification counts each trusted keyid at most once.

use crate::error::RSError;
use crate::metadata::{Metadata, RoleBody, Signature};
use crate::registry::Role;
use olpc_cjson::CanonicalFormatter;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Canonical JSON serialization of a signed body; the input to every
/// signature and digest over metadata.
pub fn canonical_bytes<T: Serialize>(body: &T) -> Result<Vec<u8>, RSError> {
    let mut data = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
    body.serialize(&mut ser)?;
    Ok(data)
}

/// Sign `body` with every signing key loaded on `role`, merging with
/// `previous` signatures. Signatures are deduplicated by keyid: a key that
/// signs again replaces its old signature. The result is sorted by keyid.
pub fn sign_body(
    role: &Role,
    body: &RoleBody,
    previous: &[Signature],
) -> Result<Metadata, RSError> {
    let canonical = canonical_bytes(body)?;
    let mut by_keyid: BTreeMap<String, String> = previous
        .iter()
        .map(|s| (s.keyid.clone(), s.sig.clone()))
        .collect();
    for (keyid, sk) in role.signing_keys() {
        by_keyid.insert(keyid.clone(), hex::encode(sk.sign(&canonical)));
    }
    log::debug!(
        "signed '{}' with {} keys ({} signatures total)",
        role.name,
        role.signing_keys().len(),
        by_keyid.len()
    );
    Ok(Metadata {
        signed: body.clone(),
        signatures: by_keyid
            .into_iter()
            .map(|(keyid, sig)| Signature { keyid, sig })
            .collect(),
    })
}

/// Count distinct keyids whose signature is both trusted by `role` and
/// cryptographically valid over the canonical body. Unknown keyids, bad hex
/// and invalid signatures are ignored, not penalized.
pub fn valid_signature_count(role: &Role, metadata: &Metadata) -> Result<usize, RSError> {
    let canonical = canonical_bytes(&metadata.signed)?;
    let mut counted = BTreeSet::new();
    for signature in &metadata.signatures {
        if counted.contains(&signature.keyid) {
            continue;
        }
        let Some(pk) = role.verification_keys().get(&signature.keyid) else {
            continue;
        };
        let Ok(raw) = hex::decode(&signature.sig) else {
            continue;
        };
        if pk.verify(&canonical, &raw) {
            counted.insert(signature.keyid.clone());
        }
    }
    Ok(counted.len())
}

/// True iff the number of distinct valid signatures from `role`'s trusted
/// keyset meets the role's threshold.
pub fn verify_threshold(role: &Role, metadata: &Metadata) -> Result<bool, RSError> {
    Ok(valid_signature_count(role, metadata)? >= role.threshold as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use crate::metadata::TimestampBody;
    use crate::registry::{RoleRegistry, TARGETS};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn test_body() -> RoleBody {
        RoleBody::Timestamp(TimestampBody {
            version: 1,
            expires: Utc.with_ymd_and_hms(2044, 10, 28, 12, 8, 0).unwrap(),
            meta: BTreeMap::new(),
        })
    }

    fn role_with_keys(keypairs: &[&KeyPair], threshold: u32, load: usize) -> RoleRegistry {
        let mut registry = RoleRegistry::new();
        for kp in keypairs {
            registry.add_verification_key(TARGETS, kp.pk.clone()).unwrap();
        }
        for kp in keypairs.iter().take(load) {
            registry.load_signing_key(TARGETS, kp.sk.clone()).unwrap();
        }
        registry.set_threshold(TARGETS, threshold).unwrap();
        registry
    }

    #[test]
    fn test_canonical_bytes_idempotent() {
        let body = test_body();
        let first = canonical_bytes(&body).unwrap();
        let second = canonical_bytes(&body).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_canonical_bytes_order_independent() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
    }

    #[test]
    fn test_canonical_roundtrip_stable() {
        let body = test_body();
        let canonical = canonical_bytes(&body).unwrap();
        // Parse the canonical form back and re-canonicalize.
        let value: serde_json::Value = serde_json::from_slice(&canonical).unwrap();
        assert_eq!(canonical_bytes(&value).unwrap(), canonical);
    }

    #[test]
    fn test_sign_produces_valid_signatures() {
        let kp = KeyPair::generate();
        let registry = role_with_keys(&[&kp], 1, 1);
        let role = registry.get_role(TARGETS).unwrap();

        let metadata = sign_body(role, &test_body(), &[]).unwrap();
        assert_eq!(metadata.signatures.len(), 1);
        assert_eq!(metadata.signatures[0].keyid, kp.pk.key_id());
        assert!(verify_threshold(role, &metadata).unwrap());
    }

    #[test]
    fn test_resign_replaces_not_appends() {
        let kp = KeyPair::generate();
        let registry = role_with_keys(&[&kp], 1, 1);
        let role = registry.get_role(TARGETS).unwrap();

        let first = sign_body(role, &test_body(), &[]).unwrap();
        let second = sign_body(role, &test_body(), &first.signatures).unwrap();
        assert_eq!(second.signatures.len(), 1);
        assert_eq!(second.signatures, first.signatures);
    }

    #[test]
    fn test_sign_merges_previous_signatures() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        let body = test_body();

        let registry1 = role_with_keys(&[&kp1, &kp2], 2, 1);
        let partial = sign_body(registry1.get_role(TARGETS).unwrap(), &body, &[]).unwrap();
        assert_eq!(partial.signatures.len(), 1);

        // A second signer picks up the partially signed document.
        let mut registry2 = RoleRegistry::new();
        registry2.add_verification_key(TARGETS, kp1.pk.clone()).unwrap();
        registry2.add_verification_key(TARGETS, kp2.pk.clone()).unwrap();
        registry2.load_signing_key(TARGETS, kp2.sk.clone()).unwrap();
        registry2.set_threshold(TARGETS, 2).unwrap();
        let role = registry2.get_role(TARGETS).unwrap();

        let full = sign_body(role, &body, &partial.signatures).unwrap();
        assert_eq!(full.signatures.len(), 2);
        assert!(verify_threshold(role, &full).unwrap());
    }

    #[test]
    fn test_signatures_sorted_by_keyid() {
        let kps: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let refs: Vec<&KeyPair> = kps.iter().collect();
        let registry = role_with_keys(&refs, 1, 4);
        let role = registry.get_role(TARGETS).unwrap();

        let metadata = sign_body(role, &test_body(), &[]).unwrap();
        let keyids: Vec<&String> = metadata.signatures.iter().map(|s| &s.keyid).collect();
        let mut sorted = keyids.clone();
        sorted.sort();
        assert_eq!(keyids, sorted);
    }

    #[test]
    fn test_threshold_two_of_four() {
        let kps: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let refs: Vec<&KeyPair> = kps.iter().collect();

        // Two of the four keys sign: threshold met.
        let registry = role_with_keys(&refs, 2, 2);
        let role = registry.get_role(TARGETS).unwrap();
        let metadata = sign_body(role, &test_body(), &[]).unwrap();
        assert_eq!(valid_signature_count(role, &metadata).unwrap(), 2);
        assert!(verify_threshold(role, &metadata).unwrap());

        // Only one signs: threshold missed.
        let registry = role_with_keys(&refs, 2, 1);
        let role = registry.get_role(TARGETS).unwrap();
        let metadata = sign_body(role, &test_body(), &[]).unwrap();
        assert_eq!(valid_signature_count(role, &metadata).unwrap(), 1);
        assert!(!verify_threshold(role, &metadata).unwrap());
    }

    #[test]
    fn test_unknown_and_invalid_signatures_ignored() {
        let kp = KeyPair::generate();
        let outsider = KeyPair::generate();
        let registry = role_with_keys(&[&kp], 1, 1);
        let role = registry.get_role(TARGETS).unwrap();

        let body = test_body();
        let mut metadata = sign_body(role, &body, &[]).unwrap();
        // An untrusted key's signature and garbage bytes are both ignored.
        let canonical = canonical_bytes(&body).unwrap();
        metadata.signatures.push(Signature {
            keyid: outsider.pk.key_id(),
            sig: hex::encode(outsider.sk.sign(&canonical)),
        });
        metadata.signatures.push(Signature {
            keyid: "ffff".to_string(),
            sig: "not hex".to_string(),
        });

        assert_eq!(valid_signature_count(role, &metadata).unwrap(), 1);
        assert!(verify_threshold(role, &metadata).unwrap());
    }

    #[test]
    fn test_tampered_body_fails_verification() {
        let kp = KeyPair::generate();
        let registry = role_with_keys(&[&kp], 1, 1);
        let role = registry.get_role(TARGETS).unwrap();

        let mut metadata = sign_body(role, &test_body(), &[]).unwrap();
        if let RoleBody::Timestamp(body) = &mut metadata.signed {
            body.version = 99;
        }
        assert!(!verify_threshold(role, &metadata).unwrap());
    }
}
