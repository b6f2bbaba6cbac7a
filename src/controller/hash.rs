//! Content hashing of specs for no-op detection.
//!
//! Every object the operator builds is stamped with the SHA-256 of the spec
//! that produced it. A later pass rebuilds the desired object and only writes
//! when the digests differ.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Annotation holding the hex digest.
pub const HASH_ANNOTATION: &str = "agent.datadoghq.com/agentspechash";

/// Hex SHA-256 of the JSON serialization of `spec`.
///
/// Struct fields serialize in declaration order and maps are `BTreeMap`s, so
/// equal values always produce equal bytes.
pub fn hash<T: Serialize + ?Sized>(spec: &T) -> Result<String> {
    let bytes = serde_json::to_vec(spec)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Hash `spec` and write the digest into `meta`'s annotations.
pub fn stamp<T: Serialize + ?Sized>(meta: &mut ObjectMeta, spec: &T) -> Result<String> {
    let digest = hash(spec)?;
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(HASH_ANNOTATION.to_string(), digest.clone());
    Ok(digest)
}

/// Digest stamped on `meta`, if any.
pub fn stamped(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(HASH_ANNOTATION))
        .map(String::as_str)
}

/// True when `meta` carries exactly `digest`.
pub fn matches(digest: &str, meta: &ObjectMeta) -> bool {
    stamped(meta) == Some(digest)
}
