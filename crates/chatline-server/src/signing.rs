//! Object-storage upload signatures.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

pub fn canonical_params(params: &BTreeMap<&str, String>) -> String {
    params
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex-encoded SHA-1 of the canonical string followed by `secret`.
pub fn sign_params(params: &BTreeMap<&str, String>, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(canonical_params(params).as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
