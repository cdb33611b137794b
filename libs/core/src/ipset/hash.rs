//! Deterministic name hashing.
//!
//! The hashed name is the identifier the kernel and the debug converter see, so it MUST
//! depend only on the canonical name — no process-local salt, no `RandomState`-seeded
//! `std::collections::hash_map::DefaultHasher`. `sha2` is already part of this stack's
//! dependency tree (see `npm-k8s-util`'s upstream), so it is reused here rather than
//! pulling in a second hashing crate.

use sha2::{Digest, Sha256};

/// Hash a canonical IP-set/list name into the short hex identifier used as the in-kernel
/// set name (kernel set names are capped at 31 bytes, so this stays well under that).
pub fn hash_name(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    format!("azure-npm-{:x}", u64::from_be_bytes(digest[0..8].try_into().unwrap()))
}
