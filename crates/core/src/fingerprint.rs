//! SimHash fingerprinting.
//!
//! Pure and deterministic: identical inputs yield identical 64-bit
//! fingerprints across processes and Rust versions. Per-token bit weights
//! are derived from a SHA-256 digest rather than a process-local hasher
//! (`std::collections::hash_map::DefaultHasher` is explicitly *not*
//! guaranteed stable across toolchains) — grounded on the same crate the
//! ingestion scheduler uses for its own content hash.

use sha2::{Digest, Sha256};

/// Lowercase, split on non-alphanumeric boundaries.
fn tokenize(input: &str) -> Vec<String> {
    input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

/// Stable 64-bit hash of a single token, used to derive its bit weights.
fn token_hash(token: &str) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

/// Computes the 64-bit SimHash fingerprint of `input`. Empty input (or
/// input with no alphanumeric tokens) yields `0`.
pub fn fingerprint(input: &str) -> u64 {
    let tokens = tokenize(input);
    if tokens.is_empty() {
        return 0;
    }

    let mut weights = [0i64; 64];
    for token in &tokens {
        let h = token_hash(token);
        for (bit, weight) in weights.iter_mut().enumerate() {
            if (h >> bit) & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    let mut result: u64 = 0;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight >= 0 {
            result |= 1 << bit;
        }
    }
    result
}

/// Population count of `a ^ b` — the Hamming distance between two
/// fingerprints. A distance `<= 3` indicates a near-duplicate.
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}
