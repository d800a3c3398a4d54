//! Deterministic bucketing. A subject's position in `[0, 1]` is derived
//! from a SHA1 digest of the flag key and subject id, so the same subject
//! always lands in the same bucket for a given flag.

use sha1::{Digest, Sha1};

use super::models::VariantDefinition;

/// Scale for the 60-bit digest prefix: `2^60 - 1`.
const LONG_SCALE: f64 = 0xFFF_FFFF_FFFF_FFFFu64 as f64;

/// Salt appended when assigning multivariate variants, so variant buckets
/// are independent of the rollout bucket.
const VARIANT_SALT: &str = "variant";

pub(crate) trait BucketHasher {
    /// Deterministic position of `(key, subject, salt)` in `[0, 1]`.
    fn bucket(&self, key: &str, subject: &str, salt: &str) -> f64;
}

/// The default (and only) hasher.
pub(crate) struct Sha1Hasher;

impl BucketHasher for Sha1Hasher {
    fn bucket(&self, key: &str, subject: &str, salt: &str) -> f64 {
        let mut hasher = Sha1::new();
        hasher.update(format!("{key}.{subject}{salt}").as_bytes());
        let digest = hex::encode(hasher.finalize());
        // First 15 hex characters form a 60-bit unsigned integer.
        let value = u64::from_str_radix(&digest[..15], 16)
            .expect("sha1 digest prefix is valid hexadecimal");
        value as f64 / LONG_SCALE
    }
}

/// Whether `subject` falls inside a percentage rollout for `key`.
pub(crate) fn in_rollout(
    hasher: &impl BucketHasher,
    key: &str,
    subject: &str,
    rollout_percentage: f64,
) -> bool {
    if rollout_percentage >= 100.0 {
        return true;
    }
    if rollout_percentage <= 0.0 {
        return false;
    }
    hasher.bucket(key, subject, "") < rollout_percentage / 100.0
}

/// Pick the variant whose contiguous range (in declaration order) contains
/// the subject's variant bucket. `None` when the bucket falls past the
/// declared ranges.
pub(crate) fn matching_variant(
    hasher: &impl BucketHasher,
    key: &str,
    subject: &str,
    variants: &[VariantDefinition],
) -> Option<String> {
    let bucket = hasher.bucket(key, subject, VARIANT_SALT);
    let mut lower = 0.0;
    for variant in variants {
        let upper = lower + variant.rollout_percentage / 100.0;
        if bucket >= lower && bucket < upper {
            return Some(variant.key.clone());
        }
        lower = upper;
    }
    None
}
