use sha2::{Digest, Sha256};

/// Map a context id to a stable fraction in [0, 1).
///
/// First 8 bytes of the SHA-256 digest, big-endian, divided by 2^64. Not
/// guaranteed to stay the same across library versions.
pub fn context_id_fraction(context_id: &str) -> f64 {
    let hash = Sha256::digest(context_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    // Drop to 53 bits so the division is exact in f64 and never rounds to 1.0.
    (u64::from_be_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
}

/// Decide whether a message is kept at the given sampling rate.
///
/// With a context id the decision is deterministic; without one it is a
/// fresh random draw.
pub fn should_sample(context_id: Option<&str>, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    match context_id {
        Some(id) => context_id_fraction(id) < rate,
        None => rand::random::<f64>() < rate,
    }
}
