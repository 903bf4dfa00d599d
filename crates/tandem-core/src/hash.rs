//! Content hashing for cache identity.

use std::hash::Hasher;

use rustc_hash::FxHasher;

const LANE_LO: u64 = 0x9e37_79b9_7f4a_7c15;
const LANE_HI: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// Fast non-cryptographic 128-bit digest of the exact bytes analyzed.
///
/// Two independently seeded `FxHasher` lanes; identity only, never security.
pub fn content_hash(bytes: &[u8]) -> u128 {
    let lo = lane(bytes, LANE_LO);
    let hi = lane(bytes, LANE_HI);
    ((hi as u128) << 64) | lo as u128
}

/// Hex rendering of a digest, for logs and the inspector.
pub fn hash_hex(hash: u128) -> String {
    format!("{hash:032x}")
}

fn lane(bytes: &[u8], seed: u64) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(seed);
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_for_identical_input() {
        assert_eq!(content_hash(b"let x = 1;"), content_hash(b"let x = 1;"));
    }

    #[test]
    fn digest_differs_for_different_input() {
        assert_ne!(content_hash(b"let x = 1;"), content_hash(b"let x = 2;"));
    }

    #[test]
    fn empty_content_hashes_stably() {
        assert_eq!(content_hash(b""), content_hash(b""));
        assert_ne!(content_hash(b""), content_hash(b"\n"));
    }

    #[test]
    fn hex_rendering_is_32_chars() {
        assert_eq!(hash_hex(content_hash(b"x")).len(), 32);
        assert_eq!(hash_hex(0), "0".repeat(32));
    }
}
