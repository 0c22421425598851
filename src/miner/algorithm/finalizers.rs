// src/miner/algorithm/finalizers.rs
//! The four CryptoNight finalizers
//!
//! After the final Keccak permutation the low two bits of the first state
//! byte pick one of these to squeeze the 200-byte state into the output hash.

use crate::types::Hash;
use digest::Digest;
use digest::consts::U32;
use digest09::Digest as _;

/// A finalizer squeezes the 200-byte state into the 32-byte result
pub type Finalizer = fn(&[u8]) -> Hash;

/// Finalizers indexed by `state[0] & 3`
pub const FINALIZERS: [Finalizer; 4] = [blake256, groestl256, jh256, skein512_256];

/// Picks the finalizer for a post-permutation state
pub fn select(state: &[u8]) -> Finalizer {
    FINALIZERS[(state[0] & 3) as usize]
}

/// BLAKE-256 (14 rounds)
pub fn blake256(data: &[u8]) -> Hash {
    to_hash(&blake_hash::Blake256::digest(data))
}

/// Groestl-256
pub fn groestl256(data: &[u8]) -> Hash {
    to_hash(&groestl::Groestl256::digest(data))
}

/// JH-256
pub fn jh256(data: &[u8]) -> Hash {
    to_hash(&jh::Jh256::digest(data))
}

/// Skein-512 with a 256-bit output
pub fn skein512_256(data: &[u8]) -> Hash {
    to_hash(&skein::Skein512::<U32>::digest(data))
}

fn to_hash(digest: &[u8]) -> Hash {
    let mut out = [0u8; 32];
    out.copy_from_slice(digest);
    Hash(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_uses_low_two_bits() {
        let mut state = [0u8; 200];
        for (selector, expected) in FINALIZERS.iter().enumerate() {
            state[0] = 0xfc | selector as u8;
            let picked = select(&state);
            assert_eq!(picked(&state), expected(&state));
        }
    }

    #[test]
    fn finalizers_disagree_on_same_input() {
        let state = [0x42u8; 200];
        let outputs: Vec<Hash> = FINALIZERS.iter().map(|f| f(&state)).collect();
        for i in 0..outputs.len() {
            for j in i + 1..outputs.len() {
                assert_ne!(outputs[i], outputs[j]);
            }
        }
    }
}
