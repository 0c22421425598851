// src/miner/algorithm/cryptonight.rs
//! CryptoNight slow hash
//!
//! Bit-exact implementation of versions 0, 1 and 2 of the memory-hard hash
//! used by CryptoNote coins. All working memory lives in a caller-owned
//! [`Scratchpad`], so hashing never allocates and is safe to run from many
//! threads as long as each thread owns its scratchpad.

use super::aes::{Block, KeySchedule, single_round};
use super::finalizers;
use super::keccak::{KeccakState, STATE_SIZE};
use crate::types::{AlgorithmVersion, Hash};
use crate::utils::error::MinerError;

/// Size of the mixing buffer
pub const MEMORY: usize = 1 << 21;

/// Total memory touches of the mixing loop (two per iteration)
pub const ITERATIONS: usize = 1 << 20;

const AES_BLOCK: usize = 16;
const INIT_BLOCKS: usize = 8;
const INIT_SIZE: usize = INIT_BLOCKS * AES_BLOCK;
const TOTAL_BLOCKS: usize = MEMORY / AES_BLOCK;
const INDEX_MASK: u64 = ((TOTAL_BLOCKS - 1) << 4) as u64;

/// Per-thread working memory for the slow hash
///
/// 2 MiB mixing buffer plus the two expanded key schedules. Allocate one per
/// hashing thread and reuse it for every hash.
pub struct Scratchpad {
    blocks: Vec<Block>,
    key1: KeySchedule,
    key2: KeySchedule,
}

impl Scratchpad {
    /// Allocates a scratchpad, reporting allocation failure instead of aborting
    pub fn new() -> Result<Self, MinerError> {
        let mut blocks = Vec::new();
        blocks.try_reserve_exact(TOTAL_BLOCKS).map_err(|e| {
            MinerError::ResourceError(format!("Scratchpad allocation of {} bytes failed: {}", MEMORY, e))
        })?;
        blocks.resize(TOTAL_BLOCKS, Block::default());

        Ok(Scratchpad {
            blocks,
            key1: KeySchedule::default(),
            key2: KeySchedule::default(),
        })
    }

    /// Bytes of memory this scratchpad holds
    pub fn size() -> usize {
        MEMORY + 2 * super::aes::KEY_SCHEDULE_SIZE
    }
}

/// Computes the CryptoNight hash of `input`
///
/// # Errors
/// Returns `AlgorithmError` when a version ≥ 1 is asked to hash fewer than
/// 43 bytes; the v1 tweak reads input bytes 35..43.
pub fn slow_hash(
    input: &[u8],
    version: AlgorithmVersion,
    scratch: &mut Scratchpad,
) -> Result<Hash, MinerError> {
    if input.len() < version.min_input_len() {
        return Err(MinerError::AlgorithmError(format!(
            "{} needs at least {} input bytes, got {}",
            version,
            version.min_input_len(),
            input.len()
        )));
    }

    let keccak = KeccakState::absorb(input);
    let mut state = keccak.to_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&state[..32]);
    scratch.key1.expand(&key);
    key.copy_from_slice(&state[32..64]);
    scratch.key2.expand(&key);

    let tweak = match version {
        AlgorithmVersion::V1 => keccak.lane(24) ^ read_u64(&input[35..43]),
        _ => 0,
    };

    let v2 = version == AlgorithmVersion::V2;
    let (mut division_result, mut sqrt_result, mut b1) = if v2 {
        (
            keccak.lane(12),
            keccak.lane(13),
            [keccak.lane(8) ^ keccak.lane(10), keccak.lane(9) ^ keccak.lane(11)],
        )
    } else {
        (0, 0, [0, 0])
    };

    fill_scratchpad(&state[64..64 + INIT_SIZE], scratch);

    let mut a = [
        read_u64(&state[0..8]) ^ read_u64(&state[32..40]),
        read_u64(&state[8..16]) ^ read_u64(&state[40..48]),
    ];
    let mut b = [
        read_u64(&state[16..24]) ^ read_u64(&state[48..56]),
        read_u64(&state[24..32]) ^ read_u64(&state[56..64]),
    ];

    let pad = &mut scratch.blocks;
    for _ in 0..ITERATIONS / 2 {
        // First touch: one AES round keyed by `a`.
        let j = block_index(a[0]);
        let mut c = pad[j];
        single_round(&mut c, &to_block(a));
        let c_lanes = lanes(&c);

        if v2 {
            shuffle_add(pad, j, a, b, b1);
        }

        pad[j] = to_block([b[0] ^ c_lanes[0], b[1] ^ c_lanes[1]]);
        if version == AlgorithmVersion::V1 {
            let tmp = pad[j][11];
            let shift = (((tmp >> 3) & 6) | (tmp & 1)) << 1;
            pad[j][11] = tmp ^ (((0x75310u32 >> shift) & 0x30) as u8);
        }

        // Second touch: 64x64 multiply against the block at the new index.
        let j = block_index(c_lanes[0]);
        let mut c1 = lanes(&pad[j]);

        if v2 {
            c1[0] ^= division_result ^ (sqrt_result << 32);
            let dividend = c_lanes[1];
            let divisor = ((c_lanes[0] as u32).wrapping_add((sqrt_result << 1) as u32) | 0x8000_0001) as u64;
            division_result = ((dividend / divisor) as u32 as u64).wrapping_add((dividend % divisor) << 32);
            sqrt_result = integer_sqrt(c_lanes[0].wrapping_add(division_result));
        }

        let product = (c_lanes[0] as u128) * (c1[0] as u128);
        let (mut hi, mut lo) = ((product >> 64) as u64, product as u64);

        if v2 {
            let mut near = lanes(&pad[j ^ 1]);
            near[0] ^= hi;
            near[1] ^= lo;
            pad[j ^ 1] = to_block(near);
            let far = lanes(&pad[j ^ 2]);
            hi ^= far[0];
            lo ^= far[1];
            shuffle_add(pad, j, a, b, b1);
        }

        a[0] = a[0].wrapping_add(hi);
        a[1] = a[1].wrapping_add(lo);
        pad[j] = to_block(a);
        a[0] ^= c1[0];
        a[1] ^= c1[1];
        if version == AlgorithmVersion::V1 {
            let mut stored = lanes(&pad[j]);
            stored[1] ^= tweak;
            pad[j] = to_block(stored);
        }

        b1 = b;
        b = c_lanes;
    }

    drain_scratchpad(&mut state[64..64 + INIT_SIZE], scratch);

    let mut keccak = KeccakState::from_bytes(&state);
    keccak.permute();
    let state: [u8; STATE_SIZE] = keccak.to_bytes();
    Ok(finalizers::select(&state)(&state))
}

/// Expands the 128-byte init region into the whole buffer, each 128-byte
/// step encrypting the previous one
fn fill_scratchpad(init: &[u8], scratch: &mut Scratchpad) {
    let Scratchpad { blocks, key1, .. } = scratch;

    for (dst, src) in blocks[..INIT_BLOCKS].iter_mut().zip(init.chunks_exact(AES_BLOCK)) {
        dst.copy_from_slice(src);
    }
    key1.pseudo_round_blocks(&mut blocks[..INIT_BLOCKS]);

    for step in 1..TOTAL_BLOCKS / INIT_BLOCKS {
        let (done, rest) = blocks.split_at_mut(step * INIT_BLOCKS);
        let prev = &done[(step - 1) * INIT_BLOCKS..];
        let next = &mut rest[..INIT_BLOCKS];
        next.copy_from_slice(prev);
        key1.pseudo_round_blocks(next);
    }
}

/// Folds the mixed buffer back into the init region using the second key
fn drain_scratchpad(init: &mut [u8], scratch: &Scratchpad) {
    let mut text = [Block::default(); INIT_BLOCKS];
    for (dst, src) in text.iter_mut().zip(init.chunks_exact(AES_BLOCK)) {
        dst.copy_from_slice(src);
    }

    for slice in scratch.blocks.chunks_exact(INIT_BLOCKS) {
        for (block, mixed) in text.iter_mut().zip(slice) {
            for (x, y) in block.iter_mut().zip(mixed.iter()) {
                *x ^= y;
            }
            scratch.key2.pseudo_round(block);
        }
    }

    for (dst, src) in init.chunks_exact_mut(AES_BLOCK).zip(text.iter()) {
        dst.copy_from_slice(src);
    }
}

/// Version 2 shuffle: add `b`, `a`, `b1` to the three neighbours of `j` and
/// rotate them (+0x10 ← +0x30, +0x20 ← +0x10, +0x30 ← +0x20)
fn shuffle_add(pad: &mut [Block], j: usize, a: [u64; 2], b: [u64; 2], b1: [u64; 2]) {
    let chunk1 = add_lanes(lanes(&pad[j ^ 1]), b);
    let chunk2 = add_lanes(lanes(&pad[j ^ 2]), a);
    let chunk3 = add_lanes(lanes(&pad[j ^ 3]), b1);
    pad[j ^ 1] = to_block(chunk3);
    pad[j ^ 2] = to_block(chunk1);
    pad[j ^ 3] = to_block(chunk2);
}

/// Binary digit-by-digit square root used by version 2
///
/// Yields the 32-bit value the reference implementation derives from
/// `sqrt(2^64 + input) * 2 - 2^33`.
fn integer_sqrt(mut input: u64) -> u64 {
    let mut r: u64 = 1 << 63;
    let mut bit: u64 = 1 << 60;
    while bit != 0 {
        let trial = r.wrapping_add(bit);
        if input < trial {
            r >>= 1;
        } else {
            input = input.wrapping_sub(trial);
            r = r.wrapping_add(bit.wrapping_mul(2)) >> 1;
        }
        bit >>= 2;
    }
    (r.wrapping_mul(2).wrapping_add(u64::from(input > r))) as u32 as u64
}

/// Buffer block addressed by the low bits of a lane, 16-byte aligned
fn block_index(lane: u64) -> usize {
    ((lane & INDEX_MASK) >> 4) as usize
}

fn lanes(block: &Block) -> [u64; 2] {
    [read_u64(&block[..8]), read_u64(&block[8..])]
}

fn to_block(lanes: [u64; 2]) -> Block {
    let mut block = Block::default();
    block[..8].copy_from_slice(&lanes[0].to_le_bytes());
    block[8..].copy_from_slice(&lanes[1].to_le_bytes());
    block
}

fn add_lanes(x: [u64; 2], y: [u64; 2]) -> [u64; 2] {
    [x[0].wrapping_add(y[0]), x[1].wrapping_add(y[1])]
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn hash(input: &[u8], version: AlgorithmVersion) -> Hash {
        let mut scratch = Scratchpad::new().unwrap();
        slow_hash(input, version, &mut scratch).unwrap()
    }

    #[test]
    fn v0_reference_vectors() {
        assert_eq!(
            hash(b"This is a test", AlgorithmVersion::V0).0,
            hex!("a084f01d1437a09c6985401b60d43554ae105802c5f5d8a9b3253649c0be6605")
        );
        assert_eq!(
            hash(b"de omnibus dubitandum", AlgorithmVersion::V0).0,
            hex!("2f8e3df40bd11f9ac90c743ca8e32bb391da4fb98612aa3b6cdc639ee00b31f5")
        );
    }

    #[test]
    fn v1_reference_vector_at_minimum_length() {
        let input = hex!("38274c97c45a172cfc97679870422e3a1ab0784960c60514d816271415c306ee3a3ed1a77e31f6a885c3cb");
        assert_eq!(input.len(), 43);
        assert_eq!(
            hash(&input, AlgorithmVersion::V1).0,
            hex!("ed082e49dbd5bbe34a3726a0d1dad981146062b39d36d62c71eb1ed8ab49459b")
        );
    }

    #[test]
    fn v2_reference_vector() {
        assert_eq!(
            hash(b"This is a test This is a test This is a test", AlgorithmVersion::V2).0,
            hex!("353fdc068fd47b03c04b9431e005e00b68c2168a3cc7335c8b9b308156591a4f")
        );
    }

    #[test]
    fn reused_scratchpad_is_deterministic() {
        let mut scratch = Scratchpad::new().unwrap();
        let input = [0x5au8; 76];
        let first = slow_hash(&input, AlgorithmVersion::V2, &mut scratch).unwrap();
        let _ = slow_hash(b"something else entirely, long enough", AlgorithmVersion::V0, &mut scratch).unwrap();
        let second = slow_hash(&input, AlgorithmVersion::V2, &mut scratch).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn short_input_rejected_for_tweaked_versions() {
        let mut scratch = Scratchpad::new().unwrap();
        for version in [AlgorithmVersion::V1, AlgorithmVersion::V2] {
            let err = slow_hash(&[0u8; 42], version, &mut scratch).unwrap_err();
            assert!(matches!(err, MinerError::AlgorithmError(_)));
        }
        assert!(slow_hash(&[0u8; 42], AlgorithmVersion::V0, &mut scratch).is_ok());
    }

    #[test]
    fn integer_sqrt_fits_in_32_bits() {
        for input in [0u64, 1, 0xffff_ffff, 0x1234_5678_9abc_def0, u64::MAX] {
            assert!(integer_sqrt(input) <= u32::MAX as u64);
        }
        assert!(integer_sqrt(u64::MAX) >= integer_sqrt(0));
    }

    #[test]
    fn index_is_aligned_and_in_range() {
        assert_eq!(block_index(0), 0);
        assert_eq!(block_index(0x1f), 1);
        assert_eq!(block_index(u64::MAX), TOTAL_BLOCKS - 1);
    }
}
