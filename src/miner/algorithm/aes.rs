// src/miner/algorithm/aes.rs
//! AES building blocks for the CryptoNight scratchpad
//!
//! CryptoNight does not run standard AES. It expands two AES-256 keys with
//! the normal key schedule but then applies ten full rounds (SubBytes,
//! ShiftRows, MixColumns, AddRoundKey) with no initial key addition and no
//! shortened final round. The round itself comes from the `aes` crate's
//! hazmat API, which picks AES-NI / ARMv8 instructions when available and a
//! constant-time software round otherwise; results are identical.

use aes::hazmat::cipher_round;

pub use aes::Block;

/// Bytes occupied by one expanded key schedule (11 round keys)
pub const KEY_SCHEDULE_SIZE: usize = 176;

/// Number of rounds in a pseudo round
pub const PSEUDO_ROUNDS: usize = 10;

const ROUND_KEYS: usize = KEY_SCHEDULE_SIZE / 16;

const RCON: [u8; 7] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40];

#[rustfmt::skip]
const SBOX: [u8; 256] = [
    0x63, 0x7c, 0x77, 0x7b, 0xf2, 0x6b, 0x6f, 0xc5, 0x30, 0x01, 0x67, 0x2b, 0xfe, 0xd7, 0xab, 0x76,
    0xca, 0x82, 0xc9, 0x7d, 0xfa, 0x59, 0x47, 0xf0, 0xad, 0xd4, 0xa2, 0xaf, 0x9c, 0xa4, 0x72, 0xc0,
    0xb7, 0xfd, 0x93, 0x26, 0x36, 0x3f, 0xf7, 0xcc, 0x34, 0xa5, 0xe5, 0xf1, 0x71, 0xd8, 0x31, 0x15,
    0x04, 0xc7, 0x23, 0xc3, 0x18, 0x96, 0x05, 0x9a, 0x07, 0x12, 0x80, 0xe2, 0xeb, 0x27, 0xb2, 0x75,
    0x09, 0x83, 0x2c, 0x1a, 0x1b, 0x6e, 0x5a, 0xa0, 0x52, 0x3b, 0xd6, 0xb3, 0x29, 0xe3, 0x2f, 0x84,
    0x53, 0xd1, 0x00, 0xed, 0x20, 0xfc, 0xb1, 0x5b, 0x6a, 0xcb, 0xbe, 0x39, 0x4a, 0x4c, 0x58, 0xcf,
    0xd0, 0xef, 0xaa, 0xfb, 0x43, 0x4d, 0x33, 0x85, 0x45, 0xf9, 0x02, 0x7f, 0x50, 0x3c, 0x9f, 0xa8,
    0x51, 0xa3, 0x40, 0x8f, 0x92, 0x9d, 0x38, 0xf5, 0xbc, 0xb6, 0xda, 0x21, 0x10, 0xff, 0xf3, 0xd2,
    0xcd, 0x0c, 0x13, 0xec, 0x5f, 0x97, 0x44, 0x17, 0xc4, 0xa7, 0x7e, 0x3d, 0x64, 0x5d, 0x19, 0x73,
    0x60, 0x81, 0x4f, 0xdc, 0x22, 0x2a, 0x90, 0x88, 0x46, 0xee, 0xb8, 0x14, 0xde, 0x5e, 0x0b, 0xdb,
    0xe0, 0x32, 0x3a, 0x0a, 0x49, 0x06, 0x24, 0x5c, 0xc2, 0xd3, 0xac, 0x62, 0x91, 0x95, 0xe4, 0x79,
    0xe7, 0xc8, 0x37, 0x6d, 0x8d, 0xd5, 0x4e, 0xa9, 0x6c, 0x56, 0xf4, 0xea, 0x65, 0x7a, 0xae, 0x08,
    0xba, 0x78, 0x25, 0x2e, 0x1c, 0xa6, 0xb4, 0xc6, 0xe8, 0xdd, 0x74, 0x1f, 0x4b, 0xbd, 0x8b, 0x8a,
    0x70, 0x3e, 0xb5, 0x66, 0x48, 0x03, 0xf6, 0x0e, 0x61, 0x35, 0x57, 0xb9, 0x86, 0xc1, 0x1d, 0x9e,
    0xe1, 0xf8, 0x98, 0x11, 0x69, 0xd9, 0x8e, 0x94, 0x9b, 0x1e, 0x87, 0xe9, 0xce, 0x55, 0x28, 0xdf,
    0x8c, 0xa1, 0x89, 0x0d, 0xbf, 0xe6, 0x42, 0x68, 0x41, 0x99, 0x2d, 0x0f, 0xb0, 0x54, 0xbb, 0x16,
];

/// Expanded AES-256 key schedule
///
/// Holds all 11 round keys the standard schedule derives from the first
/// 44 words; pseudo rounds only consume the first ten.
#[derive(Clone)]
pub struct KeySchedule {
    round_keys: [Block; ROUND_KEYS],
}

impl Default for KeySchedule {
    fn default() -> Self {
        KeySchedule {
            round_keys: [Block::default(); ROUND_KEYS],
        }
    }
}

impl KeySchedule {
    /// Expands a 32-byte key in place, reusing this schedule's storage
    pub fn expand(&mut self, key: &[u8; 32]) {
        let mut words = [[0u8; 4]; ROUND_KEYS * 4];
        for (word, chunk) in words.iter_mut().zip(key.chunks_exact(4)) {
            word.copy_from_slice(chunk);
        }

        for i in 8..words.len() {
            let mut temp = words[i - 1];
            if i % 8 == 0 {
                temp.rotate_left(1);
                sub_word(&mut temp);
                temp[0] ^= RCON[i / 8 - 1];
            } else if i % 8 == 4 {
                sub_word(&mut temp);
            }
            for b in 0..4 {
                words[i][b] = words[i - 8][b] ^ temp[b];
            }
        }

        for (round_key, group) in self.round_keys.iter_mut().zip(words.chunks_exact(4)) {
            for (dst, word) in round_key.chunks_exact_mut(4).zip(group) {
                dst.copy_from_slice(word);
            }
        }
    }

    /// Round key `index` (0..11)
    pub fn round_key(&self, index: usize) -> &Block {
        &self.round_keys[index]
    }

    /// Ten chained AES rounds over one block
    pub fn pseudo_round(&self, block: &mut Block) {
        for key in &self.round_keys[..PSEUDO_ROUNDS] {
            cipher_round(block, key);
        }
    }

    /// Pseudo round over each block of `blocks`
    pub fn pseudo_round_blocks(&self, blocks: &mut [Block]) {
        for block in blocks {
            self.pseudo_round(block);
        }
    }
}

/// One AES encryption round using `key` as the round key
pub fn single_round(block: &mut Block, key: &Block) {
    cipher_round(block, key);
}

fn sub_word(word: &mut [u8; 4]) {
    for byte in word.iter_mut() {
        *byte = SBOX[*byte as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn key_schedule_matches_fips197_aes256() {
        let key: [u8; 32] = hex!("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f");
        let mut schedule = KeySchedule::default();
        schedule.expand(&key);

        assert_eq!(schedule.round_key(0).as_slice(), &key[..16]);
        assert_eq!(schedule.round_key(1).as_slice(), &key[16..]);
        assert_eq!(
            schedule.round_key(2).as_slice(),
            hex!("a573c29fa176c498a97fce93a572c09c")
        );
        assert_eq!(
            schedule.round_key(3).as_slice(),
            hex!("1651a8cd0244beda1a5da4c10640bade")
        );
    }

    #[test]
    fn sbox_spot_checks() {
        assert_eq!(SBOX[0x00], 0x63);
        assert_eq!(SBOX[0x53], 0xed);
        assert_eq!(SBOX[0xff], 0x16);
    }

    #[test]
    fn pseudo_round_is_ten_single_rounds() {
        let mut schedule = KeySchedule::default();
        schedule.expand(&[0x5a; 32]);

        let mut direct = Block::clone_from_slice(&[0x11; 16]);
        schedule.pseudo_round(&mut direct);

        let mut stepped = Block::clone_from_slice(&[0x11; 16]);
        for i in 0..PSEUDO_ROUNDS {
            single_round(&mut stepped, schedule.round_key(i));
        }
        assert_eq!(direct, stepped);
    }
}
