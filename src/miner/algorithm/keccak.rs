// src/miner/algorithm/keccak.rs
//! Keccak-1600 sponge as used by CryptoNight
//!
//! CryptoNight uses the original Keccak padding (`0x01 .. 0x80`) with a
//! 136-byte rate and keeps the whole 200-byte state as output.

/// Size of the Keccak state in bytes
pub const STATE_SIZE: usize = 200;

const RATE: usize = 136;

/// 200-byte Keccak state viewed as 25 little-endian lanes
#[derive(Clone)]
pub struct KeccakState {
    lanes: [u64; 25],
}

impl KeccakState {
    /// Absorbs `input` and returns the full state after the final permutation
    pub fn absorb(input: &[u8]) -> Self {
        let mut state = KeccakState { lanes: [0u64; 25] };

        let mut blocks = input.chunks_exact(RATE);
        for block in &mut blocks {
            state.xor_block(block);
            state.permute();
        }

        let rest = blocks.remainder();
        let mut last = [0u8; RATE];
        last[..rest.len()].copy_from_slice(rest);
        last[rest.len()] = 0x01;
        last[RATE - 1] |= 0x80;
        state.xor_block(&last);
        state.permute();

        state
    }

    /// Rebuilds a state from its byte form
    pub fn from_bytes(bytes: &[u8; STATE_SIZE]) -> Self {
        let mut lanes = [0u64; 25];
        for (lane, chunk) in lanes.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *lane = u64::from_le_bytes(buf);
        }
        KeccakState { lanes }
    }

    /// Applies Keccak-f[1600] (24 rounds)
    pub fn permute(&mut self) {
        keccak::f1600(&mut self.lanes);
    }

    /// Serialises the state
    pub fn to_bytes(&self) -> [u8; STATE_SIZE] {
        let mut out = [0u8; STATE_SIZE];
        for (chunk, lane) in out.chunks_exact_mut(8).zip(self.lanes.iter()) {
            chunk.copy_from_slice(&lane.to_le_bytes());
        }
        out
    }

    /// Lane `index` of the state
    pub fn lane(&self, index: usize) -> u64 {
        self.lanes[index]
    }

    fn xor_block(&mut self, block: &[u8]) {
        for (lane, chunk) in self.lanes.iter_mut().zip(block.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *lane ^= u64::from_le_bytes(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn empty_input_matches_keccak256_prefix() {
        // Keccak-256("") shares rate and padding with this sponge, so its
        // digest is the first 32 bytes of the state.
        let state = KeccakState::absorb(b"").to_bytes();
        assert_eq!(
            state[..32],
            hex!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );
    }

    #[test]
    fn bytes_round_trip_through_lanes() {
        let state = KeccakState::absorb(b"lanes");
        let again = KeccakState::from_bytes(&state.to_bytes());
        assert_eq!(state.to_bytes(), again.to_bytes());
        assert_eq!(state.lane(3), again.lane(3));
    }

    #[test]
    fn multi_block_input_differs_from_truncation() {
        let long = [7u8; 300];
        assert_ne!(
            KeccakState::absorb(&long).to_bytes(),
            KeccakState::absorb(&long[..136]).to_bytes()
        );
    }
}
