// src/types.rs
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CryptoNight algorithm versions understood by the hash engine
///
/// The version is selected per job, usually from the major version of the
/// block header the pool hands out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmVersion {
    /// Original CryptoNight
    #[clap(name = "v0")]
    V0,

    /// CryptoNight v1 ("tweak" variant)
    ///
    /// Requires blobs of at least 43 bytes.
    #[clap(name = "v1")]
    V1,

    /// CryptoNight v2 (division, square root and chunk shuffle)
    ///
    /// Requires blobs of at least 43 bytes.
    #[clap(name = "v2")]
    V2,
}

impl AlgorithmVersion {
    /// Numeric variant as used by pools and the reference implementation
    pub fn number(self) -> u64 {
        match self {
            AlgorithmVersion::V0 => 0,
            AlgorithmVersion::V1 => 1,
            AlgorithmVersion::V2 => 2,
        }
    }

    /// Maps a numeric variant back to a version
    pub fn from_number(variant: u64) -> Option<Self> {
        match variant {
            0 => Some(AlgorithmVersion::V0),
            1 => Some(AlgorithmVersion::V1),
            2 => Some(AlgorithmVersion::V2),
            _ => None,
        }
    }

    /// Smallest blob this version can hash
    pub fn min_input_len(self) -> usize {
        match self {
            AlgorithmVersion::V0 => 0,
            AlgorithmVersion::V1 | AlgorithmVersion::V2 => 43,
        }
    }
}

impl fmt::Display for AlgorithmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cn/{}", self.number())
    }
}

impl FromStr for AlgorithmVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "v0" | "cn/0" | "cryptonight" => Ok(AlgorithmVersion::V0),
            "1" | "v1" | "cn/1" | "cryptonight-v7" => Ok(AlgorithmVersion::V1),
            "2" | "v2" | "cn/2" | "cryptonight-v8" => Ok(AlgorithmVersion::V2),
            _ => Err(format!("Unknown algorithm version: {}", s)),
        }
    }
}

/// 32-byte hash produced by the hash engine
///
/// The bytes are the canonical form; the 32-bit and 64-bit word views read
/// the same bits in little-endian order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Raw byte view
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Four 64-bit little-endian words
    pub fn words64(&self) -> [u64; 4] {
        let mut out = [0u64; 4];
        for (word, chunk) in out.iter_mut().zip(self.0.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *word = u64::from_le_bytes(buf);
        }
        out
    }

    /// Eight 32-bit little-endian words
    pub fn words32(&self) -> [u32; 8] {
        let mut out = [0u32; 8];
        for (word, chunk) in out.iter_mut().zip(self.0.chunks_exact(4)) {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            *word = u32::from_le_bytes(buf);
        }
        out
    }

    /// Most significant 64 bits of the hash read as a little-endian number
    ///
    /// This is the value compared against a job's 64-bit target.
    pub fn leading_u64(&self) -> u64 {
        self.words64()[3]
    }

    /// True when the hash qualifies for the given target
    pub fn meets_target(&self, target: u64) -> bool {
        self.leading_u64() < target
    }

    /// Lowercase hex encoding, as submitted to pools
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
