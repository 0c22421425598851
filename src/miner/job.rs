// src/miner/job.rs
//! Mining jobs
//!
//! A [`Job`] is the immutable unit of work a pool hands out. It is never
//! edited after construction: a newer job replaces it wholesale.

use crate::types::AlgorithmVersion;
use crate::utils::error::MinerError;

/// Bytes of the nonce field inside the blob
pub const NONCE_SIZE: usize = 4;

/// A block-header template to search nonces for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Pool-assigned job identifier
    pub job_id: String,
    /// Header template; the nonce lives at `nonce_offset`
    pub blob: Vec<u8>,
    /// 64-bit threshold the hash's leading word must stay below
    pub target: u64,
    /// Byte offset of the 4-byte little-endian nonce
    pub nonce_offset: usize,
    /// Hash variant
    pub version: AlgorithmVersion,
    /// The pool owns the most significant nonce byte
    pub nicehash: bool,
    /// Share difficulty implied by `target`
    pub difficulty: u64,
}

impl Job {
    /// Builds a job, locating the nonce by parsing the blob's block header
    ///
    /// When `version` is `None` it is derived from the header's major version.
    pub fn new(
        job_id: impl Into<String>,
        blob: Vec<u8>,
        target: u64,
        version: Option<AlgorithmVersion>,
        nicehash: bool,
    ) -> Result<Self, MinerError> {
        let header = BlockHeader::parse(&blob)?;
        let version = version.unwrap_or_else(|| header.algorithm_version());
        Self::with_nonce_offset(job_id, blob, target, header.nonce_offset, version, nicehash)
    }

    /// Builds a job with an explicit nonce offset
    pub fn with_nonce_offset(
        job_id: impl Into<String>,
        blob: Vec<u8>,
        target: u64,
        nonce_offset: usize,
        version: AlgorithmVersion,
        nicehash: bool,
    ) -> Result<Self, MinerError> {
        let job = Job {
            job_id: job_id.into(),
            blob,
            target,
            nonce_offset,
            version,
            nicehash,
            difficulty: difficulty_for_target(target),
        };
        job.validate()?;
        Ok(job)
    }

    /// Builds a job from the hex fields of a pool notification
    pub fn from_pool(
        job_id: &str,
        blob_hex: &str,
        target_hex: &str,
        variant: Option<u64>,
        nicehash: bool,
    ) -> Result<Self, MinerError> {
        let version = match variant {
            Some(v) => Some(AlgorithmVersion::from_number(v).ok_or_else(|| {
                MinerError::InvalidJob(format!("Unsupported algorithm variant {}", v))
            })?),
            None => None,
        };
        Self::new(job_id, hex::decode(blob_hex)?, decode_target(target_hex)?, version, nicehash)
    }

    /// Checks the job can be hashed without violating engine preconditions
    pub fn validate(&self) -> Result<(), MinerError> {
        if self.job_id.is_empty() {
            return Err(MinerError::InvalidJob("Empty job id".into()));
        }
        if self.target == 0 {
            return Err(MinerError::InvalidJob(format!("Job {} has a zero target", self.job_id)));
        }
        if self.blob.len() < self.nonce_offset + NONCE_SIZE {
            return Err(MinerError::InvalidJob(format!(
                "Job {}: nonce at offset {} does not fit in a {}-byte blob",
                self.job_id,
                self.nonce_offset,
                self.blob.len()
            )));
        }
        if self.blob.len() < self.version.min_input_len() {
            return Err(MinerError::InvalidJob(format!(
                "Job {}: {} needs at least {} bytes, blob has {}",
                self.job_id,
                self.version,
                self.version.min_input_len(),
                self.blob.len()
            )));
        }
        Ok(())
    }

    /// Nonce currently stored in the blob
    pub fn blob_nonce(&self) -> u32 {
        let mut buf = [0u8; NONCE_SIZE];
        buf.copy_from_slice(&self.blob[self.nonce_offset..self.nonce_offset + NONCE_SIZE]);
        u32::from_le_bytes(buf)
    }

    /// Writes `nonce` into a copy of the blob
    pub fn write_nonce(&self, blob: &mut [u8], nonce: u32) {
        blob[self.nonce_offset..self.nonce_offset + NONCE_SIZE].copy_from_slice(&nonce.to_le_bytes());
    }
}

/// Fields of a CryptoNote block header up to the nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Major (hard fork) version
    pub major_version: u64,
    /// Minor version / vote
    pub minor_version: u64,
    /// Block timestamp
    pub timestamp: u64,
    /// Hash of the previous block
    pub prev_hash: [u8; 32],
    /// Nonce in the template
    pub nonce: u32,
    /// Offset of the nonce field
    pub nonce_offset: usize,
}

impl BlockHeader {
    /// Parses the varint header prefix of a hashing blob
    pub fn parse(blob: &[u8]) -> Result<Self, MinerError> {
        let mut pos = 0;
        let major_version = read_varint(blob, &mut pos)?;
        let minor_version = read_varint(blob, &mut pos)?;
        let timestamp = read_varint(blob, &mut pos)?;

        let prev = blob
            .get(pos..pos + 32)
            .ok_or_else(|| MinerError::InvalidJob("Blob truncated in previous block hash".into()))?;
        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(prev);
        pos += 32;

        let nonce_bytes = blob
            .get(pos..pos + NONCE_SIZE)
            .ok_or_else(|| MinerError::InvalidJob("Blob truncated in nonce".into()))?;
        let mut buf = [0u8; NONCE_SIZE];
        buf.copy_from_slice(nonce_bytes);

        Ok(BlockHeader {
            major_version,
            minor_version,
            timestamp,
            prev_hash,
            nonce: u32::from_le_bytes(buf),
            nonce_offset: pos,
        })
    }

    /// Hash variant the network expects at this major version
    pub fn algorithm_version(&self) -> AlgorithmVersion {
        match self.major_version {
            v if v >= 8 => AlgorithmVersion::V2,
            7 => AlgorithmVersion::V1,
            _ => AlgorithmVersion::V0,
        }
    }
}

/// Decodes a pool target
///
/// Four bytes are a compact 32-bit target scaled to 64 bits; eight bytes
/// are the 64-bit target itself. Both are little-endian hex.
pub fn decode_target(target_hex: &str) -> Result<u64, MinerError> {
    let bytes = hex::decode(target_hex)?;
    match bytes.len() {
        4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes);
            let compact = u32::from_le_bytes(buf);
            if compact == 0 {
                return Err(MinerError::ProtocolError("Zero target".into()));
            }
            Ok(u64::MAX / (u64::from(u32::MAX) / u64::from(compact)))
        }
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes);
            Ok(u64::from_le_bytes(buf))
        }
        n => Err(MinerError::ProtocolError(format!("Unexpected {}-byte target", n))),
    }
}

/// Share difficulty corresponding to a 64-bit target
pub fn difficulty_for_target(target: u64) -> u64 {
    if target == 0 { u64::MAX } else { u64::MAX / target }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, MinerError> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| MinerError::InvalidJob("Blob truncated in header varint".into()))?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(MinerError::InvalidJob("Header varint too long".into()))
}
