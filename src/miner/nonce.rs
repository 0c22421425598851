// src/miner/nonce.rs
//! Lock-free nonce allocation
//!
//! Every hashing thread pulls consecutive nonce blocks from one shared
//! cursor. A fresh allocator is created for every job a worker receives and
//! is shared by all of that worker's backends.

use crate::miner::job::Job;
use std::sync::atomic::{AtomicU32, Ordering};

/// Nonce bits a nicehash pool leaves to the miner
pub const NICEHASH_MASK: u32 = 0x00ff_ffff;

/// Hands out disjoint ranges of the 32-bit nonce space
///
/// The cursor wraps to zero after `0xffffffff`; repeated coverage after a
/// full sweep is accepted.
#[derive(Debug)]
pub struct NonceAllocator {
    cursor: AtomicU32,
    prefix: u32,
    mask: u32,
}

impl Default for NonceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceAllocator {
    /// Allocator over the whole 32-bit space, starting at zero
    pub fn new() -> Self {
        Self::with_prefix(0, u32::MAX)
    }

    /// Allocator whose nonces keep the bits outside `mask` fixed to `prefix`
    pub fn with_prefix(prefix: u32, mask: u32) -> Self {
        NonceAllocator {
            cursor: AtomicU32::new(0),
            prefix: prefix & !mask,
            mask,
        }
    }

    /// Allocator for a job
    ///
    /// Nicehash jobs keep the pool-owned top byte from the blob and only
    /// vary the lower 24 bits.
    pub fn for_job(job: &Job) -> Self {
        if job.nicehash {
            Self::with_prefix(job.blob_nonce(), NICEHASH_MASK)
        } else {
            Self::new()
        }
    }

    /// Reserves `count` consecutive nonces and returns the first one
    pub fn allocate(&self, count: u32) -> u32 {
        self.allocate_block(count).first()
    }

    /// Reserves `count` consecutive nonces
    pub fn allocate_block(&self, count: u32) -> NonceBlock {
        let start = self.cursor.fetch_add(count, Ordering::Relaxed);
        NonceBlock {
            start,
            count,
            prefix: self.prefix,
            mask: self.mask,
        }
    }

    /// Restarts the cursor at `position`
    pub fn reset_to(&self, position: u32) {
        self.cursor.store(position, Ordering::Relaxed);
    }
}

/// A reserved run of nonces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceBlock {
    start: u32,
    count: u32,
    prefix: u32,
    mask: u32,
}

impl NonceBlock {
    /// First nonce of the block
    pub fn first(&self) -> u32 {
        self.nonce(0)
    }

    /// Number of nonces reserved
    pub fn len(&self) -> u32 {
        self.count
    }

    /// True for a zero-sized reservation
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Nonces of the block in order, wrapping inside the variable bits
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.count).map(move |i| self.nonce(i))
    }

    fn nonce(&self, i: u32) -> u32 {
        self.prefix | (self.start.wrapping_add(i) & self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::job::tests::sample_blob;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn concurrent_blocks_are_disjoint() {
        let allocator = Arc::new(NonceAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..500 {
                        seen.extend(allocator.allocate_block(7).iter());
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for nonce in handle.join().unwrap() {
                assert!(all.insert(nonce), "nonce {} handed out twice", nonce);
            }
        }
        assert_eq!(all.len(), 8 * 500 * 7);
    }

    #[test]
    fn cursor_wraps_to_zero() {
        let allocator = NonceAllocator::new();
        allocator.reset_to(u32::MAX - 1);
        let block = allocator.allocate_block(4);
        assert_eq!(block.iter().collect::<Vec<_>>(), vec![u32::MAX - 1, u32::MAX, 0, 1]);
        assert_eq!(allocator.allocate(1), 2);
    }

    #[test]
    fn nicehash_keeps_pool_byte() {
        let mut blob = sample_blob(7);
        blob[39..43].copy_from_slice(&0xa5_00_00_00u32.to_le_bytes());
        let job = Job::new("nh", blob, 100, None, true).unwrap();
        let allocator = NonceAllocator::for_job(&job);

        assert_eq!(allocator.allocate(3), 0xa500_0000);
        allocator.reset_to(NICEHASH_MASK);
        let block = allocator.allocate_block(2);
        assert_eq!(block.iter().collect::<Vec<_>>(), vec![0xa5ff_ffff, 0xa500_0000]);
    }
}
