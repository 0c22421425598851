// src/miner/backend/mod.rs
//! Hashing backends
//!
//! A backend owns a set of hashing threads (or a batch dispatcher) that
//! pull nonce blocks for the current job, run the hash engine and report
//! qualifying results to a [`ResultSink`]. CPU and batch backends share the
//! [`Backend`] contract so the coordinator can treat them alike.

/// Thread-per-core backend
pub mod cpu;

/// Batched-dispatch backend
pub mod batch;

use crate::miner::job::Job;
use crate::miner::nonce::NonceAllocator;
use crate::types::Hash;
use crate::utils::error::MinerError;
use arc_swap::ArcSwapOption;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

pub use batch::BatchBackend;
pub use cpu::CpuBackend;

/// Kinds of hashing resources
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One OS thread per hashing worker
    Cpu,
    /// One driver thread dispatching nonce batches to a compute pool
    Batch,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Batch => write!(f, "batch"),
        }
    }
}

/// Contract every hashing backend satisfies
pub trait Backend: Send + Sync {
    /// Resource kind
    fn kind(&self) -> BackendKind;

    /// Atomically replaces the job being hashed
    ///
    /// `nonces` is the job's cursor. Every backend mining the same job for
    /// the same worker receives the same allocator, so their nonce ranges
    /// never overlap. Once this returns, no result for the previous job is
    /// reported.
    fn set_job(&self, job: Arc<Job>, nonces: Arc<NonceAllocator>);

    /// Drops the current job; threads idle until the next one
    fn clear_job(&self);

    /// Fraction of the underlying resource the backend may use (0..=1)
    fn set_capacity_limit(&self, fraction: f64);

    /// Current capacity fraction
    fn capacity_limit(&self) -> f64;

    /// Starts hashing threads according to the capacity limit
    fn start(&self) -> Result<(), MinerError>;

    /// Stops all hashing threads and waits for them to exit
    fn stop(&self);

    /// True between `start` and `stop`
    fn is_running(&self) -> bool;

    /// Smoothed hashes per second
    fn hash_rate(&self) -> f64;
}

/// A qualifying hash found by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundResult {
    /// Backend that produced the result
    pub backend: usize,
    /// Job the nonce was hashed against
    pub job_id: String,
    /// Winning nonce
    pub nonce: u32,
    /// Resulting hash
    pub hash: Hash,
}

/// Messages from backends to the coordinator
#[derive(Debug)]
pub enum BackendEvent {
    /// A hash met the job target
    Found(FoundResult),
    /// The backend can no longer hash (e.g. scratchpad allocation failed)
    Failed {
        /// Backend that failed
        backend: usize,
        /// Cause
        error: MinerError,
    },
}

/// Non-owning handle a backend uses to reach its coordinator
#[derive(Debug, Clone)]
pub struct ResultSink {
    backend: usize,
    tx: Sender<BackendEvent>,
}

impl ResultSink {
    /// Sink tagging every event with `backend`
    pub fn new(backend: usize, tx: Sender<BackendEvent>) -> Self {
        ResultSink { backend, tx }
    }

    /// Identifier of the owning backend
    pub fn backend(&self) -> usize {
        self.backend
    }

    /// Reports a qualifying result
    pub fn found(&self, job_id: &str, nonce: u32, hash: Hash) {
        let event = BackendEvent::Found(FoundResult {
            backend: self.backend,
            job_id: job_id.to_string(),
            nonce,
            hash,
        });
        if let Err(e) = self.tx.send(event) {
            log::debug!("Backend {}: dropping result, {}", self.backend, MinerError::from(e));
        }
    }

    /// Reports a fatal backend error
    pub fn failed(&self, error: MinerError) {
        let event = BackendEvent::Failed {
            backend: self.backend,
            error,
        };
        if let Err(e) = self.tx.send(event) {
            log::debug!("Backend {}: coordinator gone, {}", self.backend, MinerError::from(e));
        }
    }
}

/// A job together with its own nonce cursor
#[derive(Debug)]
pub struct ActiveJob {
    /// The job
    pub job: Arc<Job>,
    /// Monotonic number of this assignment within the backend
    pub epoch: u64,
    /// Nonce cursor, shared with every backend hashing this job
    pub nonces: Arc<NonceAllocator>,
}

/// The current job of a backend, shared by all of its threads
///
/// Replacement is atomic. Reporting goes through a read gate that
/// `replace` takes exclusively, so a result checked against the old job
/// can never be sent after `replace` returns.
#[derive(Default)]
pub struct JobSlot {
    current: ArcSwapOption<ActiveJob>,
    gate: RwLock<()>,
    epochs: AtomicU64,
}

impl JobSlot {
    /// Installs `job`, drawing nonces from `nonces`
    pub fn replace(&self, job: Arc<Job>, nonces: Arc<NonceAllocator>) {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let active = ActiveJob {
            nonces,
            job,
            epoch,
        };
        let _guard = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        self.current.store(Some(Arc::new(active)));
    }

    /// Removes the current job
    pub fn clear(&self) {
        let _guard = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        self.current.store(None);
    }

    /// Snapshot of the current job
    pub fn current(&self) -> Option<Arc<ActiveJob>> {
        self.current.load_full()
    }

    /// True while `epoch` is still the installed assignment
    pub fn is_current(&self, epoch: u64) -> bool {
        self.current
            .load()
            .as_ref()
            .is_some_and(|active| active.epoch == epoch)
    }

    /// Runs `report` only if `epoch` is still current, excluding concurrent
    /// replacement while it runs
    pub fn report_if_current(&self, epoch: u64, report: impl FnOnce()) -> bool {
        let _guard = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.is_current(epoch) {
            report();
            true
        } else {
            false
        }
    }
}

/// Hash-rate cell written by one thread and read by anyone
#[derive(Debug, Default)]
pub struct RateSlot(AtomicU64);

impl RateSlot {
    /// Publishes a rate
    pub fn store(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Relaxed);
    }

    /// Latest published rate
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Exponential smoothing of per-block hash rates
#[derive(Debug, Clone)]
pub struct RateSmoother {
    alpha: f64,
    value: Option<f64>,
}

impl Default for RateSmoother {
    fn default() -> Self {
        RateSmoother {
            alpha: 0.2,
            value: None,
        }
    }
}

impl RateSmoother {
    /// Folds in `hashes` completed over `elapsed` and returns the new estimate
    pub fn update(&mut self, hashes: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.value.unwrap_or(0.0);
        }
        let sample = hashes as f64 / secs;
        let next = match self.value {
            Some(prev) => prev + self.alpha * (sample - prev),
            None => sample,
        };
        self.value = Some(next);
        next
    }
}

/// Settings shared by backend implementations
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Nonces per allocation
    pub nonce_block: u32,
    /// Threads (CPU) or lanes (batch) at full capacity
    pub max_threads: usize,
    /// Poll interval while no job is installed
    pub idle_wait: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            nonce_block: 16,
            max_threads: num_cpus::get(),
            idle_wait: Duration::from_millis(50),
        }
    }
}

/// Sleeps so that a block that took `busy` occupies `duty` of wall time
///
/// Sleeps in short slices so a stop request is honoured promptly.
pub(crate) fn throttle(busy: Duration, duty: f64, stop: &AtomicBool) {
    if duty >= 1.0 || duty <= 0.0 {
        return;
    }
    let deadline = Instant::now() + busy.mul_f64(1.0 / duty - 1.0);
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}

/// Clamps a capacity fraction into 0..=1, mapping NaN to 0
pub(crate) fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::miner::algorithm::{Algorithm, Scratchpad};
    use crate::miner::algorithm::keccak::KeccakState;
    use crate::types::AlgorithmVersion;

    /// Cheap stand-in engine: Keccak of the input, no scratchpad use
    pub(crate) struct FastEngine;

    impl Algorithm for FastEngine {
        fn hash(
            &self,
            input: &[u8],
            _version: AlgorithmVersion,
            _scratch: &mut Scratchpad,
        ) -> Result<Hash, MinerError> {
            let state = KeccakState::absorb(input).to_bytes();
            let mut out = [0u8; 32];
            out.copy_from_slice(&state[..32]);
            Ok(Hash(out))
        }

        fn name(&self) -> &'static str {
            "fast-keccak"
        }
    }

    pub(crate) fn test_job(id: &str, target: u64) -> Arc<Job> {
        let blob = crate::miner::job::tests::sample_blob(7);
        Arc::new(Job::new(id, blob, target, None, false).unwrap())
    }

    /// Hands `job` to a single backend with a cursor of its own
    pub(crate) fn install(backend: &dyn Backend, job: Arc<Job>) {
        let nonces = Arc::new(NonceAllocator::for_job(&job));
        backend.set_job(job, nonces);
    }

    fn fresh(job: Arc<Job>) -> (Arc<Job>, Arc<NonceAllocator>) {
        let nonces = Arc::new(NonceAllocator::for_job(&job));
        (job, nonces)
    }

    #[test]
    fn slot_replacement_bumps_epoch_and_resets_nonces() {
        let slot = JobSlot::default();
        assert!(slot.current().is_none());

        let (job, nonces) = fresh(test_job("a", 10));
        slot.replace(job, nonces);
        let first = slot.current().unwrap();
        assert_eq!(first.nonces.allocate(5), 0);

        let (job, nonces) = fresh(test_job("b", 10));
        slot.replace(job, nonces);
        let second = slot.current().unwrap();
        assert!(second.epoch > first.epoch);
        assert_eq!(second.nonces.allocate(5), 0);
        assert!(!slot.is_current(first.epoch));
        assert!(!slot.report_if_current(first.epoch, || panic!("stale report")));
        assert!(slot.report_if_current(second.epoch, || {}));

        slot.clear();
        assert!(!slot.is_current(second.epoch));
    }

    #[test]
    fn slots_sharing_a_cursor_draw_disjoint_blocks() {
        let cpu_slot = JobSlot::default();
        let batch_slot = JobSlot::default();
        let (job, nonces) = fresh(test_job("shared", 10));
        cpu_slot.replace(job.clone(), nonces.clone());
        batch_slot.replace(job, nonces);

        let a = cpu_slot.current().unwrap().nonces.allocate(8);
        let b = batch_slot.current().unwrap().nonces.allocate(8);
        let c = cpu_slot.current().unwrap().nonces.allocate(8);
        assert_eq!((a, b, c), (0, 8, 16));
    }

    #[test]
    fn smoother_converges() {
        let mut smoother = RateSmoother::default();
        assert_eq!(smoother.update(100, Duration::from_secs(1)), 100.0);
        let mut rate = 0.0;
        for _ in 0..100 {
            rate = smoother.update(50, Duration::from_secs(1));
        }
        assert!((rate - 50.0).abs() < 0.01);
    }

    #[test]
    fn fractions_are_clamped() {
        assert_eq!(clamp_fraction(1.5), 1.0);
        assert_eq!(clamp_fraction(-0.1), 0.0);
        assert_eq!(clamp_fraction(f64::NAN), 0.0);
        assert_eq!(clamp_fraction(0.25), 0.25);
    }
}
