// src/miner/backend/cpu.rs
//! CPU hashing backend
//!
//! Runs one OS thread per hashing worker. A capacity fraction `f` of a
//! machine with `n` threads available becomes `ceil(f * n)` threads, each
//! throttled to a duty cycle of `f * n / threads` so fractional capacity
//! is honoured exactly.

use super::{
    clamp_fraction, throttle, Backend, BackendKind, BackendOptions, JobSlot, RateSlot,
    RateSmoother, ResultSink,
};
use crate::miner::algorithm::{Algorithm, Scratchpad};
use crate::miner::job::Job;
use crate::miner::nonce::NonceAllocator;
use crate::utils::error::MinerError;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Thread count and per-thread duty cycle for a capacity fraction
///
/// # Arguments
/// * `fraction` - Share of the machine to use (0..=1)
/// * `max_threads` - Threads at full capacity
///
/// # Returns
/// `(threads, duty)`; `threads * duty == fraction * max_threads`
pub fn thread_plan(fraction: f64, max_threads: usize) -> (usize, f64) {
    let fraction = clamp_fraction(fraction);
    let budget = fraction * max_threads as f64;
    if budget <= 0.0 {
        return (0, 0.0);
    }
    let threads = (budget.ceil() as usize).clamp(1, max_threads.max(1));
    (threads, (budget / threads as f64).min(1.0))
}

struct Shared {
    engine: Arc<dyn Algorithm>,
    slot: JobSlot,
    sink: ResultSink,
    duty: AtomicU64,
    options: BackendOptions,
}

impl Shared {
    fn duty(&self) -> f64 {
        f64::from_bits(self.duty.load(Ordering::Relaxed))
    }
}

struct HashThread {
    stop: Arc<AtomicBool>,
    rate: Arc<RateSlot>,
    handle: JoinHandle<()>,
}

/// Backend hashing on CPU threads
pub struct CpuBackend {
    shared: Arc<Shared>,
    threads: Mutex<Vec<HashThread>>,
    rates: ArcSwap<Vec<Arc<RateSlot>>>,
    limit: Mutex<f64>,
    running: AtomicBool,
}

impl CpuBackend {
    /// Creates a stopped backend
    ///
    /// # Arguments
    /// * `engine` - Hash engine shared by all threads
    /// * `sink` - Where qualifying results and failures are sent
    /// * `options` - Block size, thread ceiling and idle poll interval
    pub fn new(engine: Arc<dyn Algorithm>, sink: ResultSink, options: BackendOptions) -> Self {
        CpuBackend {
            shared: Arc::new(Shared {
                engine,
                slot: JobSlot::default(),
                sink,
                duty: AtomicU64::new(0f64.to_bits()),
                options,
            }),
            threads: Mutex::new(Vec::new()),
            rates: ArcSwap::from_pointee(Vec::new()),
            limit: Mutex::new(0.0),
            running: AtomicBool::new(false),
        }
    }

    /// Number of live hashing threads
    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Grows or shrinks the thread set to match the capacity limit
    fn apply_plan(&self) -> Result<(), MinerError> {
        let limit = self.capacity_limit();
        let (target, duty) = thread_plan(limit, self.shared.options.max_threads);
        self.shared.duty.store(duty.to_bits(), Ordering::Relaxed);

        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if threads.len() > target {
            let surplus: Vec<HashThread> = threads.drain(target..).collect();
            self.publish_rates(&threads);
            join_all(surplus);
        }
        let mut spawned = Ok(());
        while threads.len() < target {
            let index = threads.len();
            match self.spawn(index) {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    spawned = Err(e);
                    break;
                }
            }
        }
        self.publish_rates(&threads);
        log::debug!(
            "Backend {}: {} cpu threads at {:.0}% duty",
            self.shared.sink.backend(),
            threads.len(),
            duty * 100.0
        );
        spawned
    }

    /// Makes the live threads' rate cells visible to `hash_rate`
    fn publish_rates(&self, threads: &[HashThread]) {
        self.rates
            .store(Arc::new(threads.iter().map(|t| t.rate.clone()).collect()));
    }

    fn spawn(&self, index: usize) -> Result<HashThread, MinerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let rate = Arc::new(RateSlot::default());
        let handle = {
            let shared = self.shared.clone();
            let stop = stop.clone();
            let rate = rate.clone();
            thread::Builder::new()
                .name(format!("cpu-{}-{}", shared.sink.backend(), index))
                .spawn(move || hash_loop(shared, stop, rate))
                .map_err(|e| MinerError::ResourceError(format!("Failed to spawn hashing thread: {}", e)))?
        };
        Ok(HashThread { stop, rate, handle })
    }
}

fn join_all(threads: Vec<HashThread>) {
    for thread in &threads {
        thread.stop.store(true, Ordering::Relaxed);
    }
    for thread in threads {
        if thread.handle.join().is_err() {
            log::error!("Hashing thread panicked");
        }
    }
}

/// Body of one hashing thread
///
/// Checks the stop flag and the job epoch once per nonce, so a stop or a
/// job swap costs at most one in-flight hash.
fn hash_loop(shared: Arc<Shared>, stop: Arc<AtomicBool>, rate: Arc<RateSlot>) {
    let mut scratch = match Scratchpad::new() {
        Ok(scratch) => scratch,
        Err(e) => {
            log::error!("Backend {}: {}", shared.sink.backend(), e);
            shared.sink.failed(e);
            return;
        }
    };
    let mut smoother = RateSmoother::default();
    let mut blob = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        let Some(active) = shared.slot.current() else {
            rate.store(0.0);
            thread::sleep(shared.options.idle_wait);
            continue;
        };

        let started = Instant::now();
        let block = active.nonces.allocate_block(shared.options.nonce_block);
        blob.clear();
        blob.extend_from_slice(&active.job.blob);

        let mut hashed = 0u64;
        for nonce in block.iter() {
            if stop.load(Ordering::Relaxed) || !shared.slot.is_current(active.epoch) {
                break;
            }
            active.job.write_nonce(&mut blob, nonce);
            match shared.engine.hash(&blob, active.job.version, &mut scratch) {
                Ok(hash) => {
                    hashed += 1;
                    if hash.meets_target(active.job.target) {
                        shared.slot.report_if_current(active.epoch, || {
                            shared.sink.found(&active.job.job_id, nonce, hash)
                        });
                    }
                }
                Err(e) => {
                    log::error!("Backend {}: hashing failed: {}", shared.sink.backend(), e);
                    shared.sink.failed(e);
                    rate.store(0.0);
                    return;
                }
            }
        }

        throttle(started.elapsed(), shared.duty(), &stop);
        rate.store(smoother.update(hashed, started.elapsed()));
    }
    rate.store(0.0);
}

impl Backend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn set_job(&self, job: Arc<Job>, nonces: Arc<NonceAllocator>) {
        self.shared.slot.replace(job, nonces);
    }

    fn clear_job(&self) {
        self.shared.slot.clear();
    }

    fn set_capacity_limit(&self, fraction: f64) {
        *self.limit.lock().unwrap_or_else(PoisonError::into_inner) = clamp_fraction(fraction);
        if self.is_running() {
            if let Err(e) = self.apply_plan() {
                log::error!("Backend {}: {}", self.shared.sink.backend(), e);
                self.shared.sink.failed(e);
            }
        }
    }

    fn capacity_limit(&self) -> f64 {
        *self.limit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self) -> Result<(), MinerError> {
        self.running.store(true, Ordering::SeqCst);
        self.apply_plan()
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let threads: Vec<HashThread> = {
            let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            self.rates.store(Arc::new(Vec::new()));
            threads.drain(..).collect()
        };
        join_all(threads);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn hash_rate(&self) -> f64 {
        self.rates.load().iter().map(|rate| rate.load()).sum()
    }
}

impl Drop for CpuBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::backend::tests::{install, test_job, FastEngine};
    use crate::miner::backend::BackendEvent;
    use crossbeam_channel::unbounded;
    use std::collections::HashSet;
    use std::time::Duration;

    fn backend(threads: usize) -> (CpuBackend, crossbeam_channel::Receiver<BackendEvent>) {
        let (tx, rx) = unbounded();
        let options = BackendOptions {
            nonce_block: 8,
            max_threads: threads,
            idle_wait: Duration::from_millis(5),
        };
        (CpuBackend::new(Arc::new(FastEngine), ResultSink::new(3, tx), options), rx)
    }

    #[test]
    fn thread_plan_conserves_capacity() {
        assert_eq!(thread_plan(0.0, 8), (0, 0.0));
        assert_eq!(thread_plan(1.0, 8), (8, 1.0));
        assert_eq!(thread_plan(0.5, 8), (4, 1.0));
        let (threads, duty) = thread_plan(0.3, 8);
        assert_eq!(threads, 3);
        assert!((threads as f64 * duty - 2.4).abs() < 1e-9);
        assert_eq!(thread_plan(2.0, 4), (4, 1.0));
    }

    #[test]
    fn every_qualifying_nonce_is_unique_and_valid() {
        let (cpu, rx) = backend(4);
        let job = test_job("j1", u64::MAX / 4);
        cpu.set_capacity_limit(1.0);
        install(&cpu, job.clone());
        cpu.start().unwrap();

        let mut seen = HashSet::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while seen.len() < 20 && Instant::now() < deadline {
            if let Ok(BackendEvent::Found(found)) = rx.recv_timeout(Duration::from_millis(100)) {
                assert_eq!(found.backend, 3);
                assert_eq!(found.job_id, "j1");
                assert!(found.hash.meets_target(job.target));
                assert!(seen.insert(found.nonce), "nonce {} reported twice", found.nonce);
            }
        }
        cpu.stop();
        assert!(seen.len() >= 20);
    }

    #[test]
    fn no_stale_results_after_job_swap() {
        let (cpu, rx) = backend(4);
        cpu.set_capacity_limit(1.0);
        install(&cpu, test_job("old", u64::MAX / 2));
        cpu.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        install(&cpu, test_job("new", u64::MAX / 2));
        let drained: Vec<_> = rx.try_iter().collect();
        assert!(!drained.is_empty());
        thread::sleep(Duration::from_millis(50));
        cpu.stop();

        for event in rx.try_iter() {
            if let BackendEvent::Found(found) = event {
                assert_eq!(found.job_id, "new");
            }
        }
    }

    #[test]
    fn stop_joins_every_thread_and_silences_backend() {
        let (cpu, rx) = backend(3);
        cpu.set_capacity_limit(1.0);
        install(&cpu, test_job("j", u64::MAX));
        cpu.start().unwrap();
        assert_eq!(cpu.thread_count(), 3);
        thread::sleep(Duration::from_millis(20));

        cpu.stop();
        assert!(!cpu.is_running());
        assert_eq!(cpu.thread_count(), 0);
        assert_eq!(cpu.hash_rate(), 0.0);
        let _ = rx.try_iter().count();
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn capacity_changes_resize_thread_set() {
        let (cpu, _rx) = backend(4);
        cpu.set_capacity_limit(0.25);
        cpu.start().unwrap();
        assert_eq!(cpu.thread_count(), 1);

        cpu.set_capacity_limit(1.0);
        assert_eq!(cpu.thread_count(), 4);

        cpu.set_capacity_limit(0.0);
        assert_eq!(cpu.thread_count(), 0);
        assert!(cpu.is_running());
        cpu.stop();
    }

    #[test]
    fn unmet_target_reports_nothing() {
        let (cpu, rx) = backend(2);
        cpu.set_capacity_limit(1.0);
        install(&cpu, test_job("hard", 1));
        cpu.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        cpu.stop();
        assert!(rx.try_recv().is_err());
    }

    /// Engine slow enough that joining a thread takes a while
    struct SlowEngine;

    impl Algorithm for SlowEngine {
        fn hash(
            &self,
            input: &[u8],
            version: crate::types::AlgorithmVersion,
            scratch: &mut Scratchpad,
        ) -> Result<crate::types::Hash, MinerError> {
            thread::sleep(Duration::from_millis(400));
            FastEngine.hash(input, version, scratch)
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[test]
    fn hash_rate_does_not_wait_for_threads_being_joined() {
        let (tx, _rx) = unbounded();
        let options = BackendOptions {
            nonce_block: 1,
            max_threads: 2,
            idle_wait: Duration::from_millis(5),
        };
        let cpu = Arc::new(CpuBackend::new(Arc::new(SlowEngine), ResultSink::new(0, tx), options));
        cpu.set_capacity_limit(1.0);
        install(cpu.as_ref(), test_job("slow", 1));
        cpu.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        let resizer = {
            let cpu = cpu.clone();
            thread::spawn(move || cpu.set_capacity_limit(0.5))
        };
        thread::sleep(Duration::from_millis(50));
        let asked = Instant::now();
        let _ = cpu.hash_rate();
        assert!(asked.elapsed() < Duration::from_millis(100));

        resizer.join().unwrap();
        assert_eq!(cpu.thread_count(), 1);
        cpu.stop();
    }
}
