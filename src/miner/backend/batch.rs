// src/miner/backend/batch.rs
//! Batched hashing backend
//!
//! Stands in for accelerator devices: a single driver thread reserves a
//! batch of nonces per dispatch and fans it out over a dedicated rayon pool,
//! one lane per pool thread, each lane with its own scratchpad. Capacity
//! scales the driver's duty cycle; a limit of zero parks the driver.

use super::{
    clamp_fraction, throttle, Backend, BackendKind, BackendOptions, JobSlot, RateSlot,
    RateSmoother, ResultSink,
};
use crate::miner::algorithm::{Algorithm, Scratchpad};
use crate::miner::job::Job;
use crate::miner::nonce::NonceAllocator;
use crate::types::Hash;
use crate::utils::error::MinerError;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

struct Shared {
    engine: Arc<dyn Algorithm>,
    slot: JobSlot,
    sink: ResultSink,
    duty: AtomicU64,
    rate: RateSlot,
    options: BackendOptions,
}

struct Driver {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Backend hashing nonce batches on a compute pool
pub struct BatchBackend {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
    limit: Mutex<f64>,
    running: AtomicBool,
}

/// Outcome of one lane of a batch
#[derive(Default)]
struct LaneOutcome {
    hashed: u64,
    found: Vec<(u32, Hash)>,
    error: Option<MinerError>,
}

impl BatchBackend {
    /// Creates a stopped backend
    ///
    /// `options.max_threads` is the number of lanes per batch.
    pub fn new(engine: Arc<dyn Algorithm>, sink: ResultSink, options: BackendOptions) -> Self {
        BatchBackend {
            shared: Arc::new(Shared {
                engine,
                slot: JobSlot::default(),
                sink,
                duty: AtomicU64::new(0f64.to_bits()),
                rate: RateSlot::default(),
                options,
            }),
            driver: Mutex::new(None),
            limit: Mutex::new(0.0),
            running: AtomicBool::new(false),
        }
    }

    /// True while the driver thread is alive
    pub fn is_dispatching(&self) -> bool {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn apply_plan(&self) -> Result<(), MinerError> {
        let limit = self.capacity_limit();
        self.shared.duty.store(limit.to_bits(), Ordering::Relaxed);

        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        match (limit > 0.0, driver.is_some()) {
            (true, false) => {
                let stop = Arc::new(AtomicBool::new(false));
                let handle = {
                    let shared = self.shared.clone();
                    let stop = stop.clone();
                    thread::Builder::new()
                        .name(format!("batch-{}", shared.sink.backend()))
                        .spawn(move || drive(shared, stop))
                        .map_err(|e| {
                            MinerError::ResourceError(format!("Failed to spawn batch driver: {}", e))
                        })?
                };
                *driver = Some(Driver { stop, handle });
            }
            (false, true) => {
                if let Some(old) = driver.take() {
                    halt(old);
                }
                self.shared.rate.store(0.0);
            }
            _ => {}
        }
        Ok(())
    }
}

fn halt(driver: Driver) {
    driver.stop.store(true, Ordering::Relaxed);
    if driver.handle.join().is_err() {
        log::error!("Batch driver panicked");
    }
}

/// Driver thread: allocates the lane scratchpads, then dispatches batches
/// until stopped
fn drive(shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    let lanes = shared.options.max_threads.max(1);
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(lanes)
        .thread_name({
            let id = shared.sink.backend();
            move |i| format!("batch-{}-lane-{}", id, i)
        })
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            let error = MinerError::ResourceError(format!("Failed to build batch pool: {}", e));
            log::error!("Backend {}: {}", shared.sink.backend(), error);
            shared.sink.failed(error);
            return;
        }
    };
    let mut scratch = Vec::with_capacity(lanes);
    for _ in 0..lanes {
        match Scratchpad::new() {
            Ok(pad) => scratch.push(pad),
            Err(e) => {
                log::error!("Backend {}: {}", shared.sink.backend(), e);
                shared.sink.failed(e);
                return;
            }
        }
    }

    let per_lane = shared.options.nonce_block;
    let mut smoother = RateSmoother::default();
    while !stop.load(Ordering::Relaxed) {
        let Some(active) = shared.slot.current() else {
            shared.rate.store(0.0);
            thread::sleep(shared.options.idle_wait);
            continue;
        };

        let started = Instant::now();
        let batch = active.nonces.allocate_block(per_lane.saturating_mul(lanes as u32));
        let outcomes: Vec<LaneOutcome> = pool.install(|| {
            scratch
                .par_iter_mut()
                .enumerate()
                .map(|(lane, pad)| {
                    let mut outcome = LaneOutcome::default();
                    let mut blob = active.job.blob.clone();
                    let nonces = batch.iter().skip(lane * per_lane as usize).take(per_lane as usize);
                    for nonce in nonces {
                        if stop.load(Ordering::Relaxed) || !shared.slot.is_current(active.epoch) {
                            break;
                        }
                        active.job.write_nonce(&mut blob, nonce);
                        match shared.engine.hash(&blob, active.job.version, pad) {
                            Ok(hash) => {
                                outcome.hashed += 1;
                                if hash.meets_target(active.job.target) {
                                    outcome.found.push((nonce, hash));
                                }
                            }
                            Err(e) => {
                                outcome.error = Some(e);
                                break;
                            }
                        }
                    }
                    outcome
                })
                .collect()
        });

        let mut hashed = 0;
        for outcome in outcomes {
            hashed += outcome.hashed;
            if let Some(e) = outcome.error {
                log::error!("Backend {}: hashing failed: {}", shared.sink.backend(), e);
                shared.sink.failed(e);
                shared.rate.store(0.0);
                return;
            }
            if !outcome.found.is_empty() {
                shared.slot.report_if_current(active.epoch, || {
                    for (nonce, hash) in &outcome.found {
                        shared.sink.found(&active.job.job_id, *nonce, *hash);
                    }
                });
            }
        }

        throttle(started.elapsed(), f64::from_bits(shared.duty.load(Ordering::Relaxed)), &stop);
        shared.rate.store(smoother.update(hashed, started.elapsed()));
    }
    shared.rate.store(0.0);
}

impl Backend for BatchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Batch
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
        if let Some(driver) = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take() {
            halt(driver);
        }
        self.shared.rate.store(0.0);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn hash_rate(&self) -> f64 {
        self.shared.rate.load()
    }
}

impl Drop for BatchBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::backend::CpuBackend;
    use crate::miner::backend::tests::{install, test_job, FastEngine};
    use crate::miner::backend::BackendEvent;
    use crossbeam_channel::unbounded;
    use std::collections::HashSet;
    use std::time::Duration;

    fn backend(lanes: usize) -> (BatchBackend, crossbeam_channel::Receiver<BackendEvent>) {
        let (tx, rx) = unbounded();
        let options = BackendOptions {
            nonce_block: 4,
            max_threads: lanes,
            idle_wait: Duration::from_millis(5),
        };
        (BatchBackend::new(Arc::new(FastEngine), ResultSink::new(9, tx), options), rx)
    }

    #[test]
    fn batches_report_distinct_qualifying_nonces() {
        let (batch, rx) = backend(3);
        let job = test_job("b1", u64::MAX / 3);
        batch.set_capacity_limit(1.0);
        install(&batch, job.clone());
        batch.start().unwrap();

        let mut seen = HashSet::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while seen.len() < 30 && Instant::now() < deadline {
            if let Ok(BackendEvent::Found(found)) = rx.recv_timeout(Duration::from_millis(100)) {
                assert_eq!(found.backend, 9);
                assert!(found.hash.meets_target(job.target));
                assert!(seen.insert(found.nonce));
            }
        }
        batch.stop();
        assert!(seen.len() >= 30);
    }

    #[test]
    fn zero_capacity_parks_driver() {
        let (batch, rx) = backend(2);
        install(&batch, test_job("b2", u64::MAX));
        batch.start().unwrap();
        assert!(!batch.is_dispatching());
        thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_err());

        batch.set_capacity_limit(0.5);
        assert!(batch.is_dispatching());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());

        batch.set_capacity_limit(0.0);
        assert!(!batch.is_dispatching());
        batch.stop();
    }

    #[test]
    fn swap_silences_previous_job() {
        let (batch, rx) = backend(2);
        batch.set_capacity_limit(1.0);
        install(&batch, test_job("first", u64::MAX / 2));
        batch.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        install(&batch, test_job("second", u64::MAX / 2));
        let _ = rx.try_iter().count();
        thread::sleep(Duration::from_millis(30));
        batch.stop();
        for event in rx.try_iter() {
            if let BackendEvent::Found(found) = event {
                assert_eq!(found.job_id, "second");
            }
        }
    }

    #[test]
    fn cpu_and_batch_on_one_job_never_hash_the_same_nonce() {
        let (tx, rx) = unbounded();
        let options = BackendOptions {
            nonce_block: 4,
            max_threads: 2,
            idle_wait: Duration::from_millis(5),
        };
        let cpu = CpuBackend::new(Arc::new(FastEngine), ResultSink::new(0, tx.clone()), options.clone());
        let batch = BatchBackend::new(Arc::new(FastEngine), ResultSink::new(1, tx), options);

        let job = test_job("both", u64::MAX);
        let nonces = Arc::new(NonceAllocator::for_job(&job));
        for backend in [&cpu as &dyn Backend, &batch] {
            backend.set_capacity_limit(1.0);
            backend.set_job(job.clone(), nonces.clone());
            backend.start().unwrap();
        }
        thread::sleep(Duration::from_millis(300));
        cpu.stop();
        batch.stop();

        let mut seen = HashSet::new();
        let mut per_backend = [0usize; 2];
        for event in rx.try_iter() {
            if let BackendEvent::Found(found) = event {
                per_backend[found.backend] += 1;
                assert!(seen.insert(found.nonce), "nonce {} hashed twice", found.nonce);
            }
        }
        assert!(per_backend[0] > 0 && per_backend[1] > 0);
    }
}
