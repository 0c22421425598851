// src/miner/coordinator.rs
//! Mining coordinator
//!
//! Owns the workers (pool accounts) and one backend per (worker, backend
//! kind) pairing. A dispatcher thread multiplexes backend results, pool
//! events, a rebalance tick and control messages; it forwards jobs to the
//! worker's own backends, submits results through the worker's link and
//! keeps capacity split by weight across the workers that can use it.
//!
//! Session lifecycle: `Idle -> Starting -> Running -> Stopping -> Idle`.

use crate::miner::algorithm::Algorithm;
use crate::miner::backend::{
    Backend, BackendEvent, BackendKind, BackendOptions, BatchBackend, CpuBackend, FoundResult,
    ResultSink,
};
use crate::miner::job::Job;
use crate::miner::nonce::NonceAllocator;
use crate::miner::scheduler::{Assignment, Scheduler, WorkerSlot};
use crate::miner::worker::Worker;
use crate::network::pool::{PoolConnector, PoolEvent, PoolLink};
use crate::stats::counters::{MiningStats, ShareCounters, ShareResult};
use crate::utils::error::MinerError;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Select, Sender};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lifecycle of a mining session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    Idle,
    /// Links and backends are being brought up
    Starting,
    /// Hashing
    Running,
    /// Backends are being joined
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Notifications for the owner of the coordinator
#[derive(Debug)]
pub enum MinerEvent {
    /// A pool accepted a result
    AcceptedResult {
        /// Difficulty credited for the result
        difficulty: u64,
        /// Worker the result was submitted for
        worker_id: String,
    },
    /// A worker's job difficulty changed
    DifficultyChanged {
        /// New difficulty
        difficulty: u64,
        /// Affected worker
        worker_id: String,
    },
    /// A pool announced a block
    BlockFound {
        /// Worker whose pool found it
        worker_id: String,
    },
    /// Something went wrong
    MiningError {
        /// Cause
        error: MinerError,
        /// Worker involved, if any
        worker_id: Option<String>,
        /// True when the session ended because of it
        stopped: bool,
    },
}

/// Session-level tuning
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Fraction of the CPU to use
    pub cpu_limit: f64,
    /// Fraction of the batch resource to use
    pub batch_limit: f64,
    /// Settings for CPU backends
    pub cpu: BackendOptions,
    /// Settings for batch backends
    pub batch: BackendOptions,
    /// A worker without pool activity for this long loses its capacity
    pub stall_timeout: Duration,
    /// How often eligibility is re-evaluated
    pub rebalance_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            cpu_limit: 1.0,
            batch_limit: 0.0,
            cpu: BackendOptions::default(),
            batch: BackendOptions::default(),
            stall_timeout: Duration::from_secs(300),
            rebalance_interval: Duration::from_secs(1),
        }
    }
}

/// A backend bound to the worker it hashes for
struct Pairing {
    worker: usize,
    kind: BackendKind,
    backend: Box<dyn Backend>,
}

enum Control {
    SetLimit(BackendKind, f64),
    Stop,
}

struct Session {
    control: Sender<Control>,
    dispatcher: JoinHandle<()>,
    pairings: Arc<Vec<Pairing>>,
}

/// State shared between the coordinator handle and its dispatcher
struct Shared {
    state: Mutex<SessionState>,
    assignment: ArcSwap<Assignment>,
    counters: ArcSwap<ShareCounters>,
    events: Sender<MinerEvent>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MinerEvent) {
        if self.events.send(event).is_err() {
            log::trace!("No listener for miner events");
        }
    }
}

/// Coordinates workers, backends and pool links for one session at a time
pub struct MiningCoordinator {
    workers: Mutex<Vec<Worker>>,
    engine: Arc<dyn Algorithm>,
    connector: Arc<dyn PoolConnector>,
    options: Mutex<CoordinatorOptions>,
    shared: Arc<Shared>,
    events: Receiver<MinerEvent>,
    session: Mutex<Option<Session>>,
}

impl MiningCoordinator {
    /// Creates an idle coordinator
    ///
    /// # Arguments
    /// * `workers` - Pool accounts to mine for
    /// * `engine` - Hash engine shared by every backend
    /// * `connector` - Opens one pool link per worker
    /// * `options` - Capacity limits and backend settings
    pub fn new(
        workers: Vec<Worker>,
        engine: Arc<dyn Algorithm>,
        connector: Arc<dyn PoolConnector>,
        options: CoordinatorOptions,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        MiningCoordinator {
            workers: Mutex::new(workers),
            engine,
            connector,
            options: Mutex::new(options),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Idle),
                assignment: ArcSwap::from_pointee(Assignment::default()),
                counters: ArcSwap::from_pointee(ShareCounters::default()),
                events: tx,
            }),
            events: rx,
            session: Mutex::new(None),
        }
    }

    /// Receiver of [`MinerEvent`]s; clones share one queue
    pub fn events(&self) -> Receiver<MinerEvent> {
        self.events.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.shared.state()
    }

    /// True while a session is running
    pub fn is_mining(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Replaces the worker list; only allowed while idle
    pub fn set_workers(&self, workers: Vec<Worker>) -> Result<(), MinerError> {
        let state = self.shared.state();
        if *state != SessionState::Idle {
            return Err(MinerError::SessionError(format!(
                "Cannot change workers while {}",
                *state
            )));
        }
        *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = workers;
        Ok(())
    }

    /// Configured workers
    pub fn workers(&self) -> Vec<Worker> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Changes the CPU capacity limit, live if a session runs
    pub fn set_cpu_limit(&self, limit: f64) {
        self.set_limit(BackendKind::Cpu, limit);
    }

    /// Changes the batch capacity limit, live if a session runs
    pub fn set_batch_limit(&self, limit: f64) {
        self.set_limit(BackendKind::Batch, limit);
    }

    fn set_limit(&self, kind: BackendKind, limit: f64) {
        {
            let mut options = self.options.lock().unwrap_or_else(PoisonError::into_inner);
            match kind {
                BackendKind::Cpu => options.cpu_limit = limit,
                BackendKind::Batch => options.batch_limit = limit,
            }
        }
        if let Some(session) = self.session.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if let Err(e) = session.control.send(Control::SetLimit(kind, limit)) {
                log::debug!("Dispatcher gone, {} limit applies to the next session: {}", kind, e);
            }
        }
    }

    /// Sum of all backend hash rates (H/s)
    pub fn hash_rate(&self) -> f64 {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.pairings.iter().map(|p| p.backend.hash_rate()).sum())
            .unwrap_or(0.0)
    }

    /// Hash rate per worker identifier
    pub fn worker_hash_rates(&self) -> Vec<(String, f64)> {
        let workers = self.workers();
        let mut rates = vec![0.0; workers.len()];
        if let Some(session) = self.session.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            for pairing in session.pairings.iter() {
                if let Some(rate) = rates.get_mut(pairing.worker) {
                    *rate += pairing.backend.hash_rate();
                }
            }
        }
        workers.into_iter().map(|w| w.identifier).zip(rates).collect()
    }

    /// Capacity currently assigned to each (worker, kind) pairing
    pub fn assignment(&self) -> Assignment {
        Assignment::clone(&self.shared.assignment.load())
    }

    /// Counters of the current (or last) session
    pub fn stats(&self) -> MiningStats {
        self.shared.counters.load().snapshot(self.hash_rate())
    }

    /// Starts a session
    ///
    /// Opens a pool link per worker and starts every backend at zero
    /// capacity; capacity is handed out as jobs arrive.
    ///
    /// # Errors
    /// `SessionError` if a session is already starting or running, or no
    /// worker could be connected; `ConfigError` for invalid workers.
    pub fn start_mining(&self) -> Result<(), MinerError> {
        {
            let mut state = self.shared.state();
            if *state != SessionState::Idle {
                let error = MinerError::SessionError(format!("Mining is already {}", *state));
                log::warn!("{}", error);
                return Err(error);
            }
            *state = SessionState::Starting;
        }
        self.reap_finished_session();

        match self.launch() {
            Ok(session) => {
                *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
                let mut state = self.shared.state();
                // The dispatcher may already have ended the session
                if *state == SessionState::Starting {
                    *state = SessionState::Running;
                }
                log::info!("Mining started");
                Ok(())
            }
            Err(e) => {
                *self.shared.state() = SessionState::Idle;
                log::error!("Failed to start mining: {}", e);
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<Session, MinerError> {
        let workers = self.workers();
        let options = self.options.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if workers.is_empty() {
            return Err(MinerError::SessionError("No workers configured".into()));
        }
        let mut ids = HashSet::new();
        for worker in &workers {
            worker.validate()?;
            if !ids.insert(worker.identifier.as_str()) {
                return Err(MinerError::ConfigError(format!(
                    "Duplicate worker identifier {}",
                    worker.identifier
                )));
            }
        }
        let scheduler = Scheduler::new(options.cpu_limit, options.batch_limit);

        let mut links = Vec::with_capacity(workers.len());
        for worker in &workers {
            match self.connector.open(worker) {
                Ok(link) => {
                    log::info!("Worker {}: connecting to {}", worker.identifier, worker.endpoint());
                    links.push(Some(link));
                }
                Err(e) => {
                    log::error!("Worker {}: {}", worker.identifier, e);
                    self.shared.emit(MinerEvent::MiningError {
                        error: e,
                        worker_id: Some(worker.identifier.clone()),
                        stopped: false,
                    });
                    links.push(None);
                }
            }
        }
        if links.iter().all(Option::is_none) {
            return Err(MinerError::SessionError("No worker could be connected".into()));
        }

        let (backend_tx, backend_rx) = crossbeam_channel::unbounded();
        let mut pairings = Vec::new();
        for (index, _) in workers.iter().enumerate() {
            for kind in [BackendKind::Cpu, BackendKind::Batch] {
                let sink = ResultSink::new(pairings.len(), backend_tx.clone());
                let backend: Box<dyn Backend> = match kind {
                    BackendKind::Cpu => Box::new(CpuBackend::new(self.engine.clone(), sink, options.cpu.clone())),
                    BackendKind::Batch => {
                        Box::new(BatchBackend::new(self.engine.clone(), sink, options.batch.clone()))
                    }
                };
                pairings.push(Pairing {
                    worker: index,
                    kind,
                    backend,
                });
            }
        }
        let pairings = Arc::new(pairings);
        for pairing in pairings.iter() {
            if let Err(e) = pairing.backend.start() {
                pairings.iter().for_each(|p| p.backend.stop());
                links.iter().flatten().for_each(PoolLink::close);
                return Err(e);
            }
        }

        self.shared.counters.store(Arc::new(ShareCounters::default()));
        self.shared.assignment.store(Arc::new(Assignment::default()));
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let dispatcher = Dispatcher {
            workers: workers
                .into_iter()
                .zip(links)
                .map(|(worker, link)| WorkerState::new(worker, link))
                .collect(),
            pairings: pairings.clone(),
            scheduler,
            excluded: HashSet::new(),
            assignment: Assignment::default(),
            backend_rx,
            _backend_tx: backend_tx,
            control_rx,
            shared: self.shared.clone(),
            stall_timeout: options.stall_timeout,
            rebalance_interval: options.rebalance_interval,
        };
        let handle = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || dispatcher.run());
        let dispatcher = match handle {
            Ok(handle) => handle,
            Err(e) => {
                pairings.iter().for_each(|p| p.backend.stop());
                return Err(MinerError::ResourceError(format!("Failed to spawn dispatcher: {}", e)));
            }
        };

        Ok(Session {
            control: control_tx,
            dispatcher,
            pairings,
        })
    }

    /// Joins a session the dispatcher ended on its own
    fn reap_finished_session(&self) {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(session) = session {
            if session.control.send(Control::Stop).is_err() {
                log::debug!("Dispatcher already ended the session");
            }
            if session.dispatcher.join().is_err() {
                log::error!("Dispatcher panicked");
            }
        }
    }

    /// Stops the session and waits until every hashing thread has exited
    pub fn stop_mining(&self) {
        {
            let mut state = self.shared.state();
            match *state {
                SessionState::Idle | SessionState::Stopping => {
                    drop(state);
                    self.reap_finished_session();
                    return;
                }
                _ => *state = SessionState::Stopping,
            }
        }
        log::info!("Stopping mining");
        self.reap_finished_session();
        *self.shared.state() = SessionState::Idle;
        log::info!("Mining stopped");
    }
}

impl Drop for MiningCoordinator {
    fn drop(&mut self) {
        self.stop_mining();
    }
}

/// Per-worker view held by the dispatcher
struct WorkerState {
    worker: Worker,
    link: Option<PoolLink>,
    job: Option<Arc<Job>>,
    healthy: bool,
    stalled: bool,
    last_activity: Instant,
    submitted: HashSet<u32>,
}

impl WorkerState {
    fn new(worker: Worker, link: Option<PoolLink>) -> Self {
        WorkerState {
            worker,
            link,
            job: None,
            healthy: false,
            stalled: false,
            last_activity: Instant::now(),
            submitted: HashSet::new(),
        }
    }

    fn eligible(&self) -> bool {
        self.link.is_some() && self.healthy && !self.stalled && self.job.is_some()
    }

    fn id(&self) -> String {
        self.worker.identifier.clone()
    }
}

enum Input {
    Backend(BackendEvent),
    Pool(usize, PoolEvent),
    PoolClosed(usize),
    Control(Control),
    Tick,
}

struct Dispatcher {
    workers: Vec<WorkerState>,
    pairings: Arc<Vec<Pairing>>,
    scheduler: Scheduler,
    excluded: HashSet<(usize, BackendKind)>,
    assignment: Assignment,
    backend_rx: Receiver<BackendEvent>,
    _backend_tx: Sender<BackendEvent>,
    control_rx: Receiver<Control>,
    shared: Arc<Shared>,
    stall_timeout: Duration,
    rebalance_interval: Duration,
}

impl Dispatcher {
    fn run(mut self) {
        let ticker = crossbeam_channel::tick(self.rebalance_interval);
        let stopped_by_owner = loop {
            match self.next_input(&ticker) {
                Input::Backend(BackendEvent::Found(found)) => self.on_found(found),
                Input::Backend(BackendEvent::Failed { backend, error }) => self.on_backend_failed(backend, error),
                Input::Pool(index, event) => self.on_pool_event(index, event),
                Input::PoolClosed(index) => {
                    self.on_link_closed(index);
                    if self.workers.iter().all(|w| w.link.is_none()) {
                        break false;
                    }
                }
                Input::Control(Control::SetLimit(kind, limit)) => {
                    self.scheduler.set_limit(kind, limit);
                    log::info!("{} capacity limit set to {:.2}", kind, self.scheduler.limit(kind));
                    self.rebalance();
                }
                Input::Control(Control::Stop) => break true,
                Input::Tick => self.on_tick(),
            }
        };
        self.teardown();

        if !stopped_by_owner {
            let error = MinerError::SessionError("No pool connection remains".into());
            log::error!("{}; mining stopped", error);
            {
                let mut state = self.shared.state();
                if matches!(*state, SessionState::Running | SessionState::Starting) {
                    *state = SessionState::Idle;
                }
            }
            self.shared.emit(MinerEvent::MiningError {
                error,
                worker_id: None,
                stopped: true,
            });
        }
    }

    fn next_input(&self, ticker: &Receiver<Instant>) -> Input {
        let mut select = Select::new();
        let backend_op = select.recv(&self.backend_rx);
        let control_op = select.recv(&self.control_rx);
        let tick_op = select.recv(ticker);
        let mut links = Vec::new();
        for (index, state) in self.workers.iter().enumerate() {
            if let Some(link) = &state.link {
                links.push((select.recv(&link.events), index, &link.events));
            }
        }

        let op = select.select();
        let chosen = op.index();
        if chosen == backend_op {
            match op.recv(&self.backend_rx) {
                Ok(event) => Input::Backend(event),
                Err(_) => Input::Control(Control::Stop),
            }
        } else if chosen == control_op {
            match op.recv(&self.control_rx) {
                Ok(control) => Input::Control(control),
                Err(_) => Input::Control(Control::Stop),
            }
        } else if chosen == tick_op {
            let _ = op.recv(ticker);
            Input::Tick
        } else {
            match links.iter().find(|(op_index, _, _)| *op_index == chosen) {
                Some((_, index, events)) => match op.recv(events) {
                    Ok(event) => Input::Pool(*index, event),
                    Err(_) => Input::PoolClosed(*index),
                },
                None => Input::Tick,
            }
        }
    }

    fn on_found(&mut self, found: FoundResult) {
        let Some(pairing) = self.pairings.get(found.backend) else {
            return;
        };
        let worker = &mut self.workers[pairing.worker];

        let Some(job) = worker.job.as_ref().filter(|job| job.job_id == found.job_id) else {
            log::debug!(
                "Worker {}: dropping result for superseded job {}",
                worker.worker.identifier,
                found.job_id
            );
            return;
        };
        if !worker.submitted.insert(found.nonce) {
            log::debug!("Worker {}: duplicate nonce {:08x}", worker.worker.identifier, found.nonce);
            return;
        }
        let Some(link) = worker.link.as_ref() else {
            return;
        };
        self.shared.counters.load().record(ShareResult::Found);

        log::info!(
            "Worker {}: submitting nonce {:08x} for job {} ({} backend)",
            worker.worker.identifier,
            found.nonce,
            found.job_id,
            pairing.kind
        );
        match link.submit(&found.job_id, found.nonce, found.hash, job.difficulty) {
            Ok(()) => self.shared.counters.load().record(ShareResult::Submitted),
            Err(e) => log::warn!("Worker {}: {}", worker.worker.identifier, e),
        }
    }

    fn on_backend_failed(&mut self, backend: usize, error: MinerError) {
        let Some(pairing) = self.pairings.get(backend) else {
            return;
        };
        if !self.excluded.insert((pairing.worker, pairing.kind)) {
            return;
        }
        let worker_id = self.workers[pairing.worker].id();
        log::error!(
            "Worker {}: {} backend failed, excluding it: {}",
            worker_id,
            pairing.kind,
            error
        );
        pairing.backend.stop();
        self.shared.emit(MinerEvent::MiningError {
            error,
            worker_id: Some(worker_id),
            stopped: false,
        });
        self.rebalance();
    }

    fn on_pool_event(&mut self, index: usize, event: PoolEvent) {
        let worker = &mut self.workers[index];
        worker.last_activity = Instant::now();
        if worker.stalled {
            log::info!("Worker {}: pool active again", worker.worker.identifier);
            worker.stalled = false;
        }

        match event {
            PoolEvent::Connected => {
                log::info!("Worker {}: logged in", worker.worker.identifier);
                worker.healthy = true;
            }
            PoolEvent::NewJob(job) => self.on_new_job(index, job),
            PoolEvent::ShareAccepted { difficulty } => {
                log::info!("Worker {}: result accepted (difficulty {})", worker.worker.identifier, difficulty);
                self.shared.counters.load().record(ShareResult::Accepted);
                let worker_id = worker.id();
                self.shared.emit(MinerEvent::AcceptedResult { difficulty, worker_id });
            }
            PoolEvent::ShareRejected { reason } => {
                log::warn!("Worker {}: result rejected: {}", worker.worker.identifier, reason);
                self.shared.counters.load().record(ShareResult::Rejected);
                let worker_id = Some(worker.id());
                self.shared.emit(MinerEvent::MiningError {
                    error: MinerError::ShareRejected(reason),
                    worker_id,
                    stopped: false,
                });
            }
            PoolEvent::BlockFound => {
                log::info!("Worker {}: block found", worker.worker.identifier);
                self.shared.counters.load().record(ShareResult::Block);
                let worker_id = worker.id();
                self.shared.emit(MinerEvent::BlockFound { worker_id });
            }
            PoolEvent::KeepAlive => {
                log::trace!("Worker {}: keepalive answered", worker.worker.identifier);
            }
            PoolEvent::Notice { method, params } => {
                log::debug!("Worker {}: pool notice {} {}", worker.worker.identifier, method, params);
            }
            PoolEvent::Error(error) => {
                log::warn!("Worker {}: {}", worker.worker.identifier, error);
                worker.healthy = false;
                let worker_id = Some(worker.id());
                self.drop_job(index);
                self.shared.emit(MinerEvent::MiningError {
                    error,
                    worker_id,
                    stopped: false,
                });
                self.rebalance();
            }
        }
    }

    fn on_new_job(&mut self, index: usize, job: Job) {
        let worker = &mut self.workers[index];
        if let Err(e) = job.validate() {
            log::error!("Worker {}: rejecting job: {}", worker.worker.identifier, e);
            let worker_id = Some(worker.id());
            self.drop_job(index);
            self.shared.emit(MinerEvent::MiningError {
                error: e,
                worker_id,
                stopped: false,
            });
            self.rebalance();
            return;
        }

        worker.healthy = true;
        let previous = worker.job.as_ref().map(|j| j.difficulty);
        let job = Arc::new(job);
        log::info!(
            "Worker {}: new job {} ({}, difficulty {})",
            worker.worker.identifier,
            job.job_id,
            job.version,
            job.difficulty
        );
        worker.job = Some(job.clone());
        worker.submitted.clear();
        if previous != Some(job.difficulty) {
            let worker_id = worker.id();
            self.shared.emit(MinerEvent::DifficultyChanged {
                difficulty: job.difficulty,
                worker_id,
            });
        }

        let nonces = Arc::new(NonceAllocator::for_job(&job));
        for pairing in self.pairings.iter().filter(|p| p.worker == index) {
            pairing.backend.set_job(job.clone(), nonces.clone());
        }
        self.rebalance();
    }

    fn on_link_closed(&mut self, index: usize) {
        let worker = &mut self.workers[index];
        log::warn!("Worker {}: pool link closed", worker.worker.identifier);
        worker.link = None;
        worker.healthy = false;
        self.drop_job(index);
        self.rebalance();
    }

    /// Marks quiet workers as stalled
    ///
    /// The last eligible worker is never stalled: its capacity would have
    /// nowhere else to go.
    fn on_tick(&mut self) {
        let now = Instant::now();
        let mut eligible = self.workers.iter().filter(|w| w.eligible()).count();
        for state in &mut self.workers {
            if eligible > 1
                && state.eligible()
                && now.duration_since(state.last_activity) > self.stall_timeout
            {
                log::warn!(
                    "Worker {}: no pool activity for {:?}, reassigning its capacity",
                    state.worker.identifier,
                    self.stall_timeout
                );
                state.stalled = true;
                eligible -= 1;
            }
        }
        self.rebalance();
    }

    fn drop_job(&mut self, index: usize) {
        self.workers[index].job = None;
        self.workers[index].submitted.clear();
        for pairing in self.pairings.iter().filter(|p| p.worker == index) {
            pairing.backend.clear_job();
        }
    }

    /// Recomputes the weighted split and applies it if it changed
    fn rebalance(&mut self) {
        let slots: Vec<WorkerSlot> = self
            .workers
            .iter()
            .map(|w| WorkerSlot {
                weight: w.worker.weight,
                eligible: w.eligible(),
            })
            .collect();
        let assignment = self.scheduler.assign(&slots, &self.excluded);
        if assignment == self.assignment {
            return;
        }

        let mut summary = HashMap::new();
        for pairing in self.pairings.iter() {
            if self.excluded.contains(&(pairing.worker, pairing.kind)) {
                continue;
            }
            let fraction = assignment.fraction(pairing.worker, pairing.kind);
            pairing.backend.set_capacity_limit(fraction);
            *summary.entry(pairing.worker).or_insert(0.0) += fraction;
        }
        for (index, state) in self.workers.iter().enumerate() {
            log::info!(
                "Worker {}: capacity {:.3}",
                state.worker.identifier,
                summary.get(&index).copied().unwrap_or(0.0)
            );
        }
        self.shared.assignment.store(Arc::new(assignment.clone()));
        self.assignment = assignment;
    }

    fn teardown(&mut self) {
        for pairing in self.pairings.iter() {
            pairing.backend.stop();
        }
        for state in &mut self.workers {
            if let Some(link) = state.link.take() {
                link.close();
            }
            state.job = None;
        }
        self.shared.assignment.store(Arc::new(Assignment::default()));
    }
}
