// src/network/pool.rs
//! Pool connection contract
//!
//! The coordinator never touches sockets. For each worker it asks a
//! [`PoolConnector`] for a [`PoolLink`]: a command channel into the
//! connection and an event channel out of it. How the connection runs
//! (async runtime, threads, an in-process fake) is the connector's business.

use crate::miner::job::Job;
use crate::miner::worker::Worker;
use crate::types::Hash;
use crate::utils::error::MinerError;
use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

/// Reply to a raw pool command
pub type CommandReply = oneshot::Sender<Result<Value, MinerError>>;

/// Requests sent into a pool connection
#[derive(Debug)]
pub enum PoolCommand {
    /// Submit a qualifying result
    Submit {
        /// Job the nonce belongs to
        job_id: String,
        /// Winning nonce
        nonce: u32,
        /// Resulting hash
        hash: Hash,
        /// Difficulty credited if accepted, echoed back in the reply event
        difficulty: u64,
    },
    /// Send an arbitrary protocol command and await its result
    Call {
        /// Protocol method
        method: String,
        /// Method parameters
        params: Value,
        /// Where the pool's answer goes
        reply: CommandReply,
    },
    /// Close the connection; the event channel disconnects afterwards
    Close,
}

/// Notifications coming out of a pool connection
#[derive(Debug)]
pub enum PoolEvent {
    /// Logged in (again)
    Connected,
    /// The pool assigned new work
    NewJob(Job),
    /// A submitted result was acknowledged
    ShareAccepted {
        /// Difficulty of the accepted result
        difficulty: u64,
    },
    /// A submitted result was refused
    ShareRejected {
        /// Reason given by the pool
        reason: String,
    },
    /// The pool reports a block found on its side
    BlockFound,
    /// The pool answered a keepalive; the session is healthy but idle
    KeepAlive,
    /// A pool-initiated command the coordinator does not act on
    Notice {
        /// Protocol method
        method: String,
        /// Method parameters
        params: Value,
    },
    /// The connection failed; it may recover with a later `Connected`
    Error(MinerError),
}

/// Both ends of one live pool connection as seen by the coordinator
#[derive(Debug)]
pub struct PoolLink {
    /// Commands into the connection
    pub commands: mpsc::UnboundedSender<PoolCommand>,
    /// Events out of the connection; disconnects when the link is gone
    pub events: Receiver<PoolEvent>,
}

impl PoolLink {
    /// Queues a result submission
    pub fn submit(&self, job_id: &str, nonce: u32, hash: Hash, difficulty: u64) -> Result<(), MinerError> {
        self.send(PoolCommand::Submit {
            job_id: job_id.to_string(),
            nonce,
            hash,
            difficulty,
        })
    }

    /// Sends a raw command; the answer arrives on the returned receiver
    pub fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<oneshot::Receiver<Result<Value, MinerError>>, MinerError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::Call {
            method: method.to_string(),
            params,
            reply,
        })?;
        Ok(rx)
    }

    /// Asks the connection to shut down
    pub fn close(&self) {
        let _ = self.commands.send(PoolCommand::Close);
    }

    fn send(&self, command: PoolCommand) -> Result<(), MinerError> {
        self.commands
            .send(command)
            .map_err(|_| MinerError::ChannelError("Pool connection is closed".into()))
    }
}

/// Opens pool connections for workers
pub trait PoolConnector: Send + Sync {
    /// Connects `worker`'s account and returns its link
    ///
    /// Returning an error means the worker is unusable for this session.
    fn open(&self, worker: &Worker) -> Result<PoolLink, MinerError>;
}

/// A result received by a [`LoopbackPool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Worker the result was submitted for
    pub worker: String,
    /// Job identifier
    pub job_id: String,
    /// Nonce
    pub nonce: u32,
    /// Hash
    pub hash: Hash,
}

#[derive(Default)]
struct LoopbackState {
    jobs: HashMap<String, Job>,
    links: HashMap<String, Sender<PoolEvent>>,
    submissions: Vec<Submission>,
    refused: Vec<String>,
    reject_all: bool,
}

/// In-process pool for tests and dry runs
///
/// Hands out preset jobs on connect, records every submission and accepts
/// it unless told to reject. Jobs and events can be injected at any time.
#[derive(Clone, Default)]
pub struct LoopbackPool {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackPool {
    /// Empty pool that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Job sent to `worker` when it connects
    pub fn set_initial_job(&self, worker: &str, job: Job) {
        self.state().jobs.insert(worker.to_string(), job);
    }

    /// Refuse `open` for `worker`
    pub fn refuse(&self, worker: &str) {
        self.state().refused.push(worker.to_string());
    }

    /// Reject every submission from now on
    pub fn reject_all(&self, reject: bool) {
        self.state().reject_all = reject;
    }

    /// Pushes an event to a connected worker; false if not connected
    pub fn push(&self, worker: &str, event: PoolEvent) -> bool {
        match self.state().links.get(worker) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Pushes a new job to a connected worker
    pub fn push_job(&self, worker: &str, job: Job) -> bool {
        self.push(worker, PoolEvent::NewJob(job))
    }

    /// Drops the worker's connection as if the pool went away
    pub fn disconnect(&self, worker: &str) {
        self.state().links.remove(worker);
    }

    /// Every submission received so far
    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    /// True while `worker` holds an open link
    pub fn is_connected(&self, worker: &str) -> bool {
        self.state().links.contains_key(worker)
    }
}

impl PoolConnector for LoopbackPool {
    fn open(&self, worker: &Worker) -> Result<PoolLink, MinerError> {
        let id = worker.identifier.clone();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        {
            let mut state = self.state();
            if state.refused.contains(&id) {
                return Err(MinerError::ConnectionError(format!("{} refused by loopback pool", id)));
            }
            let _ = event_tx.send(PoolEvent::Connected);
            if let Some(job) = state.jobs.get(&id) {
                let _ = event_tx.send(PoolEvent::NewJob(job.clone()));
            }
            state.links.insert(id.clone(), event_tx);
        }

        let pool = self.clone();
        std::thread::Builder::new()
            .name(format!("loopback-{}", id))
            .spawn(move || {
                while let Some(command) = cmd_rx.blocking_recv() {
                    match command {
                        PoolCommand::Submit {
                            job_id,
                            nonce,
                            hash,
                            difficulty,
                        } => {
                            let mut state = pool.state();
                            state.submissions.push(Submission {
                                worker: id.clone(),
                                job_id,
                                nonce,
                                hash,
                            });
                            let reply = if state.reject_all {
                                PoolEvent::ShareRejected {
                                    reason: "Low difficulty share".into(),
                                }
                            } else {
                                PoolEvent::ShareAccepted { difficulty }
                            };
                            if let Some(tx) = state.links.get(&id) {
                                let _ = tx.send(reply);
                            }
                        }
                        PoolCommand::Call { method, reply, .. } => {
                            let _ = reply.send(Ok(Value::String(format!("{} ok", method))));
                        }
                        PoolCommand::Close => break,
                    }
                }
                pool.disconnect(&id);
            })
            .map_err(|e| MinerError::ResourceError(format!("Failed to spawn loopback link: {}", e)))?;

        Ok(PoolLink {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}
