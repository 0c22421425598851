// src/network/stratum.rs
//! Stratum pool client
//!
//! Line-delimited JSON-RPC over TCP as spoken by CryptoNote pools:
//! `login` returns a session id and the first job, `job` notifications
//! replace it, `submit` hands in results and `keepalived` keeps idle
//! sessions open. Each link runs as a task on the connector's runtime and
//! reconnects with exponential backoff until it runs out of attempts.

use crate::miner::job::Job;
use crate::miner::worker::Worker;
use crate::network::pool::{CommandReply, PoolCommand, PoolConnector, PoolEvent, PoolLink};
use crate::types::{AlgorithmVersion, Hash};
use crate::utils::error::MinerError;
use crossbeam_channel::Sender;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::time;

/// Timing and retry settings for stratum links
#[derive(Debug, Clone)]
pub struct StratumOptions {
    /// Limit on establishing the TCP connection
    pub connect_timeout: Duration,
    /// Interval between `keepalived` requests
    pub keepalive_interval: Duration,
    /// First reconnect delay; doubles per consecutive failure
    pub reconnect_delay: Duration,
    /// Consecutive failed connections before the link gives up
    pub max_reconnects: u32,
}

impl Default for StratumOptions {
    fn default() -> Self {
        StratumOptions {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(2),
            max_reconnects: 5,
        }
    }
}

/// Opens stratum links on a dedicated tokio runtime
pub struct StratumConnector {
    runtime: Runtime,
    options: StratumOptions,
}

impl StratumConnector {
    /// Builds the connector and its runtime
    pub fn new(options: StratumOptions) -> Result<Self, MinerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("stratum")
            .enable_all()
            .build()?;
        Ok(StratumConnector { runtime, options })
    }
}

impl PoolConnector for StratumConnector {
    fn open(&self, worker: &Worker) -> Result<PoolLink, MinerError> {
        if worker.secure {
            return Err(MinerError::ConfigError(format!(
                "Worker {}: TLS pool connections are not supported",
                worker.identifier
            )));
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        self.runtime
            .spawn(run_link(worker.clone(), self.options.clone(), cmd_rx, event_tx));
        Ok(PoolLink {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}

/// How a connected session ended
enum SessionEnd {
    /// Close requested or coordinator gone
    Closed,
    /// Connection lost after a successful login
    Lost(MinerError),
}

/// Connection loop of one link: connect, serve, back off, repeat
async fn run_link(
    worker: Worker,
    options: StratumOptions,
    mut commands: mpsc::UnboundedReceiver<PoolCommand>,
    events: Sender<PoolEvent>,
) {
    let mut failures: u32 = 0;
    loop {
        let error = match serve(&worker, &options, &mut commands, &events).await {
            Ok(SessionEnd::Closed) => break,
            Ok(SessionEnd::Lost(e)) => {
                failures = 0;
                e
            }
            Err(e) => e,
        };
        let fatal = error.is_fatal();
        log::warn!("Pool {} ({}): {}", worker.identifier, worker.endpoint(), error);
        if events.send(PoolEvent::Error(error)).is_err() || fatal {
            break;
        }

        failures += 1;
        if failures > options.max_reconnects {
            log::error!(
                "Pool {}: giving up after {} failed attempts",
                worker.identifier,
                failures
            );
            break;
        }
        let delay = options.reconnect_delay * 2u32.pow(failures.min(5) - 1);
        log::info!("Pool {}: reconnecting in {:?}", worker.identifier, delay);
        if !wait_offline(delay, &mut commands, &events).await {
            break;
        }
    }
    log::debug!("Pool {}: link closed", worker.identifier);
}

/// Sleeps out a reconnect delay while answering commands
///
/// Returns false when the link should close instead of reconnecting.
async fn wait_offline(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<PoolCommand>,
    events: &Sender<PoolEvent>,
) -> bool {
    let sleep = time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                None | Some(PoolCommand::Close) => return false,
                Some(PoolCommand::Submit { job_id, .. }) => {
                    let reason = format!("Pool offline, result for job {} dropped", job_id);
                    if events.send(PoolEvent::ShareRejected { reason }).is_err() {
                        return false;
                    }
                }
                Some(PoolCommand::Call { reply, .. }) => {
                    let _ = reply.send(Err(MinerError::ConnectionError("Pool offline".into())));
                }
            }
        }
    }
}

/// One TCP session from connect to disconnect
async fn serve(
    worker: &Worker,
    options: &StratumOptions,
    commands: &mut mpsc::UnboundedReceiver<PoolCommand>,
    events: &Sender<PoolEvent>,
) -> Result<SessionEnd, MinerError> {
    let endpoint = worker.endpoint();
    let stream = time::timeout(options.connect_timeout, TcpStream::connect(&endpoint))
        .await
        .map_err(|_| MinerError::ConnectionError(format!("Connecting to {} timed out", endpoint)))?
        .map_err(|e| MinerError::ConnectionError(format!("Connecting to {} failed: {}", endpoint, e)))?;
    stream.set_nodelay(true)?;
    log::info!("Pool {}: connected to {}", worker.identifier, endpoint);

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut session = StratumSession::new(worker);
    write_line(&mut writer, &session.login_request()).await?;

    let mut keepalive = time::interval(options.keepalive_interval);
    keepalive.tick().await;
    let mut logged_in = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        let e = MinerError::ConnectionError("Pool closed the connection".into());
                        return if logged_in { Ok(SessionEnd::Lost(e)) } else { Err(e) };
                    }
                    Err(e) => {
                        let e = MinerError::ConnectionError(format!("Read failed: {}", e));
                        return if logged_in { Ok(SessionEnd::Lost(e)) } else { Err(e) };
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                for event in session.handle_line(&line)? {
                    logged_in |= matches!(event, PoolEvent::Connected);
                    if events.send(event).is_err() {
                        return Ok(SessionEnd::Closed);
                    }
                }
            }
            command = commands.recv() => match command {
                None | Some(PoolCommand::Close) => return Ok(SessionEnd::Closed),
                Some(PoolCommand::Submit { job_id, nonce, hash, difficulty }) => {
                    match session.submit_request(&job_id, nonce, &hash, difficulty) {
                        Ok(request) => write_line(&mut writer, &request).await?,
                        Err(e) => {
                            let reason = e.to_string();
                            if events.send(PoolEvent::ShareRejected { reason }).is_err() {
                                return Ok(SessionEnd::Closed);
                            }
                        }
                    }
                }
                Some(PoolCommand::Call { method, params, reply }) => {
                    let request = session.call_request(&method, params, reply);
                    write_line(&mut writer, &request).await?;
                }
            },
            _ = keepalive.tick() => {
                if let Some(request) = session.keepalive_request() {
                    write_line(&mut writer, &request).await?;
                }
            }
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, message: &str) -> Result<(), MinerError> {
    writer.write_all(message.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// What an outstanding request id was for
enum Pending {
    Login,
    Submit { difficulty: u64 },
    KeepAlive,
    Call(CommandReply),
}

/// Protocol state of one connection, independent of I/O
pub struct StratumSession {
    worker: Worker,
    next_id: u64,
    session_id: Option<String>,
    pending: HashMap<u64, Pending>,
}

impl StratumSession {
    /// Fresh, not yet logged-in session for `worker`
    pub fn new(worker: &Worker) -> Self {
        StratumSession {
            worker: worker.clone(),
            next_id: 1,
            session_id: None,
            pending: HashMap::new(),
        }
    }

    /// Session id assigned by the pool at login
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn request(&mut self, method: &str, params: Value, pending: Pending) -> String {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, pending);
        json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })
        .to_string()
    }

    /// `login` request carrying the worker's credentials
    pub fn login_request(&mut self) -> String {
        let params = json!({
            "login": self.worker.wallet_address,
            "pass": self.worker.password,
            "rigid": self.worker.identifier,
            "agent": format!("cn_miner-rs/{}", env!("CARGO_PKG_VERSION")),
        });
        self.request("login", params, Pending::Login)
    }

    /// `submit` request for a found result
    ///
    /// The nonce is encoded as the four blob bytes it occupies.
    pub fn submit_request(
        &mut self,
        job_id: &str,
        nonce: u32,
        hash: &Hash,
        difficulty: u64,
    ) -> Result<String, MinerError> {
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| MinerError::ProtocolError("Submit before login".into()))?;
        let params = json!({
            "id": session_id,
            "job_id": job_id,
            "nonce": hex::encode(nonce.to_le_bytes()),
            "result": hash.to_hex(),
        });
        Ok(self.request("submit", params, Pending::Submit { difficulty }))
    }

    /// `keepalived` request, once logged in
    pub fn keepalive_request(&mut self) -> Option<String> {
        let session_id = self.session_id.clone()?;
        Some(self.request("keepalived", json!({ "id": session_id }), Pending::KeepAlive))
    }

    /// Arbitrary request whose result goes to `reply`
    pub fn call_request(&mut self, method: &str, params: Value, reply: CommandReply) -> String {
        self.request(method, params, Pending::Call(reply))
    }

    /// Interprets one line from the pool
    ///
    /// # Errors
    /// Unparseable lines and refused logins; both end the connection.
    pub fn handle_line(&mut self, line: &str) -> Result<Vec<PoolEvent>, MinerError> {
        let message: Value = serde_json::from_str(line)?;

        if let Some(method) = message.get("method").and_then(Value::as_str) {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            return Ok(vec![self.handle_notification(method, params)]);
        }

        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            return Err(MinerError::ProtocolError(format!("Message without id or method: {}", line)));
        };
        let error = message
            .get("error")
            .filter(|e| !e.is_null())
            .map(|e| {
                e.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string())
            });
        let result = message.get("result").cloned().unwrap_or(Value::Null);

        match self.pending.remove(&id) {
            Some(Pending::Login) => {
                if let Some(error) = error {
                    return Err(MinerError::ProtocolError(format!("Login refused: {}", error)));
                }
                let session_id = result
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MinerError::ProtocolError("Login result without id".into()))?;
                self.session_id = Some(session_id.to_string());
                log::info!("Pool {}: logged in", self.worker.identifier);

                let mut events = vec![PoolEvent::Connected];
                if let Some(job) = result.get("job").and_then(Value::as_object) {
                    events.push(self.job_event(job));
                }
                Ok(events)
            }
            Some(Pending::Submit { difficulty }) => Ok(vec![match error {
                Some(reason) => PoolEvent::ShareRejected { reason },
                None => PoolEvent::ShareAccepted { difficulty },
            }]),
            Some(Pending::KeepAlive) => match error {
                Some(error) => {
                    log::warn!("Pool {}: keepalive failed: {}", self.worker.identifier, error);
                    Ok(Vec::new())
                }
                None => Ok(vec![PoolEvent::KeepAlive]),
            },
            Some(Pending::Call(reply)) => {
                let answer = match error {
                    Some(error) => Err(MinerError::ProtocolError(error)),
                    None => Ok(result),
                };
                let _ = reply.send(answer);
                Ok(Vec::new())
            }
            None => {
                log::debug!("Pool {}: reply to unknown request {}", self.worker.identifier, id);
                Ok(Vec::new())
            }
        }
    }

    fn handle_notification(&mut self, method: &str, params: Value) -> PoolEvent {
        match method {
            "job" => match params.as_object() {
                Some(job) => self.job_event(job),
                None => PoolEvent::Error(MinerError::ProtocolError("Job without params".into())),
            },
            "block_found" | "blockfound" => PoolEvent::BlockFound,
            _ => PoolEvent::Notice {
                method: method.to_string(),
                params,
            },
        }
    }

    fn job_event(&self, params: &Map<String, Value>) -> PoolEvent {
        match parse_job(params, self.worker.nicehash) {
            Ok(job) => PoolEvent::NewJob(job),
            Err(e) => PoolEvent::Error(e),
        }
    }
}

/// Builds a [`Job`] from the params of a `job` notification
pub fn parse_job(params: &Map<String, Value>, nicehash: bool) -> Result<Job, MinerError> {
    let field = |name: &str| {
        params
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| MinerError::ProtocolError(format!("Job without {}", name)))
    };
    let variant = match params.get("variant") {
        Some(Value::Number(n)) => n.as_u64(),
        _ => match params.get("algo").and_then(Value::as_str) {
            Some(algo) => Some(
                algo.parse::<AlgorithmVersion>()
                    .map_err(MinerError::InvalidJob)?
                    .number(),
            ),
            None => None,
        },
    };
    Job::from_pool(field("job_id")?, field("blob")?, field("target")?, variant, nicehash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader as StdBufReader, Write};
    use std::net::TcpListener;

    fn blob_hex() -> String {
        hex::encode(crate::miner::job::tests::sample_blob(7))
    }

    fn worker(port: u16) -> Worker {
        Worker::new("w1", "127.0.0.1", port, "4Abc.rig")
    }

    fn logged_in(session: &mut StratumSession) {
        let login: Value = serde_json::from_str(&session.login_request()).unwrap();
        assert_eq!(login["method"], "login");
        assert_eq!(login["params"]["login"], "4Abc.rig");
        let reply = json!({"id": login["id"], "result": {"id": "sess", "status": "OK"}});
        let events = session.handle_line(&reply.to_string()).unwrap();
        assert!(matches!(events.as_slice(), [PoolEvent::Connected]));
    }

    #[test]
    fn login_reply_yields_session_and_job() {
        let mut session = StratumSession::new(&worker(1));
        let login: Value = serde_json::from_str(&session.login_request()).unwrap();
        let reply = json!({
            "id": login["id"],
            "jsonrpc": "2.0",
            "error": null,
            "result": {
                "id": "abc",
                "job": {"job_id": "j1", "blob": blob_hex(), "target": "e4a63d00"},
                "status": "OK"
            }
        });
        let events = session.handle_line(&reply.to_string()).unwrap();
        assert_eq!(session.session_id(), Some("abc"));
        assert!(matches!(events[0], PoolEvent::Connected));
        match &events[1] {
            PoolEvent::NewJob(job) => {
                assert_eq!(job.job_id, "j1");
                assert_eq!(job.difficulty, 1063);
                assert_eq!(job.version, AlgorithmVersion::V1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn refused_login_is_an_error() {
        let mut session = StratumSession::new(&worker(1));
        let login: Value = serde_json::from_str(&session.login_request()).unwrap();
        let reply = json!({"id": login["id"], "error": {"code": -1, "message": "Invalid address"}});
        assert!(matches!(
            session.handle_line(&reply.to_string()),
            Err(MinerError::ProtocolError(msg)) if msg.contains("Invalid address")
        ));
    }

    #[test]
    fn submit_replies_map_to_share_events() {
        let mut session = StratumSession::new(&worker(1));
        assert!(session.submit_request("j", 1, &Hash::default(), 5).is_err());
        logged_in(&mut session);

        let request: Value =
            serde_json::from_str(&session.submit_request("j", 0x0403_0201, &Hash::default(), 5).unwrap()).unwrap();
        assert_eq!(request["params"]["nonce"], "01020304");
        assert_eq!(request["params"]["id"], "sess");
        let ok = json!({"id": request["id"], "result": {"status": "OK"}});
        assert!(matches!(
            session.handle_line(&ok.to_string()).unwrap().as_slice(),
            [PoolEvent::ShareAccepted { difficulty: 5 }]
        ));

        let request: Value =
            serde_json::from_str(&session.submit_request("j", 2, &Hash::default(), 5).unwrap()).unwrap();
        let refused = json!({"id": request["id"], "error": {"code": -1, "message": "Duplicate share"}});
        match session.handle_line(&refused.to_string()).unwrap().as_slice() {
            [PoolEvent::ShareRejected { reason }] => assert_eq!(reason, "Duplicate share"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn answered_keepalive_signals_liveness() {
        let mut session = StratumSession::new(&worker(1));
        assert!(session.keepalive_request().is_none());
        logged_in(&mut session);

        let request: Value = serde_json::from_str(&session.keepalive_request().unwrap()).unwrap();
        assert_eq!(request["method"], "keepalived");
        assert_eq!(request["params"]["id"], "sess");
        let ok = json!({"id": request["id"], "result": {"status": "KEEPALIVED"}});
        assert!(matches!(
            session.handle_line(&ok.to_string()).unwrap().as_slice(),
            [PoolEvent::KeepAlive]
        ));

        let request: Value = serde_json::from_str(&session.keepalive_request().unwrap()).unwrap();
        let failed = json!({"id": request["id"], "error": {"code": -1, "message": "Unauthenticated"}});
        assert!(session.handle_line(&failed.to_string()).unwrap().is_empty());
    }

    #[test]
    fn notifications_are_classified() {
        let mut session = StratumSession::new(&worker(1));
        let job = json!({"jsonrpc": "2.0", "method": "job",
            "params": {"job_id": "j2", "blob": blob_hex(), "target": "ffffff00", "variant": 2}});
        match session.handle_line(&job.to_string()).unwrap().as_slice() {
            [PoolEvent::NewJob(job)] => assert_eq!(job.version, AlgorithmVersion::V2),
            other => panic!("unexpected {:?}", other),
        }

        let bad = json!({"method": "job", "params": {"job_id": "j3", "blob": "00", "target": "ffffff00"}});
        assert!(matches!(
            session.handle_line(&bad.to_string()).unwrap().as_slice(),
            [PoolEvent::Error(MinerError::InvalidJob(_))]
        ));

        let found = json!({"method": "block_found", "params": {}});
        assert!(matches!(
            session.handle_line(&found.to_string()).unwrap().as_slice(),
            [PoolEvent::BlockFound]
        ));

        let other = json!({"method": "motd", "params": {"text": "hi"}});
        assert!(matches!(
            session.handle_line(&other.to_string()).unwrap().as_slice(),
            [PoolEvent::Notice { method, .. }] if method == "motd"
        ));
        assert!(session.handle_line("not json").is_err());
    }

    #[test]
    fn secure_workers_are_refused() {
        let connector = StratumConnector::new(StratumOptions::default()).unwrap();
        let mut worker = worker(3333);
        worker.secure = true;
        assert!(matches!(connector.open(&worker), Err(MinerError::ConfigError(_))));
    }

    #[test]
    fn link_talks_to_a_tcp_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let blob = blob_hex();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;

            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let login: Value = serde_json::from_str(&line).unwrap();
            let reply = json!({"id": login["id"], "result": {"id": "s1", "status": "OK",
                "job": {"job_id": "tcp", "blob": blob, "target": "ffffff00"}}});
            writeln!(writer, "{}", reply).unwrap();

            line.clear();
            reader.read_line(&mut line).unwrap();
            let submit: Value = serde_json::from_str(&line).unwrap();
            writeln!(writer, "{}", json!({"id": submit["id"], "result": {"status": "OK"}})).unwrap();
            submit
        });

        let connector = StratumConnector::new(StratumOptions::default()).unwrap();
        let link = connector.open(&worker(port)).unwrap();
        let timeout = Duration::from_secs(5);
        assert!(matches!(link.events.recv_timeout(timeout).unwrap(), PoolEvent::Connected));
        assert!(matches!(link.events.recv_timeout(timeout).unwrap(), PoolEvent::NewJob(_)));

        link.submit("tcp", 9, Hash::default(), 77).unwrap();
        assert!(matches!(
            link.events.recv_timeout(timeout).unwrap(),
            PoolEvent::ShareAccepted { difficulty: 77 }
        ));
        let submit = server.join().unwrap();
        assert_eq!(submit["method"], "submit");
        assert_eq!(submit["params"]["job_id"], "tcp");
        assert_eq!(submit["params"]["nonce"], "09000000");
        link.close();
    }
}
