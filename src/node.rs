//! Worker node finite-state machine.
//!
//! A worker registers with the coordinator over a short-lived forward
//! connection, then *listens*: the coordinator reverse-connects, handshakes,
//! and drives the session with `ASSIGN_WORK` messages. The machine:
//!
//! ```text
//! INIT → PARSE_ARGS → START_CALLBACK → REGISTER_WITH_SERVER → POLL
//!                                                               │ accept
//!                                                               ▼
//!                        END ◄─ READ_READY ◄─ ACCEPT_BACK (SERVER_HELLO / ACK)
//!                         ▲        │  ▲
//!                         │        ▼  │ WORK_RESULT
//!                         └──── RUN_ASSIGN ──► ERROR
//! ```
//!
//! While a slice runs, a control listener thread keeps draining the same
//! receive buffer (under its mutex) so an out-of-band `STOP` reaches the
//! pool promptly; after the workers drain, one final non-blocking pass
//! catches a `STOP` that raced the result. A `STOP` observed either way
//! suppresses `WORK_RESULT` and ends the session cleanly.
//!
//! # Shared-resource policy
//!
//! - Receive side (socket clone + frame buffer): one mutex, shared by the
//!   FSM reader and the control listener.
//! - Send side: a second mutex held for the duration of one frame write;
//!   used by the FSM and by checkpoint emission from worker threads.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::pool::{SliceObserver, WorkerPool};
use crate::protocol::{
    self, AssignWork, Checkpoint, ClientHelloAck, ClientRegister, FrameBuffer, Message, WorkResult,
};
use crate::util;
use crate::verifier::HashVerifier;

/// Deadline for the coordinator's `SERVER_HELLO` after accept.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Callback-listener poll period while waiting for the reverse connection.
const POLL_PERIOD: Duration = Duration::from_millis(100);
/// Sleep between non-blocking reads on an idle session.
const READ_IDLE: Duration = Duration::from_millis(10);

/// Validated worker configuration, produced by the CLI layer.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_host: String,
    pub server_port: u16,
    pub threads: usize,
    pub verbose: bool,
}

/// Errors that route the machine into its ERROR state.
#[derive(Debug)]
#[non_exhaustive]
pub enum NodeError {
    /// Invalid configuration (zero port or threads).
    Config { detail: String },
    /// The coordinator address did not resolve.
    Resolve { host: String, port: u16 },
    /// Socket-level failure, with the phase it happened in.
    Transport { phase: &'static str, source: io::Error },
    /// The coordinator did not complete the handshake in time.
    HandshakeTimeout,
    /// An assignment failed preconditions or the slice aborted.
    Assignment { detail: String },
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { detail } => write!(f, "configuration error: {detail}"),
            Self::Resolve { host, port } => write!(f, "cannot resolve coordinator {host}:{port}"),
            Self::Transport { phase, source } => write!(f, "transport error during {phase}: {source}"),
            Self::HandshakeTimeout => {
                write!(f, "coordinator did not send SERVER_HELLO within {HELLO_TIMEOUT:?}")
            }
            Self::Assignment { detail } => write!(f, "assignment failed: {detail}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// FSM states, named as they appear in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    ParseArgs,
    StartCallback,
    RegisterWithServer,
    Poll,
    AcceptBack,
    ReadReady,
    RunAssign,
    End,
    Error,
}

/// Receive half of the session: socket clone plus accumulated frames.
struct RecvHalf {
    stream: TcpStream,
    frames: FrameBuffer,
}

/// One drain attempt on the receive half.
enum Polled {
    Message(Message),
    Idle,
    Closed,
}

/// Established reverse-connect session.
struct Session {
    recv: Arc<Mutex<RecvHalf>>,
    send: Arc<Mutex<TcpStream>>,
}

impl Session {
    fn write_frame(&self, msg: &Message) -> io::Result<()> {
        let bytes = protocol::encode_frame(msg).map_err(io::Error::other)?;
        let mut stream = self.send.lock().expect("send mutex poisoned");
        stream.write_all(&bytes)
    }
}

/// Drains one message from a shared receive half without blocking.
///
/// Buffered frames are served before the socket is read again; malformed
/// frames are logged and skipped, never surfaced.
fn poll_message(recv: &Mutex<RecvHalf>) -> io::Result<Polled> {
    let mut half = recv.lock().expect("recv mutex poisoned");
    loop {
        while let Some(line) = half.frames.next_frame() {
            match protocol::decode_frame(&line) {
                Ok(msg) => return Ok(Polled::Message(msg)),
                Err(e) => {
                    tracing::info!(error = %e, raw = %String::from_utf8_lossy(&line), "skipping malformed frame");
                }
            }
        }
        let mut tmp = [0u8; 4096];
        match half.stream.read(&mut tmp) {
            Ok(0) => return Ok(Polled::Closed),
            Ok(n) => half.frames.extend(&tmp[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Polled::Idle),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Turns pool progress events into `CHECKPOINT` bodies for one job.
///
/// Emission runs under the pool's progress mutex, so this only stamps and
/// enqueues; the actual socket write happens on a dedicated sender thread
/// draining the channel in FIFO order, which preserves the monotone
/// checkpoint sequence without blocking prefix commits on I/O.
struct CheckpointStreamer {
    job_id: String,
    start_index: i64,
    tx: crossbeam_channel::Sender<Checkpoint>,
}

impl SliceObserver for CheckpointStreamer {
    fn on_worker_start(&self, slot: usize, thread: thread::ThreadId) {
        tracing::debug!(slot, ?thread, job_id = %self.job_id, "worker picked up job");
    }

    fn on_checkpoint(&self, tried: u64, per_worker: &[u64]) {
        tracing::trace!(job_id = %self.job_id, tried, ?per_worker, "checkpoint");
        let body = Checkpoint {
            job_id: self.job_id.clone(),
            tried: tried as i64,
            last_index: self.start_index + tried as i64 - 1,
            ts: util::iso8601_utc(SystemTime::now()),
        };
        // A closed channel means the sender hit a dead socket; the slice is
        // already draining, so dropping the event is fine.
        let _ = self.tx.send(body);
    }
}

/// Spawns the thread that writes queued checkpoints to the session.
///
/// Exits when every `CheckpointStreamer` clone is gone and the queue is
/// drained. A write failure raises `external_stop` so workers stop early,
/// and `transport_dead` so the result send is skipped.
fn spawn_checkpoint_sender(
    rx: crossbeam_channel::Receiver<Checkpoint>,
    session: Session,
    external_stop: Arc<AtomicBool>,
    transport_dead: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("checkpoint-sender".into())
        .spawn(move || {
            while let Ok(body) = rx.recv() {
                if transport_dead.load(Ordering::Acquire) {
                    continue; // drain without writing
                }
                if let Err(e) = session.write_frame(&Message::Checkpoint(body)) {
                    tracing::error!(error = %e, "checkpoint send failed; draining slice");
                    transport_dead.store(true, Ordering::Release);
                    external_stop.store(true, Ordering::Release);
                }
            }
        })
        .expect("failed to spawn checkpoint sender")
}

/// The worker node. Owns the pool and walks the FSM to completion.
pub struct WorkerNode {
    config: WorkerConfig,
    node_id: String,
    pool: WorkerPool,
    listener: Option<TcpListener>,
    session: Option<Session>,
    pending_callback: Option<TcpStream>,
    pending_assign: Option<AssignWork>,
    failure: Option<NodeError>,
    exit_code: i32,
}

impl WorkerNode {
    pub fn new(config: WorkerConfig) -> Self {
        let threads = config.threads.max(1);
        Self {
            config,
            node_id: util::node_id(),
            pool: WorkerPool::new(threads),
            listener: None,
            session: None,
            pending_callback: None,
            pending_assign: None,
            failure: None,
            exit_code: 0,
        }
    }

    /// The process-chosen node identity (`c-<hostname>`).
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Runs the machine to completion and returns the process exit code.
    pub fn run(mut self) -> i32 {
        let mut state = State::Init;
        loop {
            tracing::debug!(?state, "fsm transition");
            state = match state {
                State::Init => State::ParseArgs,
                State::ParseArgs => self.parse_args(),
                State::StartCallback => self.start_callback(),
                State::RegisterWithServer => self.register(),
                State::Poll => self.poll_callback(),
                State::AcceptBack => self.accept_back(),
                State::ReadReady => self.read_ready(),
                State::RunAssign => self.run_assign(),
                State::Error => {
                    if let Some(err) = self.failure.take() {
                        tracing::error!(error = %err, "worker failed");
                        eprintln!("worker: {err}");
                    }
                    if self.exit_code == 0 {
                        self.exit_code = 1;
                    }
                    State::End
                }
                State::End => {
                    self.shutdown_sockets();
                    return self.exit_code;
                }
            };
        }
    }

    fn fail(&mut self, err: NodeError) -> State {
        self.failure = Some(err);
        State::Error
    }

    fn parse_args(&mut self) -> State {
        if self.config.server_port == 0 {
            return self.fail(NodeError::Config { detail: "server_port must be in [1, 65535]".into() });
        }
        if self.config.threads == 0 {
            return self.fail(NodeError::Config { detail: "threads must be a positive integer".into() });
        }
        State::StartCallback
    }

    fn start_callback(&mut self) -> State {
        let listener = match TcpListener::bind(("0.0.0.0", 0)) {
            Ok(l) => l,
            Err(e) => return self.fail(NodeError::Transport { phase: "callback bind", source: e }),
        };
        if let Err(e) = listener.set_nonblocking(true) {
            return self.fail(NodeError::Transport { phase: "callback bind", source: e });
        }
        tracing::debug!(addr = ?listener.local_addr().ok(), "callback listener bound");
        self.listener = Some(listener);
        State::RegisterWithServer
    }

    fn coordinator_addr(&self) -> Result<SocketAddr, NodeError> {
        (self.config.server_host.as_str(), self.config.server_port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| NodeError::Resolve {
                host: self.config.server_host.clone(),
                port: self.config.server_port,
            })
    }

    fn register(&mut self) -> State {
        let addr = match self.coordinator_addr() {
            Ok(a) => a,
            Err(e) => return self.fail(e),
        };
        let listen_port = match self.listener.as_ref().and_then(|l| l.local_addr().ok()) {
            Some(a) => a.port(),
            None => {
                return self.fail(NodeError::Config { detail: "callback listener lost".into() });
            }
        };
        let listen_host = util::local_addr_toward(addr).to_string();

        let register = Message::ClientRegister(ClientRegister {
            node_id: self.node_id.clone(),
            listen_host,
            listen_port,
            threads: self.pool.threads() as u32,
        });

        let attempt = (|| -> io::Result<()> {
            let mut stream = TcpStream::connect(addr)?;
            let bytes = protocol::encode_frame(&register).map_err(io::Error::other)?;
            stream.write_all(&bytes)?;
            stream.shutdown(Shutdown::Both)?;
            Ok(())
        })();
        match attempt {
            Ok(()) => {
                tracing::debug!(%addr, "registered with coordinator");
                State::Poll
            }
            Err(e) => self.fail(NodeError::Transport { phase: "registration", source: e }),
        }
    }

    /// POLL: wait (100 ms per turn) for the coordinator's reverse connection.
    fn poll_callback(&mut self) -> State {
        let Some(listener) = self.listener.take() else {
            return self.fail(NodeError::Config { detail: "callback listener lost".into() });
        };
        let next = loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "coordinator called back");
                    self.pending_callback = Some(stream);
                    break State::AcceptBack;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_PERIOD);
                }
                Err(e) => {
                    break self.fail(NodeError::Transport { phase: "callback accept", source: e });
                }
            }
        };
        self.listener = Some(listener);
        next
    }

    fn accept_back(&mut self) -> State {
        let Some(stream) = self.pending_callback.take() else {
            return self.fail(NodeError::Config { detail: "callback connection lost".into() });
        };
        // Accepted sockets inherit the listener's non-blocking mode on some
        // platforms; the handshake wants short timed reads instead.
        if let Err(e) = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(Duration::from_millis(100))))
        {
            return self.fail(NodeError::Transport { phase: "handshake", source: e });
        }

        let mut frames = FrameBuffer::new();
        let deadline = Instant::now() + HELLO_TIMEOUT;
        let mut stream = stream;
        let hello = 'outer: loop {
            while let Some(line) = frames.next_frame() {
                match protocol::decode_frame(&line) {
                    Ok(Message::ServerHello(hello)) => break 'outer hello,
                    Ok(other) => {
                        tracing::info!(kind = other.kind(), "ignoring unexpected message before SERVER_HELLO");
                    }
                    Err(e) => tracing::info!(error = %e, "skipping malformed handshake frame"),
                }
            }
            if Instant::now() >= deadline {
                return self.fail(NodeError::HandshakeTimeout);
            }
            let mut tmp = [0u8; 1024];
            match stream.read(&mut tmp) {
                Ok(0) => {
                    return self.fail(NodeError::Transport {
                        phase: "handshake",
                        source: io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"),
                    });
                }
                Ok(n) => frames.extend(&tmp[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return self.fail(NodeError::Transport { phase: "handshake", source: e }),
            }
        };
        tracing::debug!(server_time = %hello.server_time, "received SERVER_HELLO");

        let ack = Message::ClientHelloAck(ClientHelloAck { node_id: self.node_id.clone(), ok: true });
        let ack_bytes = match protocol::encode_frame(&ack) {
            Ok(b) => b,
            Err(e) => {
                return self.fail(NodeError::Transport { phase: "handshake", source: io::Error::other(e) });
            }
        };
        if let Err(e) = stream.write_all(&ack_bytes) {
            return self.fail(NodeError::Transport { phase: "handshake", source: e });
        }

        // Split into the shared receive half and the serialized send half.
        let recv_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => return self.fail(NodeError::Transport { phase: "handshake", source: e }),
        };
        if let Err(e) = recv_stream.set_nonblocking(true) {
            return self.fail(NodeError::Transport { phase: "handshake", source: e });
        }
        self.session = Some(Session {
            recv: Arc::new(Mutex::new(RecvHalf { stream: recv_stream, frames })),
            send: Arc::new(Mutex::new(stream)),
        });
        State::ReadReady
    }

    fn read_ready(&mut self) -> State {
        let recv = match self.session.as_ref() {
            Some(s) => Arc::clone(&s.recv),
            None => return self.fail(NodeError::Config { detail: "session lost".into() }),
        };
        loop {
            match poll_message(&recv) {
                Ok(Polled::Message(Message::AssignWork(assign))) => {
                    tracing::debug!(job_id = %assign.job_id, start = assign.start_index, count = assign.count, "received assignment");
                    self.pending_assign = Some(assign);
                    return State::RunAssign;
                }
                Ok(Polled::Message(Message::Stop(stop))) => {
                    tracing::info!(reason = %stop.reason, "received STOP");
                    return State::End;
                }
                Ok(Polled::Message(other)) => {
                    tracing::info!(kind = other.kind(), "ignoring unexpected message");
                }
                Ok(Polled::Idle) => thread::sleep(READ_IDLE),
                Ok(Polled::Closed) => {
                    tracing::debug!("coordinator closed the session");
                    return State::End;
                }
                Err(e) => {
                    return self.fail(NodeError::Transport { phase: "session read", source: e });
                }
            }
        }
    }

    fn run_assign(&mut self) -> State {
        let Some(assign) = self.pending_assign.take() else {
            return self.fail(NodeError::Assignment { detail: "no pending assignment".into() });
        };
        if assign.start_index < 0 || assign.count < 1 || assign.checkpoint_every < 1 {
            return self.fail(NodeError::Assignment {
                detail: format!(
                    "invalid bounds: startIndex={} count={} checkpointEvery={}",
                    assign.start_index, assign.count, assign.checkpoint_every
                ),
            });
        }
        let Some(session) = self.session.as_ref() else {
            return self.fail(NodeError::Config { detail: "session lost".into() });
        };
        let session = Session {
            recv: Arc::clone(&session.recv),
            send: Arc::clone(&session.send),
        };

        let external_stop = Arc::new(AtomicBool::new(false));
        let stop_seen = Arc::new(AtomicBool::new(false));
        let transport_dead = Arc::new(AtomicBool::new(false));
        let control_quit = Arc::new(AtomicBool::new(false));

        // Control listener: watch the same receive buffer for an out-of-band
        // STOP while the pool is busy.
        let control = {
            let recv = Arc::clone(&session.recv);
            let external_stop = Arc::clone(&external_stop);
            let stop_seen = Arc::clone(&stop_seen);
            let quit = Arc::clone(&control_quit);
            thread::Builder::new()
                .name("control-listener".into())
                .spawn(move || {
                    while !quit.load(Ordering::Acquire) {
                        match poll_message(&recv) {
                            Ok(Polled::Message(Message::Stop(stop))) => {
                                tracing::info!(reason = %stop.reason, "STOP during assignment");
                                stop_seen.store(true, Ordering::Release);
                                external_stop.store(true, Ordering::Release);
                                return;
                            }
                            Ok(Polled::Message(other)) => {
                                tracing::info!(kind = other.kind(), "ignoring message during assignment");
                            }
                            Ok(Polled::Idle) => thread::sleep(READ_IDLE),
                            Ok(Polled::Closed) => {
                                tracing::debug!("peer closed during assignment; draining workers");
                                external_stop.store(true, Ordering::Release);
                                return;
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "control listener read failed; draining workers");
                                external_stop.store(true, Ordering::Release);
                                return;
                            }
                        }
                    }
                })
                .expect("failed to spawn control listener")
        };

        let (cp_tx, cp_rx) = crossbeam_channel::unbounded::<Checkpoint>();
        let sender = spawn_checkpoint_sender(
            cp_rx,
            Session {
                recv: Arc::clone(&session.recv),
                send: Arc::clone(&session.send),
            },
            Arc::clone(&external_stop),
            Arc::clone(&transport_dead),
        );
        let observer = Arc::new(CheckpointStreamer {
            job_id: assign.job_id.clone(),
            start_index: assign.start_index,
            tx: cp_tx,
        });

        let verifier = Arc::new(HashVerifier::new(assign.stored_hash.clone()));
        let result = self.pool.run_slice(
            verifier,
            assign.start_index as u64,
            assign.count as u64,
            assign.checkpoint_every as u64,
            Arc::clone(&external_stop),
            observer,
        );

        control_quit.store(true, Ordering::Release);
        let _ = control.join();
        // The observer (and with it the channel's send side) died with the
        // job; joining here flushes every queued checkpoint before any
        // WORK_RESULT goes out on the same socket.
        let _ = sender.join();

        // Final drain: a STOP may have landed between the last iteration and
        // this point; if so, no WORK_RESULT is owed.
        if !stop_seen.load(Ordering::Acquire) {
            match poll_message(&session.recv) {
                Ok(Polled::Message(Message::Stop(stop))) => {
                    tracing::info!(reason = %stop.reason, "STOP arrived before result send");
                    stop_seen.store(true, Ordering::Release);
                }
                Ok(Polled::Message(other)) => {
                    tracing::info!(kind = other.kind(), "ignoring message in result window");
                }
                Ok(Polled::Idle) | Ok(Polled::Closed) | Err(_) => {}
            }
        }

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                return self.fail(NodeError::Assignment { detail: e.to_string() });
            }
        };

        if stop_seen.load(Ordering::Acquire) {
            return State::End;
        }
        if transport_dead.load(Ordering::Acquire) {
            tracing::debug!("session lost mid-assignment");
            return State::End;
        }

        match result.password.as_deref() {
            Some(password) => println!("job {}: FOUND {password}", assign.job_id),
            None => println!("job {}: exhausted after {} tries", assign.job_id, result.tried),
        }

        let report = Message::WorkResult(WorkResult {
            job_id: assign.job_id.clone(),
            found: result.found,
            password: result.password.clone(),
            tried: result.tried as i64,
            duration_ms: result.duration_ms() as i64,
        });
        if let Err(e) = session.write_frame(&report) {
            tracing::error!(error = %e, "result send failed");
            return State::End;
        }
        tracing::debug!(job_id = %assign.job_id, found = result.found, tried = result.tried, "result sent");
        State::ReadReady
    }

    fn shutdown_sockets(&mut self) {
        if let Some(session) = self.session.take() {
            if let Ok(stream) = session.send.lock() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        self.listener = None;
        tracing::debug!("sockets closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_port_is_a_config_error() {
        let node = WorkerNode::new(WorkerConfig {
            server_host: "127.0.0.1".into(),
            server_port: 0,
            threads: 1,
            verbose: false,
        });
        assert_eq!(node.run(), 1);
    }

    #[test]
    fn unresolvable_host_errors_out() {
        let node = WorkerNode::new(WorkerConfig {
            server_host: "definitely-not-a-real-host.invalid".into(),
            server_port: 4000,
            threads: 1,
            verbose: false,
        });
        assert_eq!(node.run(), 1);
    }

    #[test]
    fn node_id_is_stable_and_prefixed() {
        let node = WorkerNode::new(WorkerConfig {
            server_host: "127.0.0.1".into(),
            server_port: 1,
            threads: 1,
            verbose: false,
        });
        assert!(node.node_id().starts_with("c-"));
    }
}
