//! End-to-end worker sessions against a scripted mock coordinator.
//!
//! Each test drives the real `WorkerNode` over loopback TCP: accept the
//! forward registration, reverse-connect, handshake, then play a scenario.
//! Scenarios that need the platform crypt library probe for it first and
//! bail out quietly when the host cannot supply the hash format; the APR1
//! scenarios run everywhere since they never touch libcrypt.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crackle::protocol::{
    decode_frame, encode_frame, AssignWork, ClientRegister, Message, ServerHello, Stop,
};
use crackle::{util, WorkerConfig, WorkerNode};

const IO_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Mock coordinator plumbing
// ============================================================================

struct Harness {
    registration: ClientRegister,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    worker: JoinHandle<i32>,
}

/// Binds the coordinator socket, launches a worker at it, and completes the
/// registration + reverse-connect handshake.
fn start_session(threads: usize) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock coordinator");
    let port = listener.local_addr().unwrap().port();

    let worker = thread::spawn(move || {
        WorkerNode::new(WorkerConfig {
            server_host: "127.0.0.1".into(),
            server_port: port,
            threads,
            verbose: false,
        })
        .run()
    });

    // Forward connection: exactly one CLIENT_REGISTER, then the worker closes.
    let (reg_stream, _) = listener.accept().expect("accept registration");
    reg_stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let mut reg_reader = BufReader::new(reg_stream);
    let mut line = String::new();
    reg_reader.read_line(&mut line).expect("read registration");
    let Message::ClientRegister(registration) = decode_frame(line.trim_end().as_bytes()).unwrap()
    else {
        panic!("expected CLIENT_REGISTER, got {line:?}");
    };
    assert!(registration.node_id.starts_with("c-"));
    assert_ne!(registration.listen_port, 0);
    assert_eq!(registration.threads as usize, threads);

    // Reverse connection plus handshake.
    let writer = TcpStream::connect((registration.listen_host.as_str(), registration.listen_port))
        .expect("reverse connect");
    writer.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let reader = BufReader::new(writer.try_clone().unwrap());
    let mut harness = Harness {
        registration,
        reader,
        writer,
        worker,
    };

    harness.send(&Message::ServerHello(ServerHello {
        server_time: util::iso8601_utc(SystemTime::now()),
        node_id: harness.registration.node_id.clone(),
    }));
    match harness.recv().expect("hello ack") {
        Message::ClientHelloAck(ack) => assert!(ack.ok),
        other => panic!("expected CLIENT_HELLO_ACK, got {other:?}"),
    }
    harness
}

impl Harness {
    fn send(&mut self, msg: &Message) {
        let bytes = encode_frame(msg).unwrap();
        self.writer.write_all(&bytes).unwrap();
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
    }

    /// Reads one frame; `None` on clean EOF.
    fn recv(&mut self) -> Option<Message> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(decode_frame(line.trim_end().as_bytes()).expect("decodable frame")),
            Err(e) => panic!("mock coordinator read failed: {e}"),
        }
    }

    /// Drains frames until EOF.
    fn recv_until_eof(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = self.recv() {
            out.push(msg);
        }
        out
    }

    /// Closes the session and collects the worker's exit code.
    fn finish(self) -> i32 {
        drop(self.reader);
        drop(self.writer);
        self.worker.join().expect("worker thread panicked")
    }
}

/// Probes for MD5-crypt support so native-mode scenarios can skip cleanly.
fn md5_crypt(candidate: &str) -> Option<String> {
    let binding = crackle::crypt::binding().ok()?;
    let hash = binding.crypt_wrap(candidate, "$1$saltxxxx$")?;
    (!hash.starts_with('*')).then_some(hash)
}

fn assign(job_id: &str, stored_hash: &str, start: i64, count: i64, every: i32) -> Message {
    Message::AssignWork(AssignWork {
        job_id: job_id.into(),
        stored_hash: stored_hash.into(),
        start_index: start,
        count,
        checkpoint_every: every,
    })
}

// ============================================================================
// Scenarios
// ============================================================================

/// Hit inside a small slice: checkpoints stream in increasing order, then a
/// found result carrying the cracked password.
#[test]
fn tiny_slice_hit_in_range() {
    let Some(stored) = md5_crypt("Cc") else {
        eprintln!("skipping: host crypt lacks MD5-crypt");
        return;
    };

    let mut session = start_session(2);
    session.send(&assign("j1", &stored, 79, 6_241, 100));

    let mut checkpoints = Vec::new();
    let result = loop {
        match session.recv().expect("frame before result") {
            Message::Checkpoint(cp) => {
                assert_eq!(cp.job_id, "j1");
                assert_eq!(cp.last_index, 79 + cp.tried - 1);
                checkpoints.push(cp.tried);
            }
            Message::WorkResult(result) => break result,
            other => panic!("unexpected {other:?}"),
        }
    };

    assert!(result.found);
    assert_eq!(result.password.as_deref(), Some("Cc"));
    assert!(result.tried >= 1 && result.tried <= 6_241);
    assert!(checkpoints.windows(2).all(|w| w[0] < w[1]), "{checkpoints:?}");

    assert_eq!(session.finish(), 0);
}

/// Miss over a whole slice: exhaustion result plus a terminal checkpoint
/// equal to the slice size.
#[test]
fn tiny_slice_miss_reports_exhaustion() {
    if crackle::crypt::binding().is_err() {
        eprintln!("skipping: no crypt library on this host");
        return;
    }

    let mut session = start_session(2);
    // Syntactically plausible but unsatisfiable hash: every candidate misses
    // whether or not the host supports sha512-crypt.
    session.send(&assign("j2", "$6$saltxxxx$nosuchhash", 0, 200, 50));

    let mut checkpoints = Vec::new();
    let result = loop {
        match session.recv().expect("frame before result") {
            Message::Checkpoint(cp) => checkpoints.push(cp.tried),
            Message::WorkResult(result) => break result,
            other => panic!("unexpected {other:?}"),
        }
    };

    assert!(!result.found);
    assert_eq!(result.password, None);
    assert_eq!(result.tried, 200);
    assert_eq!(checkpoints, vec![50, 100, 150, 200]);

    assert_eq!(session.finish(), 0);
}

/// A broadcast STOP mid-run suppresses the result entirely and the worker
/// exits cleanly.
#[test]
fn stop_mid_run_suppresses_work_result() {
    let mut session = start_session(2);
    // APR1 keeps per-candidate cost high (a child process or a failed spawn)
    // without needing libcrypt, so the slice cannot finish under the STOP.
    session.send(&assign("j3", "$apr1$saltsalt$unsatisfiable0000000", 0, 2_000_000, 50));

    // Wait for proof the job is running, then broadcast STOP.
    match session.recv().expect("first checkpoint") {
        Message::Checkpoint(cp) => assert_eq!(cp.job_id, "j3"),
        other => panic!("unexpected {other:?}"),
    }
    session.send(&Message::Stop(Stop { reason: "cracked elsewhere".into() }));

    let rest = session.recv_until_eof();
    assert!(
        !rest.iter().any(|m| matches!(m, Message::WorkResult(_))),
        "STOP must suppress WORK_RESULT: {rest:?}"
    );
    assert_eq!(session.finish(), 0);
}

/// The coordinator never sends SERVER_HELLO: the worker gives up after the
/// handshake deadline with a usage-style exit code.
#[test]
fn reverse_handshake_timeout_errors_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let worker = thread::spawn(move || {
        WorkerNode::new(WorkerConfig {
            server_host: "127.0.0.1".into(),
            server_port: port,
            threads: 1,
            verbose: false,
        })
        .run()
    });

    let (reg_stream, _) = listener.accept().unwrap();
    reg_stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let mut line = String::new();
    BufReader::new(reg_stream).read_line(&mut line).unwrap();
    let Message::ClientRegister(registration) = decode_frame(line.trim_end().as_bytes()).unwrap()
    else {
        panic!("expected CLIENT_REGISTER");
    };

    // Dial back but stay silent; the worker must not wait forever.
    let back = TcpStream::connect((registration.listen_host.as_str(), registration.listen_port)).unwrap();
    let exit = worker.join().expect("worker thread panicked");
    drop(back);
    assert_eq!(exit, 1);
}

/// Garbage frames are logged and skipped; the assignment behind them runs
/// normally.
#[test]
fn malformed_frame_is_tolerated() {
    let mut session = start_session(2);
    session.send_raw(b"{bogus}\n");
    session.send_raw(b"{\"type\":\"NO_SUCH_KIND\",\"body\":{}}\n");
    session.send(&assign("j4", "$apr1$saltsalt$unsatisfiable0000000", 10, 3, 1));

    let mut checkpoints = Vec::new();
    let result = loop {
        match session.recv().expect("frame before result") {
            Message::Checkpoint(cp) => checkpoints.push(cp.tried),
            Message::WorkResult(result) => break result,
            other => panic!("unexpected {other:?}"),
        }
    };

    assert_eq!(checkpoints, vec![1, 2, 3]);
    assert!(!result.found);
    assert_eq!(result.tried, 3);
    assert_eq!(session.finish(), 0);
}

/// Sequential assignments on one session each get their own result.
#[test]
fn sequential_assignments_each_report() {
    let mut session = start_session(3);

    for (job, count) in [("a1", 4i64), ("a2", 7)] {
        session.send(&assign(job, "$apr1$saltsalt$unsatisfiable0000000", 0, count, 2));
        let result = loop {
            match session.recv().expect("frame before result") {
                Message::Checkpoint(cp) => assert_eq!(cp.job_id, job),
                Message::WorkResult(result) => break result,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(result.job_id, job);
        assert!(!result.found);
        assert_eq!(result.tried, count);
    }

    assert_eq!(session.finish(), 0);
}

/// An APR1 hash that nothing satisfies (openssl present or not) still
/// yields a single exhaustion result covering the whole slice.
#[test]
fn apr1_without_a_match_exhausts() {
    let mut session = start_session(2);
    session.send(&assign("j5", "$apr1$abcd1234$zzzzzzzzzzzzzzzzzzzzzz", 0, 5, 5));

    let result = loop {
        match session.recv().expect("frame before result") {
            Message::Checkpoint(_) => continue,
            Message::WorkResult(result) => break result,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert!(!result.found);
    assert_eq!(result.tried, 5);
    assert_eq!(session.finish(), 0);
}

/// The checkpoint stream carries parseable ISO-8601 offset timestamps.
#[test]
fn checkpoint_timestamps_are_offset_iso8601() {
    let mut session = start_session(1);
    session.send(&assign("j6", "$apr1$saltsalt$unsatisfiable0000000", 0, 2, 1));

    let mut saw_checkpoint = false;
    loop {
        match session.recv().expect("frame before result") {
            Message::Checkpoint(cp) => {
                saw_checkpoint = true;
                assert!(cp.ts.ends_with("+00:00"), "{}", cp.ts);
                assert_eq!(cp.ts.as_bytes()[10], b'T');
            }
            Message::WorkResult(_) => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(saw_checkpoint);
    assert_eq!(session.finish(), 0);
}
