//! Wire protocol between coordinator and workers.
//!
//! Transport is TCP carrying UTF-8 JSON, one object per `\n`-terminated
//! line (`\r` tolerated before the `\n`). Every object is an envelope
//! `{"type": <UPPER_SNAKE kind>, "body": {<camelCase fields>}}`, which maps
//! onto an adjacently tagged serde enum, so the closed message set and the
//! envelope shape are checked in one place.
//!
//! Malformed lines and unknown `type` values decode to errors that callers
//! log and skip; they never terminate a session.

use serde::{Deserialize, Serialize};

/// Body of `CLIENT_REGISTER`: worker → coordinator on the forward
/// connection, which is closed right after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegister {
    pub node_id: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub threads: u32,
}

/// Body of `SERVER_HELLO`: coordinator → worker on the reverse connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHello {
    /// ISO-8601 offset timestamp; treated as opaque by workers.
    pub server_time: String,
    pub node_id: String,
}

/// Body of `CLIENT_HELLO_ACK`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHelloAck {
    pub node_id: String,
    pub ok: bool,
}

/// Body of `ASSIGN_WORK`: one contiguous index slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignWork {
    pub job_id: String,
    pub stored_hash: String,
    pub start_index: i64,
    pub count: i64,
    pub checkpoint_every: i32,
}

/// Body of `CHECKPOINT`: the first `tried` indices of the slice are done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub job_id: String,
    pub tried: i64,
    /// `start_index + tried - 1`: the last absolute index covered.
    pub last_index: i64,
    /// ISO-8601 offset timestamp at emission.
    pub ts: String,
}

/// Body of `WORK_RESULT`: terminal report for one assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResult {
    pub job_id: String,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub tried: i64,
    pub duration_ms: i64,
}

/// Body of `STOP`: broadcast campaign termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub reason: String,
}

/// The closed set of protocol messages, in envelope form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Message {
    #[serde(rename = "CLIENT_REGISTER")]
    ClientRegister(ClientRegister),
    #[serde(rename = "SERVER_HELLO")]
    ServerHello(ServerHello),
    #[serde(rename = "CLIENT_HELLO_ACK")]
    ClientHelloAck(ClientHelloAck),
    #[serde(rename = "ASSIGN_WORK")]
    AssignWork(AssignWork),
    #[serde(rename = "CHECKPOINT")]
    Checkpoint(Checkpoint),
    #[serde(rename = "WORK_RESULT")]
    WorkResult(WorkResult),
    #[serde(rename = "STOP")]
    Stop(Stop),
}

impl Message {
    /// The wire `type` string, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientRegister(_) => "CLIENT_REGISTER",
            Self::ServerHello(_) => "SERVER_HELLO",
            Self::ClientHelloAck(_) => "CLIENT_HELLO_ACK",
            Self::AssignWork(_) => "ASSIGN_WORK",
            Self::Checkpoint(_) => "CHECKPOINT",
            Self::WorkResult(_) => "WORK_RESULT",
            Self::Stop(_) => "STOP",
        }
    }
}

/// Serializes a message as one newline-terminated frame.
pub fn encode_frame(msg: &Message) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes one frame (without its terminator) into a message.
pub fn decode_frame(line: &[u8]) -> serde_json::Result<Message> {
    serde_json::from_slice(line)
}

/// Accumulates raw socket bytes and yields complete frames in order.
///
/// Reads can end mid-frame and can carry several frames at once; bytes are
/// buffered until a `\n` appears, and buffered frames must be drained before
/// the next read so ordering is preserved. A trailing `\r` is stripped.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns the next complete frame, or `None` when no full
    /// line is buffered yet.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let nl = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=nl).collect();
        line.pop(); // the \n
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Bytes currently buffered (diagnostics only).
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}
