//! Framed JSON-RPC 2.0 client for the host agent.
//!
//! Every frame on the wire is a one-byte tag, a big-endian u32 length, and
//! the payload. `J` frames carry JSON (request/response envelopes and exec
//! control messages), `D` frames carry raw bytes (stdin/stdout of a remote
//! command, archive streams). Control and data share the same FIFO, so an
//! `exit` frame can never overtake the output that preceded it.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::error::Error;

pub const FRAME_JSON: u8 = b'J';
pub const FRAME_DATA: u8 = b'D';

/// Upper bound on a single frame. Data is chunked well below this; the
/// limit guards against a corrupt length word.
const MAX_FRAME: usize = 8 * 1024 * 1024;

/// Chunk size for stdin/upload pumping.
const DATA_CHUNK: usize = 64 * 1024;

/// How long a blocking read waits before polling the cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
pub struct WireError {
    pub code: i64,
    pub message: String,
}

/// Out-of-band exec frames. The server sends at most one `exit` per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    Resize { rows: u16, cols: u16 },
    StdinClose,
    Exit { code: i32 },
}

/// Parameters of a streaming exec call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub service: String,
    pub args: Vec<String>,
    pub tty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServicePaths {
    pub root: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TailscaleInfo {
    pub hostname: String,
    pub ips: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MacvlanInfo {
    pub parent: String,
    pub vlan: u16,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceNetwork {
    pub tailscale: Option<TailscaleInfo>,
    pub macvlan: Option<MacvlanInfo>,
    pub service_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentStatus {
    pub name: String,
    pub container: String,
    pub status: String,
}

/// Status and metadata bundle for one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceInfoResponse {
    pub found: bool,
    pub data_type: String,
    pub generation: u64,
    pub staged: bool,
    pub paths: ServicePaths,
    pub network: ServiceNetwork,
    pub components: Vec<ComponentStatus>,
    pub images: Vec<String>,
}

/// Host facts returned by `catch.Info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One service as reported by `catch.Status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceStatus {
    pub name: String,
    pub data_type: String,
    pub components: Vec<ComponentStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusReport {
    pub services: Vec<ServiceStatus>,
}

// ── Framing ─────────────────────────────────────────────────────────────

enum Frame {
    Json(Vec<u8>),
    Data(Vec<u8>),
}

/// Write one frame. Holding the mutex for the whole frame keeps frames
/// from different threads from interleaving.
fn write_frame(stream: &Mutex<TcpStream>, tag: u8, payload: &[u8]) -> io::Result<()> {
    let mut guard = stream.lock().expect("rpc writer poisoned");
    let mut header = [0u8; 5];
    header[0] = tag;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    guard.write_all(&header)?;
    guard.write_all(payload)?;
    guard.flush()
}

fn write_json(stream: &Mutex<TcpStream>, value: &impl Serialize) -> Result<(), Error> {
    let bytes = serde_json::to_vec(value).map_err(|e| Error::RpcProtocol(e.to_string()))?;
    write_frame(stream, FRAME_JSON, &bytes).map_err(io_to_protocol)
}

fn io_to_protocol(e: io::Error) -> Error {
    Error::RpcProtocol(e.to_string())
}

/// Read exactly `buf.len()` bytes, polling the cancel token between
/// timeouts. `Ok(false)` means clean EOF before any byte arrived.
fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    cancel: Option<&CancelToken>,
) -> Result<bool, Error> {
    let mut total = 0;
    while total < buf.len() {
        if let Some(token) = cancel
            && token.is_canceled()
        {
            return Err(Error::Canceled);
        }
        match stream.read(&mut buf[total..]) {
            Ok(0) => {
                if total == 0 {
                    return Ok(false);
                }
                return Err(Error::RpcProtocol("connection closed mid-frame".into()));
            }
            Ok(n) => total += n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_to_protocol(e)),
        }
    }
    Ok(true)
}

/// Read one frame. `Ok(None)` is a clean close at a frame boundary.
fn read_frame(
    stream: &mut TcpStream,
    cancel: Option<&CancelToken>,
) -> Result<Option<Frame>, Error> {
    let mut header = [0u8; 5];
    if !read_full(stream, &mut header, cancel)? {
        return Ok(None);
    }
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME {
        return Err(Error::RpcProtocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME} byte limit"
        )));
    }
    let mut payload = vec![0u8; len];
    if len > 0 && !read_full(stream, &mut payload, cancel)? {
        return Err(Error::RpcProtocol("connection closed mid-frame".into()));
    }
    match header[0] {
        FRAME_JSON => Ok(Some(Frame::Json(payload))),
        FRAME_DATA => Ok(Some(Frame::Data(payload))),
        other => Err(Error::RpcProtocol(format!(
            "unknown frame tag 0x{other:02x}"
        ))),
    }
}

// ── Client ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RpcClient {
    reader: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    host: String,
    next_id: u64,
}

impl RpcClient {
    /// Dial the agent on `host:port`.
    pub fn connect(host: &str, port: u16) -> Result<Self, Error> {
        let stream = TcpStream::connect((host, port)).map_err(|e| Error::RpcUnreachable {
            host: host.to_string(),
            port,
            source: e,
        })?;
        stream.set_nodelay(true).ok();
        let writer = stream.try_clone().map_err(io_to_protocol)?;
        debug!(host, port, "rpc connected");
        Ok(Self {
            reader: stream,
            writer: Arc::new(Mutex::new(writer)),
            host: host.to_string(),
            next_id: 0,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Synchronous request/response.
    pub fn call(&mut self, method: &str, params: Value) -> Result<Value, Error> {
        let id = self.next_id();
        trace!(method, id, "rpc call");
        write_json(
            &self.writer,
            &RequestEnvelope {
                jsonrpc: "2.0",
                id,
                method,
                params,
            },
        )?;

        loop {
            match read_frame(&mut self.reader, None)? {
                None => return Err(Error::TruncatedStream),
                Some(Frame::Data(_)) => {
                    return Err(Error::RpcProtocol(
                        "unexpected data frame during call".into(),
                    ));
                }
                Some(Frame::Json(bytes)) => {
                    let resp: ResponseEnvelope = serde_json::from_slice(&bytes)
                        .map_err(|e| Error::RpcProtocol(e.to_string()))?;
                    if resp.id != Some(id) {
                        // Stray notification; ignore and keep waiting.
                        continue;
                    }
                    if let Some(err) = resp.error {
                        return Err(Error::RpcProtocol(format!(
                            "{} (code {})",
                            err.message, err.code
                        )));
                    }
                    return Ok(resp.result.unwrap_or(Value::Null));
                }
            }
        }
    }

    fn call_as<T: serde::de::DeserializeOwned>(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<T, Error> {
        let value = self.call(method, params)?;
        serde_json::from_value(value).map_err(|e| Error::RpcProtocol(e.to_string()))
    }

    /// Host facts.
    pub fn info(&mut self) -> Result<HostInfo, Error> {
        self.call_as("catch.Info", Value::Null)
    }

    /// Status and metadata bundle for one service.
    pub fn service_info(&mut self, service: &str) -> Result<ServiceInfoResponse, Error> {
        self.call_as("catch.ServiceInfo", serde_json::json!({ "service": service }))
    }

    /// All services on the host.
    pub fn status(&mut self) -> Result<StatusReport, Error> {
        self.call_as("catch.Status", Value::Null)
    }

    /// Content hashes of the most recently installed payload and env file.
    pub fn artifact_hashes(&mut self, service: &str) -> Result<crate::hash::ArtifactHashes, Error> {
        self.call_as(
            "catch.ArtifactHashes",
            serde_json::json!({ "service": service }),
        )
    }

    /// Subscribe to host events, yielding each one to `sink` until the
    /// server ends the stream or the token cancels.
    pub fn events(
        mut self,
        filter: Value,
        cancel: &CancelToken,
        mut sink: impl FnMut(Value),
    ) -> Result<(), Error> {
        let id = self.next_id();
        self.reader
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(io_to_protocol)?;
        write_json(
            &self.writer,
            &RequestEnvelope {
                jsonrpc: "2.0",
                id,
                method: "catch.Events",
                params: filter,
            },
        )?;

        loop {
            match read_frame(&mut self.reader, Some(cancel)) {
                Ok(None) => return Ok(()),
                Ok(Some(Frame::Json(bytes))) => {
                    let value: Value = serde_json::from_slice(&bytes)
                        .map_err(|e| Error::RpcProtocol(e.to_string()))?;
                    // The subscription ack echoes our id; everything else
                    // is an event.
                    if value.get("id").and_then(Value::as_u64) == Some(id) {
                        continue;
                    }
                    sink(value);
                }
                Ok(Some(Frame::Data(_))) => {
                    return Err(Error::RpcProtocol(
                        "unexpected data frame in event stream".into(),
                    ));
                }
                Err(Error::Canceled) => {
                    self.shutdown();
                    return Err(Error::Canceled);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Streaming duplex exec. Owns the transport for the duration: stdin
    /// is pumped as data frames, resize events become control frames, and
    /// server output lands in `stdout` until the `exit` frame. A clean
    /// close without `exit` is a truncated stream.
    pub fn exec(
        mut self,
        request: &ExecRequest,
        stdin: Box<dyn Read + Send>,
        stdout: &mut dyn Write,
        resize: mpsc::Receiver<(u16, u16)>,
        cancel: &CancelToken,
    ) -> Result<i32, Error> {
        let id = self.next_id();
        self.reader
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(io_to_protocol)?;
        write_json(
            &self.writer,
            &RequestEnvelope {
                jsonrpc: "2.0",
                id,
                method: "catch.Exec",
                params: serde_json::to_value(request)
                    .map_err(|e| Error::RpcProtocol(e.to_string()))?,
            },
        )?;

        // Stdin pump: local bytes become data frames until EOF, then a
        // stdin-close control frame. The thread parks itself on the read;
        // shutting the socket down unblocks the write side and lets it
        // exit, so it is detached rather than joined.
        let stdin_writer = Arc::clone(&self.writer);
        let stdin_cancel = cancel.clone();
        thread::Builder::new()
            .name("yeet-stdin-pump".into())
            .spawn(move || {
                let mut stdin = stdin;
                let mut buf = vec![0u8; DATA_CHUNK];
                loop {
                    if stdin_cancel.is_canceled() {
                        return;
                    }
                    match stdin.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if write_frame(&stdin_writer, FRAME_DATA, &buf[..n]).is_err() {
                                return;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(error = %e, "stdin pump read failed");
                            break;
                        }
                    }
                }
                let close = serde_json::to_vec(&ControlFrame::StdinClose).expect("serialize");
                let _ = write_frame(&stdin_writer, FRAME_JSON, &close);
            })
            .map_err(|e| Error::RpcProtocol(e.to_string()))?;

        // Resize watcher: forward window-size changes as control frames.
        let resize_writer = Arc::clone(&self.writer);
        thread::Builder::new()
            .name("yeet-resize".into())
            .spawn(move || {
                while let Ok((rows, cols)) = resize.recv() {
                    let frame = serde_json::to_vec(&ControlFrame::Resize { rows, cols })
                        .expect("serialize");
                    if write_frame(&resize_writer, FRAME_JSON, &frame).is_err() {
                        return;
                    }
                }
            })
            .map_err(|e| Error::RpcProtocol(e.to_string()))?;

        // Stdout pump, on this thread. After the exit frame we keep
        // draining so bytes queued behind it are not lost, though the
        // shared FIFO means the server has already flushed them.
        let mut exit_code: Option<i32> = None;
        let result = loop {
            match read_frame(&mut self.reader, Some(cancel)) {
                Ok(None) => match exit_code {
                    Some(code) => break Ok(code),
                    None => break Err(Error::TruncatedStream),
                },
                Ok(Some(Frame::Data(bytes))) => {
                    if let Err(e) = stdout.write_all(&bytes).and_then(|()| stdout.flush()) {
                        break Err(io_to_protocol(e));
                    }
                }
                Ok(Some(Frame::Json(bytes))) => {
                    if let Ok(control) = serde_json::from_slice::<ControlFrame>(&bytes) {
                        match control {
                            ControlFrame::Exit { code } => {
                                trace!(code, "exit frame observed");
                                exit_code = Some(code);
                            }
                            // Client-to-server frames coming back would be
                            // a server bug; ignore them.
                            ControlFrame::Resize { .. } | ControlFrame::StdinClose => {}
                        }
                        continue;
                    }
                    let resp: ResponseEnvelope = serde_json::from_slice(&bytes)
                        .map_err(|e| Error::RpcProtocol(e.to_string()))?;
                    if let Some(err) = resp.error {
                        break Err(Error::RpcProtocol(format!(
                            "{} (code {})",
                            err.message, err.code
                        )));
                    }
                }
                Err(Error::Canceled) => break Err(Error::Canceled),
                Err(e) => break Err(e),
            }
        };

        self.shutdown();
        result
    }

    fn shutdown(&self) {
        if let Ok(guard) = self.writer.lock() {
            let _ = guard.shutdown(Shutdown::Both);
        }
    }
}
