//! PTY-aware exec wrapper over the RPC client: raw-mode scoping, window
//! resize forwarding, and terminal-friendly exit-error formatting.

use std::io::{self, IsTerminal, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc;
use std::thread;

use crossterm::terminal;
use signal_hook::consts::SIGWINCH;
use signal_hook::iterator::Signals;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::rpc::{ExecRequest, RpcClient};

/// Where the remote command's stdin comes from.
pub enum StdinSource {
    /// The user's terminal (or whatever stdin is). Eligible for a PTY.
    Terminal,
    /// A named byte stream, e.g. an encoded payload. Forces the TTY bit
    /// off and supplies the payload-name hint.
    Payload(Box<dyn Read + Send>, String),
    /// No input at all.
    Empty,
}

/// Tracks the last byte written so a later error message can pick the
/// line break that puts it on its own line.
struct TrackingWriter<W> {
    inner: W,
    last: Arc<AtomicU16>,
}

/// Sentinel meaning "nothing written yet"; real bytes occupy 0..=255.
const NO_BYTE: u16 = u16::MAX;

impl<W: Write> Write for TrackingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.last.store(buf[n - 1] as u16, Ordering::Relaxed);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Line break to print before an error message, given the last byte the
/// server sent while the terminal was raw.
fn prefix_for(last: u16) -> &'static str {
    match last {
        x if x == u16::from(b'\n') => "\r",
        x if x == u16::from(b'\r') => "\n",
        NO_BYTE => "",
        _ => "\r\n",
    }
}

/// Puts the local terminal into raw mode and guarantees restoration on
/// every exit path, including unwinding.
struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self { active: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active
            && let Err(e) = terminal::disable_raw_mode()
        {
            warn!(error = %e, "failed to restore terminal mode");
        }
    }
}

/// Watch SIGWINCH and forward the new window size. Returns a handle used
/// to stop the watcher once the call finishes.
fn spawn_resize_watcher(
    tx: mpsc::Sender<(u16, u16)>,
) -> io::Result<signal_hook::iterator::Handle> {
    let mut signals = Signals::new([SIGWINCH])?;
    let handle = signals.handle();
    thread::Builder::new().name("yeet-winch".into()).spawn(move || {
        for _ in signals.forever() {
            if let Ok((cols, rows)) = terminal::size() {
                if tx.send((rows, cols)).is_err() {
                    return;
                }
            }
        }
    })?;
    Ok(handle)
}

/// Run a remote command, streaming its output to the local terminal.
///
/// When stdout is a terminal and the request asks for a PTY, the local
/// terminal goes raw for the duration and resize events are forwarded.
/// A non-zero remote exit becomes `Error::RemoteExit` carrying the
/// terminal-friendly prefix.
pub fn run(
    client: RpcClient,
    mut request: ExecRequest,
    stdin: StdinSource,
    cancel: &CancelToken,
) -> Result<(), Error> {
    let stdout_tty = io::stdout().is_terminal();
    let stdin_tty = io::stdin().is_terminal();

    let stdin_reader: Box<dyn Read + Send> = match stdin {
        StdinSource::Payload(reader, name) => {
            // Piped payloads never get a PTY; the name tells the server
            // what to call the artifact.
            request.tty = false;
            request.payload_name = Some(name);
            reader
        }
        StdinSource::Terminal => {
            if !stdin_tty {
                request.tty = false;
            }
            Box::new(io::stdin())
        }
        StdinSource::Empty => {
            request.tty = false;
            Box::new(io::empty())
        }
    };

    let interactive = request.tty && stdout_tty && stdin_tty;
    let mut raw_guard = None;
    let (resize_tx, resize_rx) = mpsc::channel();
    let mut winch_handle = None;

    if interactive {
        if let Ok((cols, rows)) = terminal::size() {
            request.cols = Some(cols);
            request.rows = Some(rows);
        }
        request.term = std::env::var("TERM").ok();
        raw_guard = Some(RawModeGuard::enable().map_err(|e| Error::RpcProtocol(e.to_string()))?);
        match spawn_resize_watcher(resize_tx) {
            Ok(handle) => winch_handle = Some(handle),
            Err(e) => warn!(error = %e, "resize watcher unavailable"),
        }
        debug!(rows = ?request.rows, cols = ?request.cols, "entering raw mode for exec");
    } else {
        request.tty = false;
        // No watcher; the rpc layer's resize thread sees a closed channel
        // and exits immediately.
        drop(resize_tx);
    }

    let last_byte = Arc::new(AtomicU16::new(NO_BYTE));
    let mut stdout = TrackingWriter {
        inner: io::stdout(),
        last: Arc::clone(&last_byte),
    };

    let result = client.exec(&request, stdin_reader, &mut stdout, resize_rx, cancel);

    if let Some(handle) = winch_handle {
        handle.close();
    }
    drop(raw_guard);

    match result {
        Ok(0) => Ok(()),
        Ok(code) => {
            let prefix = if interactive {
                prefix_for(last_byte.load(Ordering::Relaxed))
            } else {
                ""
            };
            Err(Error::RemoteExit { code, prefix })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_lands_message_on_its_own_line() {
        assert_eq!(prefix_for(u16::from(b'\n')), "\r");
        assert_eq!(prefix_for(u16::from(b'\r')), "\n");
        assert_eq!(prefix_for(u16::from(b'x')), "\r\n");
        assert_eq!(prefix_for(NO_BYTE), "");
    }

    #[test]
    fn tracking_writer_records_last_byte() {
        let last = Arc::new(AtomicU16::new(NO_BYTE));
        let mut w = TrackingWriter {
            inner: Vec::new(),
            last: Arc::clone(&last),
        };
        w.write_all(b"hello\r\nworld").unwrap();
        assert_eq!(last.load(Ordering::Relaxed), u16::from(b'd'));
        w.write_all(b"line\n").unwrap();
        assert_eq!(last.load(Ordering::Relaxed), u16::from(b'\n'));
    }

    #[test]
    fn empty_write_keeps_previous_byte() {
        let last = Arc::new(AtomicU16::new(NO_BYTE));
        let mut w = TrackingWriter {
            inner: Vec::new(),
            last: Arc::clone(&last),
        };
        w.write_all(b"").unwrap();
        assert_eq!(last.load(Ordering::Relaxed), NO_BYTE);
    }
}
