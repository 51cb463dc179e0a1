//! Copy engine: rsync-like duplex transfer between the local filesystem
//! and a service's data root on the host.
//!
//! Uploads stream a file verbatim or a (optionally gzipped) tar produced
//! by a background thread through an in-process pipe. Downloads arrive as
//! a tiny JSON header followed by a tar stream, extract into a sibling
//! temp directory, and commit with a single rename.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;

// ── Endpoints ───────────────────────────────────────────────────────────

/// One side of a copy: a local path or a `[service[@host]]:path` remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Remote {
        service: Option<String>,
        host: Option<String>,
        path: String,
    },
}

impl Endpoint {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Windows-style drive letter (`C:\...` or `C:/...` or bare `C:`); always
/// a local path, never a remote qualifier.
fn is_drive_letter(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'/' || bytes[2] == b'\\')
}

/// Parse an endpoint. Remote paths are always relative to the service
/// data root; a `data/` prefix is stripped so the root can be addressed
/// idiomatically.
pub fn parse_endpoint(s: &str) -> Result<Endpoint, Error> {
    let invalid = |reason: &str| Error::InvalidEndpoint {
        endpoint: s.to_string(),
        reason: reason.to_string(),
    };

    if is_drive_letter(s) {
        return Ok(Endpoint::Local(PathBuf::from(s)));
    }
    let Some((qualifier, path)) = s.split_once(':') else {
        return Ok(Endpoint::Local(PathBuf::from(s)));
    };

    if path.starts_with('/') {
        return Err(invalid("remote paths must be relative"));
    }

    let (service, host) = match qualifier {
        "" => (None, None),
        q => {
            let (service, host) = crate::resolve::split_qualifier(q);
            let service = (!service.is_empty()).then(|| service.to_string());
            let host = host.filter(|h| !h.is_empty()).map(str::to_string);
            (service, host)
        }
    };

    let path = strip_data_prefix(path).to_string();
    Ok(Endpoint::Remote {
        service,
        host,
        path,
    })
}

/// Inverse of `parse_endpoint` for remote endpoints.
pub fn format_endpoint(endpoint: &Endpoint) -> String {
    match endpoint {
        Endpoint::Local(path) => path.display().to_string(),
        Endpoint::Remote {
            service,
            host,
            path,
        } => {
            let mut out = String::new();
            if let Some(service) = service {
                out.push_str(service);
            }
            if let Some(host) = host {
                out.push('@');
                out.push_str(host);
            }
            out.push(':');
            out.push_str(path);
            out
        }
    }
}

/// `data` or `data/...` addresses the service data root directly.
fn strip_data_prefix(path: &str) -> &str {
    if path == "data" {
        ""
    } else {
        path.strip_prefix("data/").unwrap_or(path)
    }
}

/// A trailing `/`, or a path of `.` (or nothing), means "into this
/// directory"; otherwise the endpoint names a file.
pub fn names_directory(path: &str) -> bool {
    path.is_empty() || path == "." || path.ends_with('/')
}

// ── Modes ───────────────────────────────────────────────────────────────

/// How the bytes are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Plain,
    Archive,
    ArchiveGz,
}

impl Mode {
    /// Pick a mode from the rsync-idiom flags. `-a` implies archive
    /// framing; `-z` wraps it in gzip.
    pub fn from_flags(archive: bool, compress: bool, source_is_dir: bool) -> Self {
        if archive || source_is_dir {
            if compress {
                Self::ArchiveGz
            } else {
                Self::Archive
            }
        } else if compress {
            Self::ArchiveGz
        } else {
            Self::Plain
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Plain => "file",
            Self::Archive => "tar",
            Self::ArchiveGz => "tar+gz",
        }
    }
}

/// Header the server prefixes onto every download stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHeader {
    pub kind: DownloadKind,
    pub base: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    File,
    Dir,
}

// ── In-process pipe ─────────────────────────────────────────────────────

/// Bounded writer half of an in-process pipe. A producer failure is
/// forwarded so the consumer observes it as a read error. Clones share
/// the same channel.
#[derive(Clone)]
pub struct PipeWriter {
    tx: SyncSender<Result<Vec<u8>, String>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PipeWriter {
    pub fn fail(&self, message: String) {
        let _ = self.tx.send(Err(message));
    }
}

#[derive(Debug)]
pub struct PipeReader {
    rx: Receiver<Result<Vec<u8>, String>>,
    pending: Vec<u8>,
    offset: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.pending.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Ok(Err(message)) => {
                    return Err(io::Error::other(message));
                }
                // Producer hung up: EOF.
                Err(_) => return Ok(0),
            }
        }
        let n = (self.pending.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(16);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        },
    )
}

// ── Counting ────────────────────────────────────────────────────────────

/// Shared byte counter threaded through readers/writers for the verbose
/// footer.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

pub struct CountingReader<R> {
    inner: R,
    counter: Counter,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, counter: Counter) -> Self {
        Self { inner, counter }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.add(n as u64);
        Ok(n)
    }
}

/// The rsync-style transfer summary.
pub fn render_footer(sent: u64, received: u64, total_size: u64, elapsed_secs: f64) -> String {
    let rate = if elapsed_secs > 0.0 {
        (sent + received) as f64 / elapsed_secs
    } else {
        (sent + received) as f64
    };
    let shipped = (sent + received).max(1);
    let speedup = total_size as f64 / shipped as f64;
    format!(
        "sent {sent} bytes  received {received} bytes  {rate:.2} bytes/sec\ntotal size is {total_size}  speedup is {speedup:.2}"
    )
}

// ── Upload framing ──────────────────────────────────────────────────────

/// Callback invoked once per tar entry as it is written.
pub type EntryProgress<'a> = &'a mut dyn FnMut(&str, u64);

/// Build the upload stream for `source` in a background thread, returning
/// the read half. Directory sources always become a tar; the wrapping
/// directory is the source basename unless the endpoint ended with a
/// trailing slash, in which case contents are sent bare.
pub fn open_upload(
    source: &Path,
    trailing_slash: bool,
    mode: Mode,
    verbose: bool,
) -> Result<(PipeReader, thread::JoinHandle<Result<u64, String>>), Error> {
    let meta = fs::metadata(source).map_err(|e| Error::EncodeFailed {
        path: source.display().to_string(),
        source: e,
    })?;
    let is_dir = meta.is_dir();
    if is_dir && mode == Mode::Plain {
        return Err(Error::InvalidEndpoint {
            endpoint: source.display().to_string(),
            reason: "directories need archive mode (-r/-a)".to_string(),
        });
    }

    let (writer, reader) = pipe();
    let source = source.to_path_buf();
    let handle = thread::Builder::new()
        .name("yeet-copy-producer".into())
        .spawn(move || {
            let result = produce(&source, is_dir, trailing_slash, mode, verbose, &writer);
            if let Err(e) = &result {
                writer.fail(e.clone());
            }
            result
        })
        .map_err(|e| Error::EncodeFailed {
            path: "copy producer".to_string(),
            source: io::Error::other(e),
        })?;

    Ok((reader, handle))
}

fn produce(
    source: &Path,
    is_dir: bool,
    trailing_slash: bool,
    mode: Mode,
    verbose: bool,
    writer: &PipeWriter,
) -> Result<u64, String> {
    let total = Counter::default();
    let mut progress = |name: &str, _size: u64| {
        if verbose {
            eprintln!("{name}");
        }
    };

    let fail = |e: io::Error| e.to_string();
    let out: Box<dyn Write> = match mode {
        Mode::Plain | Mode::Archive => Box::new(writer.clone()),
        Mode::ArchiveGz => Box::new(GzEncoder::new(writer.clone(), Compression::default())),
    };

    match mode {
        Mode::Plain => {
            let mut file = fs::File::open(source).map_err(fail)?;
            let mut out = out;
            let copied = io::copy(
                &mut CountingReader::new(&mut file, total.clone()),
                &mut out,
            )
            .map_err(fail)?;
            progress(&display_name(source), copied);
            out.flush().map_err(fail)?;
            Ok(total.get())
        }
        Mode::Archive | Mode::ArchiveGz => {
            write_tar(
                source,
                is_dir,
                trailing_slash,
                out,
                total.clone(),
                &mut progress,
            )?;
            Ok(total.get())
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Write `source` as a tar stream: a directory tree (prefixed by the
/// basename unless `trailing_slash`), or a single-entry tar for a file.
fn write_tar(
    source: &Path,
    is_dir: bool,
    trailing_slash: bool,
    out: Box<dyn Write + '_>,
    counter: Counter,
    progress: EntryProgress<'_>,
) -> Result<(), String> {
    let fail = |e: io::Error| e.to_string();
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);

    if is_dir {
        let prefix = if trailing_slash {
            PathBuf::from(".")
        } else {
            PathBuf::from(display_name(source))
        };
        append_dir(&mut builder, source, &prefix, &counter, progress)?;
    } else {
        let name = display_name(source);
        append_file(&mut builder, source, Path::new(&name), &counter, progress)?;
    }

    let out = builder.into_inner().map_err(fail)?;
    // Dropping the writer finishes any gzip trailer.
    drop(out);
    Ok(())
}

fn append_file(
    builder: &mut tar::Builder<Box<dyn Write + '_>>,
    path: &Path,
    name: &Path,
    counter: &Counter,
    progress: EntryProgress<'_>,
) -> Result<(), String> {
    let fail = |e: io::Error| e.to_string();
    let file = fs::File::open(path).map_err(fail)?;
    let meta = file.metadata().map_err(fail)?;
    progress(&name.display().to_string(), meta.len());

    let mut header = tar::Header::new_gnu();
    header.set_metadata(&meta);
    header.set_cksum();
    builder
        .append_data(
            &mut header,
            name,
            CountingReader::new(file, counter.clone()),
        )
        .map_err(fail)
}

/// Recursive directory append with per-entry progress. `tar`'s own
/// append_dir_all exists, but walking by hand is what lets each entry
/// report as it ships.
fn append_dir(
    builder: &mut tar::Builder<Box<dyn Write + '_>>,
    dir: &Path,
    prefix: &Path,
    counter: &Counter,
    progress: EntryProgress<'_>,
) -> Result<(), String> {
    let fail = |e: io::Error| e.to_string();
    if prefix != Path::new(".") {
        builder.append_dir(prefix, dir).map_err(fail)?;
    }

    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(fail)?
        .collect::<Result<_, _>>()
        .map_err(fail)?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        let meta = entry.metadata().map_err(fail)?;
        if meta.is_dir() {
            append_dir(builder, &path, &name, counter, progress)?;
        } else if meta.is_file() {
            append_file(builder, &path, &name, counter, progress)?;
        }
        // Sockets, fifos and friends are skipped.
    }
    Ok(())
}

// ── Download commit ─────────────────────────────────────────────────────

/// Read the one-line JSON header off the front of a download stream.
pub fn read_header(reader: &mut impl Read) -> Result<DownloadHeader, Error> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).map_err(|e| {
            Error::RpcProtocol(format!("reading download header: {e}"))
        })?;
        if n == 0 {
            return Err(Error::TruncatedStream);
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 4096 {
            return Err(Error::RpcProtocol("download header too long".into()));
        }
    }
    serde_json::from_slice(&line).map_err(|e| Error::RpcProtocol(format!("bad download header: {e}")))
}

/// Extract a downloaded archive next to `dest` and commit with a rename.
/// A failure during extraction deletes the staging tree and leaves the
/// destination untouched.
pub fn receive_into(
    header: &DownloadHeader,
    stream: impl Read,
    dest: &Path,
    compressed: bool,
) -> Result<PathBuf, Error> {
    let parent = dest_parent(dest);
    fs::create_dir_all(&parent).map_err(|e| commit_err(dest, e.into()))?;
    let staging = tempfile::tempdir_in(&parent).map_err(|e| commit_err(dest, e.into()))?;

    let reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(stream))
    } else {
        Box::new(stream)
    };
    let mut archive = tar::Archive::new(reader);
    archive
        .unpack(staging.path())
        .map_err(|e| commit_err(dest, e.into()))?;

    let final_path = match header.kind {
        DownloadKind::File => {
            let file = single_regular_file(staging.path())
                .map_err(|reason| commit_err(dest, anyhow::anyhow!(reason)))?;
            let target = if dest.is_dir() || names_directory(&dest.to_string_lossy()) {
                dest.join(&header.base)
            } else {
                dest.to_path_buf()
            };
            replace_path(&file, &target).map_err(|e| commit_err(dest, e.into()))?;
            target
        }
        DownloadKind::Dir => {
            let source = staging.path().join(&header.base);
            let source = if source.is_dir() {
                source
            } else {
                // Contents were sent bare.
                staging.path().to_path_buf()
            };
            let target = if dest.is_dir() {
                dest.join(&header.base)
            } else {
                dest.to_path_buf()
            };
            replace_path(&source, &target).map_err(|e| commit_err(dest, e.into()))?;
            target
        }
    };
    debug!(dest = %final_path.display(), "download committed");
    Ok(final_path)
}

fn dest_parent(dest: &Path) -> PathBuf {
    if dest.is_dir() {
        dest.to_path_buf()
    } else {
        dest.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn commit_err(dest: &Path, source: anyhow::Error) -> Error {
    Error::ConfigWrite {
        path: dest.display().to_string(),
        source,
    }
}

/// Exactly one regular file must be present for `file`-kind downloads.
fn single_regular_file(dir: &Path) -> Result<PathBuf, String> {
    let mut found = Vec::new();
    collect_files(dir, &mut found).map_err(|e| e.to_string())?;
    match found.as_slice() {
        [one] => Ok(one.clone()),
        [] => Err("archive contained no regular file".to_string()),
        many => Err(format!(
            "expected exactly one file in archive, found {}",
            many.len()
        )),
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if meta.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// The committing rename. Falls back to remove-then-rename when the
/// target already exists (rename replaces files but not directories).
fn replace_path(from: &Path, to: &Path) -> io::Result<()> {
    if to.is_dir() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Endpoints ───────────────────────────────────────────────────────

    #[test]
    fn local_paths_parse_as_local() {
        assert_eq!(
            parse_endpoint("./dir/file").unwrap(),
            Endpoint::Local(PathBuf::from("./dir/file"))
        );
        assert_eq!(
            parse_endpoint("file.txt").unwrap(),
            Endpoint::Local(PathBuf::from("file.txt"))
        );
    }

    #[test]
    fn drive_letters_are_local() {
        assert_eq!(
            parse_endpoint(r"C:\Users\x").unwrap(),
            Endpoint::Local(PathBuf::from(r"C:\Users\x"))
        );
        assert_eq!(
            parse_endpoint("D:/data").unwrap(),
            Endpoint::Local(PathBuf::from("D:/data"))
        );
    }

    #[test]
    fn remote_with_service_and_host() {
        assert_eq!(
            parse_endpoint("svc@host-a:config.yml").unwrap(),
            Endpoint::Remote {
                service: Some("svc".into()),
                host: Some("host-a".into()),
                path: "config.yml".into(),
            }
        );
    }

    #[test]
    fn remote_without_qualifier() {
        assert_eq!(
            parse_endpoint(":logs/app.log").unwrap(),
            Endpoint::Remote {
                service: None,
                host: None,
                path: "logs/app.log".into(),
            }
        );
    }

    #[test]
    fn remote_absolute_path_fails() {
        let err = parse_endpoint("svc:/etc/passwd").unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint { .. }));
    }

    #[test]
    fn data_prefix_is_stripped() {
        match parse_endpoint("svc:data/config.yml").unwrap() {
            Endpoint::Remote { path, .. } => assert_eq!(path, "config.yml"),
            other => panic!("unexpected {other:?}"),
        }
        match parse_endpoint("svc:data").unwrap() {
            Endpoint::Remote { path, .. } => assert_eq!(path, ""),
            other => panic!("unexpected {other:?}"),
        }
        // `database/x` must not lose its prefix.
        match parse_endpoint("svc:database/x").unwrap() {
            Endpoint::Remote { path, .. } => assert_eq!(path, "database/x"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn endpoint_round_trips() {
        for s in [
            "svc@host:path/to/file",
            "svc:path",
            ":path",
            "svc:sub/dir/",
            "svc@host:",
        ] {
            let parsed = parse_endpoint(s).unwrap();
            assert_eq!(parse_endpoint(&format_endpoint(&parsed)).unwrap(), parsed);
        }
    }

    #[test]
    fn directory_naming() {
        assert!(names_directory(""));
        assert!(names_directory("."));
        assert!(names_directory("sub/"));
        assert!(!names_directory("sub/file"));
    }

    // ── Modes ───────────────────────────────────────────────────────────

    #[test]
    fn archive_flag_implies_archive_mode() {
        assert_eq!(Mode::from_flags(true, false, false), Mode::Archive);
        assert_eq!(Mode::from_flags(true, true, false), Mode::ArchiveGz);
        assert_eq!(Mode::from_flags(false, false, false), Mode::Plain);
        // Directories always get archive framing.
        assert_eq!(Mode::from_flags(false, false, true), Mode::Archive);
    }

    // ── Pipe ────────────────────────────────────────────────────────────

    #[test]
    fn pipe_moves_bytes_and_eofs() {
        let (mut w, mut r) = pipe();
        let producer = thread::spawn(move || {
            w.write_all(b"hello ").unwrap();
            w.write_all(b"world").unwrap();
        });
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
        producer.join().unwrap();
    }

    #[test]
    fn pipe_failure_becomes_read_error() {
        let (w, mut r) = pipe();
        w.fail("producer exploded".to_string());
        drop(w);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert!(err.to_string().contains("producer exploded"));
    }

    // ── Upload framing ──────────────────────────────────────────────────

    fn make_tree(root: &Path) {
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(root.join("sub/b.txt"), b"beta").unwrap();
    }

    fn entry_names(bytes: &[u8], compressed: bool) -> Vec<String> {
        let reader: Box<dyn Read> = if compressed {
            Box::new(GzDecoder::new(bytes))
        } else {
            Box::new(bytes)
        };
        let mut archive = tar::Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn directory_upload_wraps_in_basename() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        make_tree(&src);

        let (mut reader, handle) = open_upload(&src, false, Mode::Archive, false).unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        handle.join().unwrap().unwrap();

        let names = entry_names(&bytes, false);
        assert!(names.contains(&"tree/a.txt".to_string()), "{names:?}");
        assert!(names.contains(&"tree/sub/b.txt".to_string()), "{names:?}");
    }

    #[test]
    fn trailing_slash_sends_contents_bare() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        make_tree(&src);

        let (mut reader, handle) = open_upload(&src, true, Mode::Archive, false).unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        handle.join().unwrap().unwrap();

        let names = entry_names(&bytes, false);
        assert!(names.contains(&"./a.txt".to_string()), "{names:?}");
        assert!(!names.iter().any(|n| n.starts_with("tree/")), "{names:?}");
    }

    #[test]
    fn single_file_in_archive_mode_is_single_entry_tar() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("config.yml");
        fs::write(&src, b"key: value\n").unwrap();

        let (mut reader, handle) = open_upload(&src, false, Mode::Archive, false).unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        handle.join().unwrap().unwrap();

        assert_eq!(entry_names(&bytes, false), vec!["config.yml"]);
    }

    #[test]
    fn gzip_mode_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        make_tree(&src);

        let (mut reader, handle) = open_upload(&src, false, Mode::ArchiveGz, false).unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        let sent = handle.join().unwrap().unwrap();
        assert!(sent > 0);

        // Gzip magic, then a valid tar inside.
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        let names = entry_names(&bytes, true);
        assert!(names.contains(&"tree/sub/b.txt".to_string()), "{names:?}");
    }

    #[test]
    fn plain_mode_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        make_tree(&src);
        let err = open_upload(&src, false, Mode::Plain, false).unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint { .. }));
    }

    #[test]
    fn plain_mode_streams_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw.bin");
        fs::write(&src, b"raw bytes").unwrap();

        let (mut reader, handle) = open_upload(&src, false, Mode::Plain, false).unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 9);
        assert_eq!(bytes, b"raw bytes");
    }

    // ── Download commit ─────────────────────────────────────────────────

    fn tar_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *body).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn header_parses_and_leaves_stream_at_tar() {
        let mut stream = Vec::new();
        stream.extend_from_slice(br#"{"kind":"file","base":"config.yml"}"#);
        stream.push(b'\n');
        stream.extend_from_slice(b"rest");

        let mut reader = &stream[..];
        let header = read_header(&mut reader).unwrap();
        assert_eq!(header.kind, DownloadKind::File);
        assert_eq!(header.base, "config.yml");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn file_download_commits_to_named_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("local.yml");
        let archive = tar_of(&[("config.yml", b"key: value\n")]);
        let header = DownloadHeader {
            kind: DownloadKind::File,
            base: "config.yml".into(),
        };

        let path = receive_into(&header, &archive[..], &dest, false).unwrap();
        assert_eq!(path, dest);
        assert_eq!(fs::read(&dest).unwrap(), b"key: value\n");
        // Staging temp is gone.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("local.yml")]);
    }

    #[test]
    fn file_download_into_directory_uses_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tar_of(&[("config.yml", b"x")]);
        let header = DownloadHeader {
            kind: DownloadKind::File,
            base: "config.yml".into(),
        };

        let path = receive_into(&header, &archive[..], dir.path(), false).unwrap();
        assert_eq!(path, dir.path().join("config.yml"));
    }

    #[test]
    fn file_download_requires_exactly_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let archive = tar_of(&[("a", b"1"), ("b", b"2")]);
        let header = DownloadHeader {
            kind: DownloadKind::File,
            base: "a".into(),
        };
        let err = receive_into(&header, &archive[..], &dest, false).unwrap_err();
        assert!(err.to_string().contains("exactly one file"));
        assert!(!dest.exists());
    }

    #[test]
    fn dir_download_moves_into_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("target");
        fs::create_dir_all(&dest).unwrap();

        let archive = tar_of(&[("site/index.html", b"<html>")]);
        let header = DownloadHeader {
            kind: DownloadKind::Dir,
            base: "site".into(),
        };
        let path = receive_into(&header, &archive[..], &dest, false).unwrap();
        assert_eq!(path, dest.join("site"));
        assert!(path.join("index.html").exists());
    }

    #[test]
    fn dir_download_replaces_missing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fresh");

        let archive = tar_of(&[("site/index.html", b"<html>")]);
        let header = DownloadHeader {
            kind: DownloadKind::Dir,
            base: "site".into(),
        };
        let path = receive_into(&header, &archive[..], &dest, false).unwrap();
        assert_eq!(path, dest);
        assert!(dest.join("index.html").exists());
    }

    #[test]
    fn corrupt_archive_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("keep.txt");
        fs::write(&dest, b"original").unwrap();

        let header = DownloadHeader {
            kind: DownloadKind::File,
            base: "keep.txt".into(),
        };
        let garbage = b"this is not a tar stream at all";
        let result = receive_into(&header, &garbage[..], &dest, true);
        assert!(result.is_err());
        assert_eq!(fs::read(&dest).unwrap(), b"original");
    }

    // ── Footer ──────────────────────────────────────────────────────────

    #[test]
    fn footer_reads_like_rsync() {
        let footer = render_footer(1234, 35, 1180, 1.5);
        assert!(footer.starts_with("sent 1234 bytes  received 35 bytes"));
        assert!(footer.contains("bytes/sec"));
        assert!(footer.contains("total size is 1180"));
        assert!(footer.contains("speedup is 0.93"));
    }
}
