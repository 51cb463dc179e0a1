//! `copy`: rsync-like transfer between the local filesystem and a
//! service's data root.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::cancel::CancelToken;
use crate::command;
use crate::error::Error;
use crate::exec::{self, StdinSource};
use crate::rpc::ExecRequest;
use crate::transfer::{
    self, Endpoint, Mode, parse_endpoint, pipe, read_header, receive_into, render_footer,
};

#[derive(Args)]
pub struct CopyArgs {
    /// Source, local path or [service[@host]]:path
    pub src: String,
    /// Destination, local path or [service[@host]]:path
    pub dst: String,

    /// Archive mode (implies -r, wraps content in tar)
    #[arg(short = 'a')]
    pub archive: bool,

    /// Recurse into directories
    #[arg(short = 'r', short_alias = 'R')]
    pub recursive: bool,

    /// Compress the stream with gzip
    #[arg(short = 'z')]
    pub compress: bool,

    /// Per-entry progress and the transfer summary
    #[arg(short = 'v')]
    pub verbose: bool,
}

fn remote_parts(endpoint: &Endpoint) -> (Option<&str>, Option<&str>, &str) {
    match endpoint {
        Endpoint::Remote {
            service,
            host,
            path,
        } => (service.as_deref(), host.as_deref(), path.as_str()),
        Endpoint::Local(_) => unreachable!("checked by caller"),
    }
}

/// Resolve the target for a remote endpoint, folding a `svc@host`
/// qualifier back together for the shared resolution path.
fn resolve_endpoint(service: Option<&str>, host: Option<&str>) -> Result<crate::resolve::Target> {
    let arg = match (service, host) {
        (Some(s), Some(h)) => Some(format!("{s}@{h}")),
        (Some(s), None) => Some(s.to_string()),
        (None, Some(h)) => Some(format!("@{h}")),
        (None, None) => None,
    };
    let (target, _project) = command::resolve_target(arg.as_deref())?;
    Ok(target)
}

pub fn run(args: CopyArgs) -> Result<()> {
    let src = parse_endpoint(&args.src)?;
    let dst = parse_endpoint(&args.dst)?;
    let archive = args.archive || args.recursive;

    match (src.is_remote(), dst.is_remote()) {
        (false, true) => upload(&args, &src, &dst, archive),
        (true, false) => download(&args, &src, &dst),
        (false, false) => Err(Error::InvalidEndpoint {
            endpoint: format!("{} {}", args.src, args.dst),
            reason: "one endpoint must be remote".to_string(),
        }
        .into()),
        (true, true) => Err(Error::InvalidEndpoint {
            endpoint: format!("{} {}", args.src, args.dst),
            reason: "host-to-host copies are not supported".to_string(),
        }
        .into()),
    }
}

fn upload(args: &CopyArgs, src: &Endpoint, dst: &Endpoint, archive: bool) -> Result<()> {
    let Endpoint::Local(local) = src else {
        unreachable!()
    };
    let (service, host, remote_path) = remote_parts(dst);
    let target = resolve_endpoint(service, host)?;

    let is_dir = local.is_dir();
    let mode = Mode::from_flags(archive, args.compress, is_dir);
    let trailing_slash = args.src.ends_with('/');
    let total_size = tree_size(local)?;
    info!(src = %local.display(), dst = %remote_path, mode = mode.wire_name(), "uploading");

    let started = Instant::now();
    let (reader, producer) = transfer::open_upload(local, trailing_slash, mode, args.verbose)?;

    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    let client = command::connect(&target.host)?;
    exec::run(
        client,
        ExecRequest {
            service: target.service.clone(),
            args: vec![
                "copy".to_string(),
                "--in".to_string(),
                format!("--mode={}", mode.wire_name()),
                remote_path.to_string(),
            ],
            ..Default::default()
        },
        StdinSource::Payload(Box::new(reader), base_name(local)),
        &cancel,
    )?;

    let sent = producer
        .join()
        .map_err(|_| Error::RpcProtocol("copy producer panicked".to_string()))?
        .map_err(|e| Error::EncodeFailed {
            path: local.display().to_string(),
            source: std::io::Error::other(e),
        })?;

    if args.verbose {
        eprintln!(
            "{}",
            render_footer(sent, 0, total_size, started.elapsed().as_secs_f64())
        );
    }
    Ok(())
}

fn download(args: &CopyArgs, src: &Endpoint, dst: &Endpoint) -> Result<()> {
    let Endpoint::Local(local) = dst else {
        unreachable!()
    };
    let (service, host, remote_path) = remote_parts(src);
    let target = resolve_endpoint(service, host)?;
    info!(src = %remote_path, dst = %local.display(), "downloading");

    let started = Instant::now();
    let (mut writer, reader) = pipe();
    let received = transfer::Counter::default();

    let consumer = {
        let local = local.clone();
        let compressed = args.compress;
        let received = received.clone();
        std::thread::Builder::new()
            .name("yeet-copy-consumer".into())
            .spawn(move || -> Result<std::path::PathBuf, Error> {
                let mut counted = transfer::CountingReader::new(reader, received);
                let header = read_header(&mut counted)?;
                receive_into(&header, counted, &local, compressed)
            })?
    };

    // The remote's bytes flow into the pipe, not the terminal, so this
    // bypasses the PTY-aware wrapper and drives the transport directly.
    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    let client = command::connect(&target.host)?;
    let exec_result = client.exec(
        &ExecRequest {
            service: target.service.clone(),
            args: vec![
                "copy".to_string(),
                "--out".to_string(),
                format!(
                    "--mode={}",
                    if args.compress {
                        Mode::ArchiveGz.wire_name()
                    } else {
                        Mode::Archive.wire_name()
                    }
                ),
                remote_path.to_string(),
            ],
            ..Default::default()
        },
        Box::new(std::io::empty()),
        &mut writer,
        std::sync::mpsc::channel::<(u16, u16)>().1,
        &cancel,
    );
    // EOF for the consumer regardless of how exec ended.
    drop(writer);
    let commit = consumer
        .join()
        .map_err(|_| Error::RpcProtocol("copy consumer panicked".to_string()))?;

    match exec_result {
        Ok(0) => {}
        Ok(code) => return Err(Error::RemoteExit { code, prefix: "" }.into()),
        Err(e) => return Err(e.into()),
    }
    let final_path = commit?;

    if args.verbose {
        eprintln!("{}", final_path.display());
        eprintln!(
            "{}",
            render_footer(0, received.get(), received.get(), started.elapsed().as_secs_f64())
        );
    }
    Ok(())
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Uncompressed size of the source, for the speedup line.
fn tree_size(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        total += tree_size(&entry.path())?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_flags_parse_rsync_style() {
        use clap::Parser;
        #[derive(Parser)]
        struct Harness {
            #[command(flatten)]
            copy: CopyArgs,
        }

        let h = Harness::parse_from(["copy", "-avz", "src", "svc:dst"]);
        assert!(h.copy.archive);
        assert!(h.copy.verbose);
        assert!(h.copy.compress);
        assert!(!h.copy.recursive);

        let h = Harness::parse_from(["copy", "-R", "src", "svc:dst"]);
        assert!(h.copy.recursive);
    }

    #[test]
    fn local_to_local_is_rejected() {
        let args = CopyArgs {
            src: "a".into(),
            dst: "b".into(),
            archive: false,
            recursive: false,
            compress: false,
            verbose: false,
        };
        let err = run(args).unwrap_err();
        assert!(err.to_string().contains("one endpoint must be remote"));
    }

    #[test]
    fn tree_size_sums_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"12345").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), b"123").unwrap();
        assert_eq!(tree_size(dir.path()).unwrap(), 8);
    }
}
