//! The `run` verb: deploy a payload (or replay the stored deployment) and
//! run it as a service. Carries the locked-flag enforcement and the
//! content-hash short-circuit.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::classify::{self, PayloadKind};
use crate::command;
use crate::error::Error;
use crate::exec::{self, StdinSource};
use crate::hash::{self, ArtifactHashes};
use crate::payload::{self, PayloadSource};
use crate::project::{ProjectStore, ServiceEntry, ServiceKind};
use crate::resolve::Target;
use crate::rpc::ExecRequest;

/// Flags the client consumes; `--net` and `--ts-tags` are also forwarded
/// and locked.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub net: Option<String>,
    pub ts_tags: Option<String>,
    pub env_file: Option<String>,
    pub force: bool,
}

/// A parsed `run` invocation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunInvocation {
    pub qualifier: Option<String>,
    pub payload: Option<String>,
    pub flags: RunFlags,
    /// Tokens forwarded to the agent after "run" and stored in the
    /// project entry: locked flags, then `--` and the app args.
    pub args_tail: Vec<String>,
}

/// Split `[service[@host]] [flags…] [payload] [-- app-args]`.
///
/// A single positional is a payload when it names an existing file or an
/// image reference, otherwise the service to replay.
pub fn parse_args(args: &[String]) -> Result<RunInvocation, Error> {
    let (head, tail) = match args.iter().position(|a| a == "--") {
        Some(idx) => (&args[..idx], Some(args[idx + 1..].to_vec())),
        None => (args, None),
    };

    let mut invocation = RunInvocation::default();
    let mut positionals: Vec<String> = Vec::new();
    let mut forwarded: Vec<String> = Vec::new();

    let mut iter = head.iter();
    while let Some(token) = iter.next() {
        let mut flag_value = |name: &str| -> Result<String, Error> {
            if let Some(value) = token.strip_prefix(&format!("{name}=")) {
                return Ok(value.to_string());
            }
            iter.next()
                .cloned()
                .ok_or_else(|| Error::InvalidAssignment(format!("{name} needs a value")))
        };

        if token == "--force" {
            invocation.flags.force = true;
        } else if token == "--net" || token.starts_with("--net=") {
            let value = flag_value("--net")?;
            invocation.flags.net = Some(value);
        } else if token == "--ts-tags" || token.starts_with("--ts-tags=") {
            let value = flag_value("--ts-tags")?;
            invocation.flags.ts_tags = Some(value);
        } else if token == "--env" || token.starts_with("--env=") {
            let value = flag_value("--env")?;
            invocation.flags.env_file = Some(value);
        } else if token.starts_with('-') && token != "-" {
            // Unknown run flags ride through to the agent untouched.
            forwarded.push(token.clone());
        } else {
            positionals.push(token.clone());
        }
    }

    match positionals.len() {
        0 => {}
        1 => {
            let only = positionals.remove(0);
            if Path::new(&only).exists() || classify::is_image_reference(&only) {
                invocation.payload = Some(only);
            } else {
                invocation.qualifier = Some(only);
            }
        }
        2 => {
            invocation.payload = Some(positionals.remove(1));
            invocation.qualifier = Some(positionals.remove(0));
        }
        n => {
            return Err(Error::InvalidAssignment(format!(
                "expected at most service and payload, got {n} positional arguments"
            )));
        }
    }

    // Rebuild the forwarded tail: locked flags first, then the rest, then
    // the app-args separator.
    let mut args_tail = Vec::new();
    if let Some(net) = &invocation.flags.net {
        args_tail.push("--net".to_string());
        args_tail.push(net.clone());
    }
    if let Some(tags) = &invocation.flags.ts_tags {
        args_tail.push("--ts-tags".to_string());
        args_tail.push(tags.clone());
    }
    args_tail.extend(forwarded);
    if let Some(tail) = tail {
        args_tail.push("--".to_string());
        args_tail.extend(tail);
    }
    invocation.args_tail = args_tail;
    Ok(invocation)
}

/// Pull a flag's value out of a stored arg tail, in either `--flag value`
/// or `--flag=value` spelling. Tokens after `--` belong to the app.
pub fn extract_flag(args: &[String], name: &str) -> Option<String> {
    let mut iter = args.iter();
    while let Some(token) = iter.next() {
        if token == "--" {
            return None;
        }
        if token == name {
            return iter.next().cloned();
        }
        if let Some(value) = token.strip_prefix(&format!("{name}=")) {
            return Some(value.to_string());
        }
    }
    None
}

/// Locked-flag rule: once recorded, a value can be repeated or omitted
/// (it is inherited) but never changed. Returns the effective value.
pub fn check_locked(
    flag: &'static str,
    stored: Option<&str>,
    given: Option<&str>,
) -> Result<Option<String>, Error> {
    match (stored, given) {
        (Some(s), Some(g)) if s != g => Err(Error::LockedFlagMismatch {
            flag,
            stored: s.to_string(),
            given: g.to_string(),
        }),
        (Some(s), _) => Ok(Some(s.to_string())),
        (None, g) => Ok(g.map(str::to_string)),
    }
}

/// What the hash comparison decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployAction {
    /// Remote already holds these bytes.
    NoOp,
    /// Payload unchanged, env file changed.
    EnvOnly,
    /// Upload the payload.
    Full,
}

/// The short-circuit: skip the upload when the remote already holds
/// byte-identical content. A first deployment (nothing found remotely)
/// always ships.
pub fn decide(
    remote: &ArtifactHashes,
    local_payload: &str,
    local_env: Option<&str>,
    force: bool,
) -> DeployAction {
    if force {
        return DeployAction::Full;
    }
    let Some(remote_payload) = remote.payload.as_ref().filter(|_| remote.found) else {
        return DeployAction::Full;
    };
    if remote_payload.sha256 != local_payload {
        return DeployAction::Full;
    }
    let env_matches = match (remote.env.as_ref(), local_env) {
        (None, None) => true,
        (Some(r), Some(l)) => r.sha256 == l,
        _ => false,
    };
    if env_matches {
        DeployAction::NoOp
    } else if local_env.is_some() {
        DeployAction::EnvOnly
    } else {
        // Remote has an env file we no longer track; payload is what we
        // manage, so leave it alone.
        DeployAction::NoOp
    }
}

/// Minimal compose document wrapping a container image: the service's
/// working directory mounts at /data.
pub fn compose_for_image(service: &str, image: &str) -> String {
    format!(
        "services:\n  {service}:\n    image: {image}\n    restart: unless-stopped\n    volumes:\n      - ./:/data\n"
    )
}

pub fn run(args: &[String]) -> Result<()> {
    let invocation = parse_args(args)?;
    let (target, mut project) = command::resolve_target(invocation.qualifier.as_deref())?;
    let entry = project.get(&target.service, &target.host).cloned();

    // Locked flags are validated before anything touches the network or
    // the store.
    let stored_args = entry.as_ref().map(|e| e.args.as_slice()).unwrap_or(&[]);
    let net = check_locked(
        "--net",
        extract_flag(stored_args, "--net").as_deref(),
        invocation.flags.net.as_deref(),
    )?;
    let ts_tags = check_locked(
        "--ts-tags",
        extract_flag(stored_args, "--ts-tags").as_deref(),
        invocation.flags.ts_tags.as_deref(),
    )?;
    let args_tail = with_locked_flags(invocation.args_tail, net.as_deref(), ts_tags.as_deref());

    // Figure out what we are shipping.
    let (source, replay_args) = match &invocation.payload {
        Some(arg) => (payload::resolve_source(arg)?, None),
        None => {
            let entry = entry.as_ref().ok_or_else(|| {
                Error::MissingService(format!("{} (nothing stored to replay)", target.service))
            })?;
            let path = project.dir().join(&entry.payload);
            let source = if path.exists() {
                PayloadSource::File(path)
            } else if classify::is_image_reference(&entry.payload) {
                PayloadSource::Image(entry.payload.clone())
            } else {
                PayloadSource::File(path)
            };
            (source, Some(entry.args.clone()))
        }
    };
    // Replays reuse the stored tail; newly given locked flags still land.
    let args_tail = match replay_args {
        Some(stored) => with_locked_flags(stored, net.as_deref(), ts_tags.as_deref()),
        None => args_tail,
    };

    let env_path: Option<PathBuf> = invocation
        .flags
        .env_file
        .clone()
        .map(PathBuf::from)
        .or_else(|| {
            entry
                .as_ref()
                .and_then(|e| e.env_file.as_ref())
                .map(|p| project.dir().join(p))
        });

    let mut client = command::connect(&target.host)?;
    let host_info = client.info()?;

    match source {
        PayloadSource::File(path) => {
            let kind = classify::detect(&path, &host_info.os, &host_info.arch)?;
            if kind == PayloadKind::Dockerfile {
                let tag = command::docker::build_image(
                    &path.display().to_string(),
                    &target.service,
                    &host_info.os,
                    &host_info.arch,
                )?;
                let pushed = command::docker::push_image(&tag, &target.service, &target.host)?;
                let stored = project.relativize(&path);
                return deploy_image(
                    client,
                    &target,
                    &mut project,
                    &pushed,
                    stored,
                    args_tail,
                    invocation.flags.env_file.as_deref(),
                );
            }
            deploy_file(
                client,
                &target,
                &mut project,
                &path,
                kind,
                env_path.as_deref(),
                args_tail,
                invocation.flags.force,
                invocation.flags.env_file.as_deref(),
            )
        }
        PayloadSource::Image(image) => {
            if command::docker::image_exists_locally(&image) {
                let pushed =
                    command::docker::push_image(&image, &target.service, &target.host)?;
                let stored = image.clone();
                return deploy_image(
                    client,
                    &target,
                    &mut project,
                    &pushed,
                    stored,
                    args_tail,
                    invocation.flags.env_file.as_deref(),
                );
            }
            let stored = image.clone();
            deploy_image(
                client,
                &target,
                &mut project,
                &image,
                stored,
                args_tail,
                invocation.flags.env_file.as_deref(),
            )
        }
    }
}

/// Re-apply inherited locked flags to the front of the forwarded tail.
fn with_locked_flags(
    tail: Vec<String>,
    net: Option<&str>,
    ts_tags: Option<&str>,
) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(net) = net
        && extract_flag(&tail, "--net").is_none()
    {
        out.push("--net".to_string());
        out.push(net.to_string());
    }
    if let Some(tags) = ts_tags
        && extract_flag(&tail, "--ts-tags").is_none()
    {
        out.push("--ts-tags".to_string());
        out.push(tags.to_string());
    }
    out.extend(tail);
    out
}

#[allow(clippy::too_many_arguments)]
fn deploy_file(
    mut client: crate::rpc::RpcClient,
    target: &Target,
    project: &mut ProjectStore,
    path: &Path,
    kind: PayloadKind,
    env_path: Option<&Path>,
    args_tail: Vec<String>,
    force: bool,
    env_flag: Option<&str>,
) -> Result<()> {
    let remote = client.artifact_hashes(&target.service)?;
    let local_payload = hash::sha256_file(path)?;
    let local_env = env_path.map(hash::sha256_file).transpose()?;

    let action = decide(&remote, &local_payload, local_env.as_deref(), force);
    debug!(?action, service = %target.service, "deploy decision");

    match action {
        DeployAction::NoOp => {
            println!(
                "{} on {} is up to date",
                target.service, target.host
            );
            return Ok(());
        }
        DeployAction::EnvOnly => {
            let env_path = env_path.expect("env change implies an env file");
            info!(service = %target.service, env = %env_path.display(), "env file changed, payload unchanged");
            let reader = std::fs::File::open(env_path).map_err(|e| Error::EncodeFailed {
                path: env_path.display().to_string(),
                source: e,
            })?;
            let name = env_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| ".env".to_string());

            let cancel = CancelToken::new();
            cancel.arm_ctrlc()?;
            exec::run(
                client,
                ExecRequest {
                    service: target.service.clone(),
                    args: vec!["env".to_string(), "copy".to_string()],
                    ..Default::default()
                },
                StdinSource::Payload(Box::new(reader), name),
                &cancel,
            )?;
        }
        DeployAction::Full => {
            let encoded = payload::open(path, kind)?;
            let name = encoded.name().to_string();
            let mut remote_args = vec!["run".to_string()];
            remote_args.extend(args_tail.iter().cloned());
            info!(service = %target.service, %kind, payload = %path.display(), "deploying");

            let cancel = CancelToken::new();
            cancel.arm_ctrlc()?;
            exec::run(
                client,
                ExecRequest {
                    service: target.service.clone(),
                    args: remote_args,
                    ..Default::default()
                },
                StdinSource::Payload(Box::new(encoded), name),
                &cancel,
            )?;
        }
    }

    // The store changes only after the remote call succeeded.
    project.set_entry(ServiceEntry {
        name: target.service.clone(),
        host: target.host.clone(),
        kind: ServiceKind::Empty,
        payload: project.relativize(path),
        env_file: env_flag.map(|p| project.relativize(Path::new(p))),
        schedule: None,
        args: args_tail,
    });
    project.save()?;
    println!("Deployed {} to {}", target.service, target.host);
    Ok(())
}

/// Ship an image reference as a generated compose payload.
fn deploy_image(
    client: crate::rpc::RpcClient,
    target: &Target,
    project: &mut ProjectStore,
    image: &str,
    stored_payload: String,
    args_tail: Vec<String>,
    env_flag: Option<&str>,
) -> Result<()> {
    let compose = compose_for_image(&target.service, image);
    info!(service = %target.service, image, "deploying image via compose");

    let mut remote_args = vec!["run".to_string()];
    remote_args.extend(args_tail.iter().cloned());

    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    exec::run(
        client,
        ExecRequest {
            service: target.service.clone(),
            args: remote_args,
            ..Default::default()
        },
        StdinSource::Payload(
            Box::new(Cursor::new(compose.into_bytes())),
            "docker-compose.yml".to_string(),
        ),
        &cancel,
    )?;

    project.set_entry(ServiceEntry {
        name: target.service.clone(),
        host: target.host.clone(),
        kind: ServiceKind::Empty,
        payload: stored_payload,
        env_file: env_flag.map(|p| project.relativize(Path::new(p))),
        schedule: None,
        args: args_tail,
    });
    project.save()?;
    println!("Deployed {} to {}", target.service, target.host);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ArtifactHash;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn hashes(payload: Option<&str>, env: Option<&str>) -> ArtifactHashes {
        ArtifactHashes {
            found: true,
            payload: payload.map(|h| ArtifactHash {
                kind: "binary".into(),
                sha256: h.into(),
            }),
            env: env.map(|h| ArtifactHash {
                kind: "env".into(),
                sha256: h.into(),
            }),
        }
    }

    // ── Argument parsing ────────────────────────────────────────────────

    #[test]
    fn service_and_payload_with_app_args() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("app");
        std::fs::write(&payload, b"x").unwrap();
        let payload_str = payload.display().to_string();

        let inv = parse_args(&strings(&["svc-a", &payload_str, "--", "-v"])).unwrap();
        assert_eq!(inv.qualifier.as_deref(), Some("svc-a"));
        assert_eq!(inv.payload.as_deref(), Some(payload_str.as_str()));
        assert_eq!(inv.args_tail, vec!["--", "-v"]);
    }

    #[test]
    fn lone_service_token_means_replay() {
        let inv = parse_args(&strings(&["svc-a", "--force"])).unwrap();
        assert_eq!(inv.qualifier.as_deref(), Some("svc-a"));
        assert!(inv.payload.is_none());
        assert!(inv.flags.force);
        assert!(inv.args_tail.is_empty());
    }

    #[test]
    fn lone_existing_file_is_a_payload() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("app.sh");
        std::fs::write(&payload, b"#!/bin/sh\n").unwrap();
        let payload_str = payload.display().to_string();

        let inv = parse_args(&strings(&[&payload_str])).unwrap();
        assert!(inv.qualifier.is_none());
        assert_eq!(inv.payload.as_deref(), Some(payload_str.as_str()));
    }

    #[test]
    fn lone_image_reference_is_a_payload() {
        let inv = parse_args(&strings(&["ghcr.io/x/y:tag"])).unwrap();
        assert_eq!(inv.payload.as_deref(), Some("ghcr.io/x/y:tag"));
        assert!(inv.qualifier.is_none());
    }

    #[test]
    fn locked_flags_are_parsed_and_forwarded() {
        let inv = parse_args(&strings(&[
            "svc", "--net=host", "--ts-tags", "tag:prod", "--", "-v",
        ]))
        .unwrap();
        assert_eq!(inv.flags.net.as_deref(), Some("host"));
        assert_eq!(inv.flags.ts_tags.as_deref(), Some("tag:prod"));
        assert_eq!(
            inv.args_tail,
            vec!["--net", "host", "--ts-tags", "tag:prod", "--", "-v"]
        );
    }

    #[test]
    fn force_and_env_are_client_side_only() {
        let inv = parse_args(&strings(&["svc", "--force", "--env", ".env"])).unwrap();
        assert!(inv.flags.force);
        assert_eq!(inv.flags.env_file.as_deref(), Some(".env"));
        assert!(inv.args_tail.is_empty());
    }

    // ── Locked flags ────────────────────────────────────────────────────

    #[test]
    fn locked_flag_same_value_passes() {
        let v = check_locked("--net", Some("host"), Some("host")).unwrap();
        assert_eq!(v.as_deref(), Some("host"));
    }

    #[test]
    fn locked_flag_changed_value_fails() {
        let err = check_locked("--net", Some("host"), Some("bridge")).unwrap_err();
        match err {
            Error::LockedFlagMismatch {
                flag,
                stored,
                given,
            } => {
                assert_eq!(flag, "--net");
                assert_eq!(stored, "host");
                assert_eq!(given, "bridge");
            }
            other => panic!("expected LockedFlagMismatch, got {other:?}"),
        }
    }

    #[test]
    fn locked_flag_omission_inherits() {
        let v = check_locked("--net", Some("host"), None).unwrap();
        assert_eq!(v.as_deref(), Some("host"));
        let tail = with_locked_flags(vec!["--".to_string(), "-v".to_string()], Some("host"), None);
        assert_eq!(tail, vec!["--net", "host", "--", "-v"]);
    }

    #[test]
    fn extract_flag_reads_both_spellings_and_stops_at_dashdash() {
        let args = strings(&["--net", "host", "--ts-tags=a,b", "--", "--net", "other"]);
        assert_eq!(extract_flag(&args, "--net").as_deref(), Some("host"));
        assert_eq!(extract_flag(&args, "--ts-tags").as_deref(), Some("a,b"));
        let app_only = strings(&["--", "--net", "x"]);
        assert_eq!(extract_flag(&app_only, "--net"), None);
    }

    // ── Hash short-circuit ──────────────────────────────────────────────

    #[test]
    fn identical_hashes_no_op() {
        let remote = hashes(Some("aaa"), Some("eee"));
        assert_eq!(decide(&remote, "aaa", Some("eee"), false), DeployAction::NoOp);
    }

    #[test]
    fn identical_hashes_with_force_deploys() {
        let remote = hashes(Some("aaa"), None);
        assert_eq!(decide(&remote, "aaa", None, true), DeployAction::Full);
    }

    #[test]
    fn env_change_alone_triggers_env_copy() {
        let remote = hashes(Some("aaa"), Some("eee"));
        assert_eq!(
            decide(&remote, "aaa", Some("different"), false),
            DeployAction::EnvOnly
        );
        // Env newly added locally counts as a change too.
        let remote = hashes(Some("aaa"), None);
        assert_eq!(
            decide(&remote, "aaa", Some("new"), false),
            DeployAction::EnvOnly
        );
    }

    #[test]
    fn payload_change_always_runs() {
        let remote = hashes(Some("aaa"), Some("eee"));
        assert_eq!(decide(&remote, "bbb", Some("eee"), false), DeployAction::Full);
        assert_eq!(
            decide(&remote, "bbb", Some("zzz"), false),
            DeployAction::Full
        );
    }

    #[test]
    fn first_deploy_ships_unconditionally() {
        let remote = ArtifactHashes::default();
        assert_eq!(decide(&remote, "aaa", None, false), DeployAction::Full);
        // found=true but no payload hash recorded: still deploy.
        let remote = ArtifactHashes {
            found: true,
            payload: None,
            env: None,
        };
        assert_eq!(decide(&remote, "aaa", None, false), DeployAction::Full);
    }

    #[test]
    fn both_envs_absent_match() {
        let remote = hashes(Some("aaa"), None);
        assert_eq!(decide(&remote, "aaa", None, false), DeployAction::NoOp);
    }

    // ── Compose generation ──────────────────────────────────────────────

    #[test]
    fn image_compose_is_valid_and_mounts_data() {
        let compose = compose_for_image("svc-a", "ghcr.io/x/y:tag");
        let doc: serde_yaml::Value = serde_yaml::from_str(&compose).unwrap();
        let service = &doc["services"]["svc-a"];
        assert_eq!(service["image"], "ghcr.io/x/y:tag");
        let volumes = service["volumes"].as_sequence().unwrap();
        assert_eq!(volumes[0], "./:/data");
    }
}
