//! Container image plumbing: local builds for the remote platform and the
//! pull/update/push pass-throughs for compose services.

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use tracing::info;

use crate::cmd::Cmd;
use crate::command;
use crate::progress;

#[derive(Subcommand)]
pub enum DockerCommands {
    /// Pull the service's images on the host
    Pull,
    /// Pull and restart the service's containers
    Update,
    /// Push a local image into the service-scoped registry
    Push {
        /// Local image reference (e.g. myapp:latest)
        image: String,
    },
}

pub fn run(command: DockerCommands) -> Result<()> {
    match command {
        DockerCommands::Pull => command::forward::run("docker", &["pull".to_string()]),
        DockerCommands::Update => command::forward::run("docker", &["update".to_string()]),
        DockerCommands::Push { image } => {
            let (target, _project) = command::resolve_target(None)?;
            push_image(&image, &target.service, &target.host)?;
            Ok(())
        }
    }
}

fn docker_bin() -> Result<String> {
    which::which("docker")
        .map(|p| p.display().to_string())
        .map_err(|_| anyhow!("docker is not installed or not on PATH"))
}

/// The service-scoped registry address on a host.
pub fn registry_tag(image: &str, service: &str, host: &str) -> String {
    // The agent serves a per-service registry under its own name; the tag
    // part of the source reference is preserved.
    let tag = image.rsplit_once(':').map_or("latest", |(_, t)| t);
    format!("{host}/{service}:{tag}")
}

/// Does the reference resolve against the local docker daemon?
pub fn image_exists_locally(image: &str) -> bool {
    let Ok(docker) = docker_bin() else {
        return false;
    };
    Cmd::new(&docker)
        .args(["image", "inspect", image])
        .run_as_check()
        .unwrap_or(false)
}

/// Build a Dockerfile for the remote platform and return the local tag.
pub fn build_image(dockerfile: &str, service: &str, os: &str, arch: &str) -> Result<String> {
    let docker = docker_bin()?;
    let tag = format!("yeet-build/{service}:latest");
    let platform = format!("{os}/{arch}");
    info!(dockerfile, %platform, %tag, "building image");

    progress::with_spinner(&format!("Building {tag} for {platform}"), || {
        Cmd::new(&docker)
            .args(["build", "--platform", &platform, "-t", &tag, "-f", dockerfile, "."])
            .run()
            .context("docker build")?;
        Ok(())
    })?;
    Ok(tag)
}

/// Retag and push a local image into the service-scoped registry.
pub fn push_image(image: &str, service: &str, host: &str) -> Result<String> {
    let docker = docker_bin()?;
    let remote_tag = registry_tag(image, service, host);
    info!(image, %remote_tag, "pushing image");

    progress::with_spinner(&format!("Pushing {remote_tag}"), || {
        Cmd::new(&docker)
            .args(["tag", image, &remote_tag])
            .run()
            .context("docker tag")?;
        Cmd::new(&docker)
            .args(["push", &remote_tag])
            .run()
            .context("docker push")?;
        Ok(())
    })?;
    Ok(remote_tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tag_preserves_tag_part() {
        assert_eq!(
            registry_tag("myapp:v2", "svc-a", "catch"),
            "catch/svc-a:v2"
        );
        assert_eq!(
            registry_tag("ghcr.io/x/y:1.0", "svc", "host-a"),
            "host-a/svc:1.0"
        );
        assert_eq!(registry_tag("plain", "svc", "h"), "h/svc:latest");
    }
}
