//! SSH-based install/update of the remote host agent.
//!
//! The flow is deliberately boring: detect the remote platform with
//! `uname`, fetch a matching release asset (SHA-256 verified, with
//! retries), push it over scp, and run its `install` subcommand through a
//! sudo-capable ssh session. Progress is reported through the
//! `SuspendableProgressUi` capability so the spinner gets out of the way
//! whenever ssh needs the terminal.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, warn};

use crate::cmd::Cmd;
use crate::hash;
use crate::progress::SuspendableProgressUi;

const RELEASE_BASE: &str = "https://github.com/yeetrun/yeet/releases/latest/download";
const AGENT_BIN: &str = "catch";
const REMOTE_STAGING: &str = "/tmp/catch.download";

/// Attempts for the release download and the ssh preflight; nothing else
/// retries without the user asking.
const RETRY_ATTEMPTS: u32 = 3;

/// Map `uname -s -m` output to the release naming scheme.
pub fn parse_uname(output: &str) -> Result<(String, String)> {
    let mut parts = output.split_whitespace();
    let sysname = parts
        .next()
        .ok_or_else(|| anyhow!("empty uname output"))?;
    let machine = parts
        .next()
        .ok_or_else(|| anyhow!("uname output missing machine field: {output:?}"))?;

    let os = match sysname {
        "Linux" => "linux",
        "Darwin" => "darwin",
        other => bail!("unsupported remote OS: {other}"),
    };
    let arch = match machine {
        "x86_64" | "amd64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        "riscv64" => "riscv64",
        other => bail!("unsupported remote architecture: {other}"),
    };
    Ok((os.to_string(), arch.to_string()))
}

pub fn release_asset_name(os: &str, arch: &str) -> String {
    format!("{AGENT_BIN}_{os}_{arch}")
}

/// Retry an operation a fixed number of times, reporting each retry.
fn with_retries<T>(
    ui: &mut dyn SuspendableProgressUi,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut last_err = None;
    for attempt in 1..=RETRY_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(what, attempt, error = %e, "attempt failed");
                ui.update_detail(&format!("retry {attempt}/{RETRY_ATTEMPTS}"));
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("{what} failed")))
}

fn ssh_command<'a>(target: &'a str) -> Cmd<'a> {
    Cmd::new("ssh").args(["-o", "BatchMode=yes"]).arg(target)
}

/// Check the host answers ssh at all before doing anything else.
fn preflight(ui: &mut dyn SuspendableProgressUi, target: &str) -> Result<()> {
    with_retries(ui, "ssh preflight", || {
        ssh_command(target)
            .arg("true")
            .run()
            .map(|_| ())
            .context("ssh preflight")
    })
}

fn detect_platform(target: &str) -> Result<(String, String)> {
    let out = ssh_command(target)
        .arg("uname -s -m")
        .run_and_capture_stdout()
        .context("detecting remote platform")?;
    parse_uname(&out)
}

/// Fetch `url` to `dest` with curl, honoring `GITHUB_TOKEN` when present.
fn fetch(url: &str, dest: &Path) -> Result<()> {
    let mut cmd = Cmd::new("curl")
        .args(["-fsSL", "--retry", "0", "-o"])
        .arg(dest.display().to_string());
    if let Ok(token) = std::env::var("GITHUB_TOKEN")
        && !token.is_empty()
    {
        cmd = cmd.arg("-H").arg(format!("Authorization: Bearer {token}"));
    }
    cmd.arg(url).run().map(|_| ()).context("downloading asset")
}

/// Download the release asset and verify it against the published
/// `.sha256` companion file.
fn download_release(
    ui: &mut dyn SuspendableProgressUi,
    asset: &str,
    dest: &Path,
) -> Result<()> {
    let url = format!("{RELEASE_BASE}/{asset}");
    let sum_url = format!("{url}.sha256");

    with_retries(ui, "release download", || {
        fetch(&url, dest)?;

        let sum_file = tempfile::NamedTempFile::new()?;
        fetch(&sum_url, sum_file.path())?;
        let expected = std::fs::read_to_string(sum_file.path())?;
        let expected = expected
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("empty checksum file"))?
            .to_lowercase();

        let actual = hash::sha256_file(dest)?;
        if actual != expected {
            bail!("checksum mismatch for {asset}: expected {expected}, got {actual}");
        }
        debug!(asset, sha256 = %actual, "release asset verified");
        Ok(())
    })
}

/// Install or update the agent on `target` (a `user@host` ssh destination).
pub fn install(ui: &mut dyn SuspendableProgressUi, target: &str) -> Result<()> {
    ui.start_step(&format!("Connecting to {target}"));
    preflight(ui, target)?;
    ui.done_step();

    ui.start_step("Detecting remote platform");
    let (os, arch) = detect_platform(target)?;
    ui.update_detail(&format!("{os}/{arch}"));
    ui.done_step();

    let asset = release_asset_name(&os, &arch);
    ui.start_step(&format!("Downloading {asset}"));
    let staging = tempfile::NamedTempFile::new()?;
    download_release(ui, &asset, staging.path())?;
    ui.done_step();

    ui.start_step("Uploading agent");
    Cmd::new("scp")
        .arg(staging.path().display().to_string())
        .arg(format!("{target}:{REMOTE_STAGING}"))
        .run()
        .context("uploading agent binary")?;
    ssh_command(target)
        .arg(format!("chmod +x {REMOTE_STAGING}"))
        .run()
        .context("marking agent executable")?;
    ui.done_step();

    ui.start_step("Installing");
    // sudo may prompt; hand the terminal over to ssh for the duration.
    ui.suspend();
    let code = Cmd::new("ssh")
        .arg("-t")
        .arg(target)
        .arg(format!("sudo {REMOTE_STAGING} install"))
        .run_interactive()?;
    ui.resume();
    if code != 0 {
        let reason = format!("remote install exited with code {code}");
        ui.fail_step(&reason);
        bail!(reason);
    }
    ui.done_step();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uname_maps_to_release_names() {
        assert_eq!(
            parse_uname("Linux x86_64").unwrap(),
            ("linux".to_string(), "amd64".to_string())
        );
        assert_eq!(
            parse_uname("Linux aarch64").unwrap(),
            ("linux".to_string(), "arm64".to_string())
        );
        assert_eq!(
            parse_uname("Darwin arm64").unwrap(),
            ("darwin".to_string(), "arm64".to_string())
        );
    }

    #[test]
    fn uname_rejects_unknown_platforms() {
        assert!(parse_uname("Plan9 mips").is_err());
        assert!(parse_uname("Linux").is_err());
        assert!(parse_uname("").is_err());
    }

    #[test]
    fn asset_names_are_flat() {
        assert_eq!(release_asset_name("linux", "amd64"), "catch_linux_amd64");
    }

    #[test]
    fn retries_give_up_after_limit() {
        let mut ui = crate::progress::ui_for(crate::progress::ProgressMode::Quiet);
        let mut calls = 0;
        let result: Result<()> = with_retries(ui.as_mut(), "always fails", || {
            calls += 1;
            bail!("nope")
        });
        assert!(result.is_err());
        assert_eq!(calls, RETRY_ATTEMPTS);
    }

    #[test]
    fn retries_stop_on_success() {
        let mut ui = crate::progress::ui_for(crate::progress::ProgressMode::Quiet);
        let mut calls = 0;
        let result = with_retries(ui.as_mut(), "flaky", || {
            calls += 1;
            if calls < 2 { bail!("transient") } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 2);
    }
}
