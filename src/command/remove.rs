//! Remove a service from its host, optionally dropping the local entry.

use std::io::{self, IsTerminal, Write};

use anyhow::Result;
use tracing::info;

use crate::cancel::CancelToken;
use crate::command;
use crate::exec::{self, StdinSource};
use crate::rpc::ExecRequest;

/// y/N prompt on the terminal; non-interactive sessions refuse instead of
/// guessing.
fn confirm(question: &str) -> Result<bool> {
    if !io::stdin().is_terminal() {
        anyhow::bail!("{question}: refusing without a terminal; pass --yes");
    }
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

pub fn run(service: &str, yes: bool, clean_config: bool) -> Result<()> {
    let (target, mut project) = command::resolve_target(Some(service))?;

    if !yes
        && !confirm(&format!(
            "Remove {} from {}?",
            target.service, target.host
        ))?
    {
        println!("Aborted");
        return Ok(());
    }

    info!(service = %target.service, host = %target.host, "removing service");
    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    let client = command::connect(&target.host)?;
    exec::run(
        client,
        ExecRequest {
            service: target.service.clone(),
            args: vec!["remove".to_string(), "--yes".to_string()],
            ..Default::default()
        },
        StdinSource::Empty,
        &cancel,
    )?;
    println!("Removed {} from {}", target.service, target.host);

    // Local cleanup only after the remote removal succeeded.
    if clean_config && project.get(&target.service, &target.host).is_some() {
        let drop_entry =
            yes || confirm(&format!("Drop {} from yeet.toml?", target.service))?;
        if drop_entry {
            project.remove_entry(&target.service, &target.host);
            project.save()?;
            println!("Cleaned up yeet.toml");
        }
    }
    Ok(())
}
