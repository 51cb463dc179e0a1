//! Interactive shell (or one-off command) inside a service's environment.

use anyhow::Result;

use crate::cancel::CancelToken;
use crate::command;
use crate::exec::{self, StdinSource};
use crate::rpc::ExecRequest;

pub fn run(service: Option<&str>, command_parts: &[String]) -> Result<()> {
    let (target, _project) = command::resolve_target(service)?;

    let mut args = vec!["ssh".to_string()];
    if !command_parts.is_empty() {
        args.push("--".to_string());
        args.extend(command_parts.iter().cloned());
    }
    if let Ok(shell) = std::env::var("SHELL")
        && !shell.is_empty()
    {
        args.insert(1, format!("--shell={shell}"));
    }

    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    let client = command::connect(&target.host)?;
    exec::run(
        client,
        ExecRequest {
            service: target.service,
            args,
            // Interactive unless a one-off command was given.
            tty: command_parts.is_empty(),
            ..Default::default()
        },
        StdinSource::Terminal,
        &cancel,
    )?;
    Ok(())
}
