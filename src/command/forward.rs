//! Verbs this client doesn't know are forwarded verbatim over exec, so
//! the host agent can grow new commands without a client release.

use anyhow::Result;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::command;
use crate::exec::{self, StdinSource};
use crate::rpc::ExecRequest;

pub fn run(verb: &str, rest: &[String]) -> Result<()> {
    // A leading `service[@host]` argument names the target; anything else
    // rides along untouched. Verbs with no service at all still need a
    // host to dial.
    let service_arg = rest.first().filter(|a| !a.starts_with('-'));
    let target = match command::resolve_target(service_arg.map(String::as_str)) {
        Ok((target, _project)) => target,
        Err(e) if e.downcast_ref::<crate::error::Error>().is_some_and(|e| {
            matches!(e, crate::error::Error::MissingService(_))
        }) =>
        {
            crate::resolve::Target {
                service: String::new(),
                host: crate::prefs::settings()
                    .host_override
                    .clone()
                    .unwrap_or_else(|| crate::prefs::settings().default_host.clone()),
            }
        }
        Err(e) => return Err(e),
    };

    let mut args = vec![verb.to_string()];
    args.extend(rest.iter().cloned());
    debug!(?args, host = %target.host, "forwarding unknown verb");

    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    let client = command::connect(&target.host)?;
    exec::run(
        client,
        ExecRequest {
            service: target.service,
            args,
            tty: true,
            ..Default::default()
        },
        StdinSource::Terminal,
        &cancel,
    )?;
    Ok(())
}
