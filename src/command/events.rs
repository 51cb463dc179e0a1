//! Stream host events until the server ends the stream or the user
//! interrupts.

use anyhow::Result;
use serde_json::json;

use crate::cancel::CancelToken;
use crate::command;
use crate::error::Error;
use crate::prefs::settings;

pub fn run(all: bool) -> Result<()> {
    let (filter, host) = if all {
        // No service filter; any resolvable host will do.
        let host = settings()
            .host_override
            .clone()
            .unwrap_or_else(|| settings().default_host.clone());
        (json!({}), host)
    } else {
        let (target, _project) = command::resolve_target(None)?;
        (json!({ "service": target.service }), target.host)
    };

    let cancel = CancelToken::new();
    cancel.arm_ctrlc()?;
    let client = command::connect(&host)?;
    let result = client.events(filter, &cancel, |event| {
        println!("{event}");
    });
    match result {
        // Ctrl-C on a subscription is a normal way to leave.
        Err(Error::Canceled) => Ok(()),
        other => Ok(other?),
    }
}
