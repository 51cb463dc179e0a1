//! Show the effective preferences; `--save` persists the current host
//! and port back to disk.

use anyhow::Result;

use crate::prefs::{Preferences, settings};

pub fn run(save: bool) -> Result<()> {
    let s = settings();
    let effective = Preferences {
        default_host: Some(
            s.host_override
                .clone()
                .unwrap_or_else(|| s.default_host.clone()),
        ),
        rpc_port: Some(s.rpc_port),
    };

    println!("{}", serde_json::to_string_pretty(&effective)?);

    if save {
        effective.save()?;
        println!("Saved to {}", Preferences::path()?.display());
    }
    Ok(())
}
