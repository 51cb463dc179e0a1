//! `init [target]`: install or update the host agent over ssh.

use anyhow::Result;

use crate::bootstrap;
use crate::prefs::settings;
use crate::progress;

pub fn run(target: Option<&str>) -> Result<()> {
    let target = match target {
        Some(t) => t.to_string(),
        None => settings()
            .host_override
            .clone()
            .unwrap_or_else(|| settings().default_host.clone()),
    };

    let mut ui = progress::ui_for(settings().progress);
    bootstrap::install(ui.as_mut(), &target)?;
    println!("Host {target} is ready");
    Ok(())
}
