mod bootstrap;
mod cancel;
mod classify;
mod cli;
mod cmd;
mod command;
mod error;
mod exec;
mod hash;
mod logger;
mod payload;
mod prefs;
mod progress;
mod project;
mod resolve;
mod rpc;
mod transfer;

use std::io::Write;
use std::process::ExitCode;

use tracing::{error, info};

fn main() -> ExitCode {
    if let Err(err) = logger::init() {
        eprintln!("yeet: {err:#}");
        return ExitCode::from(error::EXIT_CONFIG as u8);
    }
    info!(args = ?std::env::args().collect::<Vec<_>>(), "yeet start");

    match cli::run() {
        Ok(()) => {
            info!("yeet finished successfully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = ?err, "yeet failed");
            let prefix = err
                .downcast_ref::<error::Error>()
                .map(error::Error::message_prefix)
                .unwrap_or("");
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{prefix}");
            let _ = writeln!(stderr, "{} {err:#}", console::style("yeet:").red().bold());
            let code = error::exit_code_for(&err);
            ExitCode::from(code.clamp(0, 255) as u8)
        }
    }
}
