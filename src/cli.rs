use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

use crate::command;
use crate::prefs;
use crate::progress::ProgressMode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "yeet")]
#[command(about = "Push payloads to a host agent and run them as managed services")]
struct Cli {
    /// Target host (overrides CATCH_HOST and the preferences file)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Service name for verbs that don't take one positionally
    #[arg(long, global = true)]
    service: Option<String>,

    /// Agent RPC port (overrides CATCH_RPC_PORT and the preferences file)
    #[arg(long, global = true)]
    rpc_port: Option<u16>,

    /// Progress output style
    #[arg(long, global = true, value_enum, default_value = "auto")]
    progress: ProgressMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install or update the host agent over ssh
    Init {
        /// ssh target (user@host); defaults to the resolved host
        target: Option<String>,
    },

    /// List known hosts and their tags
    ListHosts {
        /// Only hosts carrying all of these comma-separated tags
        #[arg(long)]
        tags: Option<String>,
    },

    /// Show the effective preferences, optionally persisting them
    Prefs {
        /// Write the current host/port back to ~/.yeet/prefs.json
        #[arg(long)]
        save: bool,
    },

    /// Open a shell (or run a command) in a service's environment
    Ssh {
        /// Service, as service[@host]
        service: Option<String>,

        /// Command to run instead of an interactive shell (after --)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Show service status across hosts
    Status {
        #[arg(long, value_enum, default_value = "table")]
        format: command::status::OutputFormat,
    },

    /// Show host facts, remote service state, and local classification
    Info {
        /// Service, as service[@host]
        service: Option<String>,

        #[arg(long, value_enum, default_value = "table")]
        format: command::status::OutputFormat,
    },

    /// Deploy a payload and run it as a service
    Run {
        /// [service[@host]] [flags…] [payload] [-- app-args]
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Deploy a payload on a cron schedule
    Cron {
        /// service[@host] payload <5-field schedule> [-- app-args]
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Upload a file into the service's stage slot without activating it
    Stage {
        /// Service, as service[@host]
        service: String,
        file: String,
    },

    /// Copy files to or from a service's data root (rsync-like)
    Copy(command::copy::CopyArgs),

    /// Remove a service from its host
    #[command(visible_alias = "rm")]
    Remove {
        /// Service, as service[@host]
        service: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,

        /// Also drop the entry from yeet.toml
        #[arg(long)]
        clean_config: bool,
    },

    /// Manage a service's environment file
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },

    /// Stream events from the host agent
    Events {
        /// All services, not just the resolved one
        #[arg(long)]
        all: bool,
    },

    /// Container image plumbing for compose services
    Docker {
        #[command(subcommand)]
        command: command::docker::DockerCommands,
    },

    /// Party on the host
    #[command(hide = true)]
    Skirt,

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Anything else is forwarded verbatim to the host agent
    #[command(external_subcommand)]
    External(Vec<String>),
}

#[derive(Subcommand)]
enum EnvCommands {
    /// Print the service's env file
    Show {
        /// Service, as service[@host]
        service: Option<String>,
    },
    /// Edit the env file in $EDITOR and push it back
    Edit {
        /// Service, as service[@host]
        service: Option<String>,
    },
    /// Upload a local env file
    Copy {
        file: String,
        /// Service, as service[@host]
        service: Option<String>,
    },
    /// Set KEY=VALUE pairs in the service environment
    Set {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
}

// --- Public Entry Point ---
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let settings = prefs::startup(
        cli.host.clone(),
        cli.service.clone(),
        cli.rpc_port,
        cli.progress,
    )?;
    prefs::init(settings);

    match cli.command {
        Commands::Init { target } => command::init_host::run(target.as_deref()),
        Commands::ListHosts { tags } => command::list_hosts::run(tags.as_deref()),
        Commands::Prefs { save } => command::prefs::run(save),
        Commands::Ssh { service, command } => command::ssh::run(service.as_deref(), &command),
        Commands::Status { format } => command::status::run(format),
        Commands::Info { service, format } => command::info::run(service.as_deref(), format),
        Commands::Run { args } => command::run::run(&args),
        Commands::Cron { args } => command::cron::run(&args),
        Commands::Stage { service, file } => command::stage::run(&service, &file),
        Commands::Copy(args) => command::copy::run(args),
        Commands::Remove {
            service,
            yes,
            clean_config,
        } => command::remove::run(&service, yes, clean_config),
        Commands::Env { command: env_cmd } => match env_cmd {
            EnvCommands::Show { service } => command::env::show(service.as_deref()),
            EnvCommands::Edit { service } => command::env::edit(service.as_deref()),
            EnvCommands::Copy { file, service } => command::env::copy(&file, service.as_deref()),
            EnvCommands::Set { assignments } => command::env::set(&assignments),
        },
        Commands::Events { all } => command::events::run(all),
        Commands::Docker { command: docker } => command::docker::run(docker),
        Commands::Skirt => command::forward::run("skirt", &[]),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
        Commands::External(args) => {
            let (verb, rest) = args
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("missing command"))?;
            command::forward::run(verb, rest)
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, &name, &mut buf);
    print!("{}", String::from_utf8_lossy(&buf));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_collects_everything_after_the_verb() {
        let cli = Cli::parse_from(["yeet", "run", "svc-a", "./bin/app", "--", "-v"]);
        match cli.command {
            Commands::Run { args } => {
                assert_eq!(args, vec!["svc-a", "./bin/app", "--", "-v"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn unknown_verbs_become_external() {
        let cli = Cli::parse_from(["yeet", "restart", "svc-a"]);
        match cli.command {
            Commands::External(args) => assert_eq!(args, vec!["restart", "svc-a"]),
            _ => panic!("expected external"),
        }
    }

    #[test]
    fn global_flags_parse_anywhere() {
        let cli = Cli::parse_from(["yeet", "status", "--host", "host-b", "--rpc-port", "4000"]);
        assert_eq!(cli.host.as_deref(), Some("host-b"));
        assert_eq!(cli.rpc_port, Some(4000));
        assert!(matches!(cli.command, Commands::Status { .. }));
    }
}
