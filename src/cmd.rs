use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use tracing::{debug, trace};

/// A builder for executing external commands (docker, ssh) with unified
/// error handling.
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<String>,
    workdir: Option<&'a Path>,
    envs: Vec<(&'a str, String)>,
}

impl<'a> Cmd<'a> {
    /// Create a new command builder
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
            workdir: None,
            envs: Vec::new(),
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &'a Path) -> Self {
        self.workdir = Some(path);
        self
    }

    /// Add an environment variable for the child process
    pub fn env(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.envs.push((key, value.into()));
        self
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(self.command);
        if let Some(dir) = self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd.args(&self.args);
        cmd
    }

    /// Execute the command and return the output
    /// Returns an error if the command fails (non-zero exit code)
    pub fn run(self) -> Result<Output> {
        let workdir_display = self.workdir.map(|p| p.display().to_string());
        trace!(command = self.command, args = ?self.args, workdir = ?workdir_display, "cmd:run start");

        let output = self.build().output().with_context(|| {
            format!(
                "Failed to execute command: {} {}",
                self.command,
                self.args.join(" ")
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command = self.command,
                args = ?self.args,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {} {}\n{}",
                self.command,
                self.args.join(" "),
                stderr.trim()
            ));
        }
        trace!(command = self.command, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    /// Execute the command, returning Ok(true) if it succeeds, Ok(false) if it fails
    /// This is useful for commands that are used as checks (e.g., docker image inspect)
    pub fn run_as_check(self) -> Result<bool> {
        let workdir_display = self.workdir.map(|p| p.display().to_string());
        trace!(command = self.command, args = ?self.args, workdir = ?workdir_display, "cmd:check start");

        let output = self.build().output().with_context(|| {
            format!(
                "Failed to execute command: {} {}",
                self.command,
                self.args.join(" ")
            )
        })?;

        let success = output.status.success();
        trace!(command = self.command, success, "cmd:check result");
        Ok(success)
    }

    /// Execute the command with inherited stdio and return its exit code.
    /// Used for interactive subprocesses (ssh sessions, docker login).
    pub fn run_interactive(self) -> Result<i32> {
        trace!(command = self.command, args = ?self.args, "cmd:interactive start");
        let status = self
            .build()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| {
                format!(
                    "Failed to execute command: {} {}",
                    self.command,
                    self.args.join(" ")
                )
            })?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Consume the builder and return the underlying std Command, configured
    /// but not spawned. Used when the caller needs custom stdio plumbing.
    pub fn into_command(self) -> Command {
        self.build()
    }
}
