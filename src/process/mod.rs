//! External command execution.
//!
//! [`Cmd`] describes a command line. [`CommandExecutor`] is the single
//! boundary through which the lifecycle core touches the host: loop devices,
//! mounts, the emulator and the chroot shell all run through it, so the core
//! can be exercised against a fake executor without touching kernel state.

#[cfg(test)]
pub(crate) mod fake;

use anyhow::{bail, Context, Result};
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    /// Message used instead of the generic one when [`Cmd::run`] fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Run with captured output, failing on spawn errors and on a non-zero
    /// exit.
    pub fn run(&self, exec: &dyn CommandExecutor) -> Result<CommandOutput> {
        let output = exec
            .output(self)
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.success() {
            match &self.error_msg {
                Some(msg) => bail!("{}: {}", msg, output.failure_detail()),
                None => bail!("`{}` failed: {}", self, output.failure_detail()),
            }
        }

        Ok(output)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `128 + signal` when the child was killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Short human-readable description of a failure.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit status {}", self.code)
        } else {
            format!("exit status {}: {}", self.code, stderr)
        }
    }
}

/// Runs external commands on behalf of the lifecycle core.
pub trait CommandExecutor {
    /// Run to completion with stdout and stderr captured.
    fn output(&self, cmd: &Cmd) -> io::Result<CommandOutput>;

    /// Run in the foreground with inherited stdio and block until it exits.
    fn foreground(&self, cmd: &Cmd) -> io::Result<CommandOutput>;
}

/// Executor backed by real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn output(&self, cmd: &Cmd) -> io::Result<CommandOutput> {
        tracing::debug!("exec: {cmd}");
        let mut command = cmd.to_command();
        command.stdin(Stdio::null());
        shield_from_terminal_interrupts(&mut command);
        let output = command.output()?;

        Ok(CommandOutput {
            code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn foreground(&self, cmd: &Cmd) -> io::Result<CommandOutput> {
        tracing::info!("==> {cmd}");
        let status = cmd.to_command().status()?;
        Ok(CommandOutput {
            code: exit_code(status),
            ..Default::default()
        })
    }
}

/// Captured commands run in their own process group with SIGINT ignored.
/// Only foreground sessions receive the terminal's Ctrl-C; a release
/// command such as `umount` or `losetup -d` always runs to completion.
fn shield_from_terminal_interrupts(command: &mut Command) {
    use nix::sys::signal::{self, SigHandler, Signal};
    use std::os::unix::process::CommandExt;

    command.process_group(0);
    // SAFETY: the hook runs between fork and exec and only calls
    // sigaction(2), which is async-signal-safe. An ignored disposition
    // survives exec.
    unsafe {
        command.pre_exec(|| {
            signal::signal(Signal::SIGINT, SigHandler::SigIgn)
                .map(drop)
                .map_err(io::Error::from)
        });
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}
