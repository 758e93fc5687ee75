//! Interactive shell (or one command) inside the mounted root.

use super::run_foreground;
use crate::error::ProvisionError;
use crate::process::{Cmd, CommandExecutor};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ChrootSession {
    pub root: PathBuf,
    pub shell: String,
    /// Runs instead of the interactive shell when non-empty.
    pub command: Vec<String>,
}

impl ChrootSession {
    pub fn command_line(&self) -> Cmd {
        let cmd = Cmd::new("chroot").arg_path(&self.root);
        if self.command.is_empty() {
            cmd.arg(&self.shell)
        } else {
            cmd.args(self.command.iter().cloned())
        }
    }

    pub fn run(&self, exec: &dyn CommandExecutor) -> Result<i32, ProvisionError> {
        run_foreground(exec, &self.command_line(), "coreutils")
    }
}
