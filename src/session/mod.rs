//! Terminal foreground operations run against a prepared mount tree.
//!
//! A session owns no resources. It runs once, blocks until its child exits,
//! and hands back the child's exit status; a non-zero status is not an error
//! of the tool.

pub mod boot;
pub mod chroot;

pub use boot::EmulatedBootSession;
pub use chroot::ChrootSession;

use crate::error::{EnvironmentError, ProvisionError};
use crate::process::{Cmd, CommandExecutor};
use std::io;

/// Run `cmd` in the foreground and return its exit status.
fn run_foreground(
    exec: &dyn CommandExecutor,
    cmd: &Cmd,
    package: &str,
) -> Result<i32, ProvisionError> {
    match exec.foreground(cmd) {
        Ok(out) => {
            if out.success() {
                tracing::info!("{} exited cleanly", cmd.program());
            } else {
                tracing::info!("{} exited with status {}", cmd.program(), out.code);
            }
            Ok(out.code)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(EnvironmentError::MissingBinary {
                binary: cmd.program().to_string(),
                package: package.to_string(),
            }
            .into())
        }
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!("failed to start {}", cmd.program()))
            .into()),
    }
}
