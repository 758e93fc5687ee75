//! Block-device and bind mounts.
//!
//! Mount state is always read from the live mount table (`mountpoint -q`)
//! rather than from what this process believes it mounted, so a target that
//! was unmounted behind our back is simply skipped at teardown.

use super::stack::Release;
use crate::error::{MountError, TeardownError};
use crate::process::{Cmd, CommandExecutor};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Filesystem on a block device, type detected by mount(8).
    Device,
    /// 1:1 overlay of an existing directory tree.
    Bind,
}

/// One (source, target) mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub kind: MountKind,
}

impl Mount {
    pub fn device(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: MountKind::Device,
        }
    }

    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: MountKind::Bind,
        }
    }

    fn command(&self) -> Cmd {
        let mut cmd = Cmd::new("mount");
        if self.kind == MountKind::Bind {
            cmd = cmd.arg("--bind");
        }
        cmd.arg_path(&self.source).arg_path(&self.target)
    }
}

impl Release for Mount {
    fn label(&self) -> String {
        match self.kind {
            MountKind::Device => format!("mount {}", self.target.display()),
            MountKind::Bind => format!("bind {}", self.target.display()),
        }
    }

    fn release(&self, exec: &dyn CommandExecutor) -> Result<(), TeardownError> {
        MountPoint::new(exec).unmount(&self.target)?;
        Ok(())
    }
}

/// Mounts and unmounts through the command executor.
pub struct MountPoint<'a> {
    exec: &'a dyn CommandExecutor,
}

impl<'a> MountPoint<'a> {
    pub fn new(exec: &'a dyn CommandExecutor) -> Self {
        Self { exec }
    }

    pub fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        let cmd = Cmd::new("mountpoint").arg("-q").arg_path(target);
        let out = self.exec.output(&cmd).map_err(MountError::Spawn)?;
        Ok(out.success())
    }

    /// Create the target directory and mount `mount.source` on it.
    pub fn mount(&self, mount: &Mount) -> Result<(), MountError> {
        if self.is_mounted(&mount.target)? {
            return Err(MountError::AlreadyMounted(mount.target.clone()));
        }
        if mount.kind == MountKind::Bind && !mount.source.exists() {
            return Err(MountError::SourceMissing(mount.source.clone()));
        }

        fs::create_dir_all(&mount.target).map_err(|source| {
            if source.kind() == io::ErrorKind::PermissionDenied {
                MountError::PermissionDenied(mount.target.clone())
            } else {
                MountError::CreateTarget {
                    path: mount.target.clone(),
                    source,
                }
            }
        })?;

        let out = self
            .exec
            .output(&mount.command())
            .map_err(MountError::Spawn)?;
        if !out.success() {
            return Err(classify_failure(mount, &out.stderr, out.failure_detail()));
        }

        tracing::info!(
            "mounted {} on {}",
            mount.source.display(),
            mount.target.display()
        );
        Ok(())
    }

    /// Unmount `target` if it is mounted. Returns whether anything was
    /// unmounted; a target that isn't mounted is not an error.
    pub fn unmount(&self, target: &Path) -> Result<bool, MountError> {
        if !self.is_mounted(target)? {
            tracing::debug!("{} not mounted, skipping", target.display());
            return Ok(false);
        }

        let out = self
            .exec
            .output(&Cmd::new("umount").arg_path(target))
            .map_err(MountError::Spawn)?;
        if !out.success() {
            if out.stderr.to_ascii_lowercase().contains("busy") {
                return Err(MountError::TargetBusy(target.to_path_buf()));
            }
            return Err(MountError::Failed {
                target: target.to_path_buf(),
                detail: out.failure_detail(),
            });
        }

        tracing::info!("unmounted {}", target.display());
        Ok(true)
    }
}

fn classify_failure(mount: &Mount, stderr: &str, detail: String) -> MountError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("already mounted") {
        MountError::AlreadyMounted(mount.target.clone())
    } else if lower.contains("does not exist")
        || lower.contains("no such file")
        || lower.contains("special device")
    {
        MountError::SourceMissing(mount.source.clone())
    } else if lower.contains("permission denied")
        || lower.contains("must be superuser")
        || lower.contains("only root")
    {
        MountError::PermissionDenied(mount.target.clone())
    } else if lower.contains("busy") {
        MountError::TargetBusy(mount.target.clone())
    } else {
        MountError::Failed {
            target: mount.target.clone(),
            detail,
        }
    }
}
