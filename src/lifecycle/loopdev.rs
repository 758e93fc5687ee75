//! Loop device attach/detach via losetup.

use super::stack::Release;
use crate::error::{BinderError, TeardownError};
use crate::process::{Cmd, CommandExecutor};
use std::path::{Path, PathBuf};

/// A loop device bound to a disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    path: String,
    image: Option<PathBuf>,
}

impl LoopDevice {
    /// Refer to an existing device by path, e.g. for an explicit detach.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            image: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Block device of partition `index` (1-based), e.g. `/dev/loop7p2`.
    pub fn partition(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}p{}", self.path, index))
    }
}

impl Release for LoopDevice {
    fn label(&self) -> String {
        match &self.image {
            Some(image) => format!("loop device {} ({})", self.path, image.display()),
            None => format!("loop device {}", self.path),
        }
    }

    fn release(&self, exec: &dyn CommandExecutor) -> Result<(), TeardownError> {
        LoopDeviceBinder::new(exec).detach(self)?;
        Ok(())
    }
}

/// Associates images with free loop devices.
pub struct LoopDeviceBinder<'a> {
    exec: &'a dyn CommandExecutor,
}

impl<'a> LoopDeviceBinder<'a> {
    pub fn new(exec: &'a dyn CommandExecutor) -> Self {
        Self { exec }
    }

    /// Attach `image` to the first free loop device with partition scanning.
    pub fn attach(&self, image: &Path) -> Result<LoopDevice, BinderError> {
        let cmd = Cmd::new("losetup").args(["-P", "-f", "--show"]).arg_path(image);
        let out = self.exec.output(&cmd).map_err(BinderError::Spawn)?;

        if !out.success() {
            let detail = out.failure_detail();
            let lower = out.stderr.to_ascii_lowercase();
            if lower.contains("unused loop device") || lower.contains("no free loop") {
                return Err(BinderError::NoFreeDevice {
                    image: image.to_path_buf(),
                    detail,
                });
            }
            return Err(BinderError::ImageUnreadable {
                image: image.to_path_buf(),
                detail,
            });
        }

        let path = out.stdout.trim();
        if path.is_empty() {
            return Err(BinderError::EmptyDevice(image.to_path_buf()));
        }

        tracing::info!("attached {} as {}", image.display(), path);
        Ok(LoopDevice {
            path: path.to_string(),
            image: Some(image.to_path_buf()),
        })
    }

    /// Remove the loop mapping. Errors are returned to the caller; the
    /// resource stack logs them during teardown.
    pub fn detach(&self, device: &LoopDevice) -> Result<(), BinderError> {
        let cmd = Cmd::new("losetup").arg("-d").arg(device.path());
        let out = self.exec.output(&cmd).map_err(BinderError::Spawn)?;
        if !out.success() {
            return Err(BinderError::Detach {
                device: device.path().to_string(),
                detail: out.failure_detail(),
            });
        }
        tracing::info!("detached {}", device.path());
        Ok(())
    }
}
