//! Disk image preconditions.
//!
//! QEMU's SD card model only accepts images whose size is a power of two, so
//! the boot flow rounds the image up to the next power-of-two GiB before
//! attaching it.

pub mod fetch;

use crate::error::{PreconditionError, ProvisionError};
use crate::process::{Cmd, CommandExecutor};
use std::fs;
use std::path::{Path, PathBuf};

const GIB: u64 = 1024 * 1024 * 1024;

/// A disk image on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ImageFile {
    pub fn open(path: &Path) -> Result<Self, PreconditionError> {
        let meta = fs::metadata(path)
            .map_err(|_| PreconditionError::ImageMissing(path.to_path_buf()))?;
        if !meta.is_file() {
            return Err(PreconditionError::ImageMissing(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: meta.len(),
        })
    }
}

/// Smallest power-of-two number of GiB that holds `size_bytes`, in bytes.
pub fn resize_target(size_bytes: u64) -> u64 {
    let gib = size_bytes.div_ceil(GIB).max(1);
    gib.next_power_of_two() * GIB
}

/// Make sure the image size is a power-of-two GiB, growing it with
/// `qemu-img resize` when allowed.
pub fn ensure_sd_size(
    exec: &dyn CommandExecutor,
    image: &ImageFile,
    allow_resize: bool,
    qemu_img: &str,
) -> Result<ImageFile, ProvisionError> {
    let target = resize_target(image.size_bytes);
    if target == image.size_bytes {
        return Ok(image.clone());
    }
    if !allow_resize {
        return Err(PreconditionError::ImageSize {
            size: image.size_bytes,
            target,
        }
        .into());
    }

    tracing::info!(
        "resizing {} from {} to {} bytes (power-of-two GiB)",
        image.path.display(),
        image.size_bytes,
        target
    );
    Cmd::new(qemu_img)
        .args(["resize", "-f", "raw"])
        .arg_path(&image.path)
        .arg(target.to_string())
        .error_msg("qemu-img resize failed")
        .run(exec)?;

    Ok(ImageFile {
        path: image.path.clone(),
        size_bytes: target,
    })
}
