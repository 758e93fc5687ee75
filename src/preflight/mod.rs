//! Preflight checks before touching the image.
//!
//! Validates privileges and host tools up front so a run fails with a clear
//! message instead of halfway through acquisition.
//!
//! # Example
//!
//! ```rust
//! use rpi_image::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("losetup") {
//!     println!("util-linux not installed");
//! }
//!
//! let tools = &[("losetup", "util-linux"), ("chroot", "coreutils")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{EnvironmentError, PreconditionError};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every flow needs to attach and mount the image.
///
/// Each tuple is (command_name, package_name).
pub const LIFECYCLE_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("mountpoint", "util-linux"),
];

/// Additional tools for the chroot flow.
pub const CHROOT_TOOLS: &[(&str, &str)] = &[("chroot", "coreutils")];

/// Tools needed to download an image.
pub const FETCH_TOOLS: &[(&str, &str)] = &[("curl", "curl"), ("xz", "xz-utils")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` listing every missing tool and its package
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<(), EnvironmentError> {
    let missing = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect::<Vec<_>>();

    if !missing.is_empty() {
        return Err(EnvironmentError::MissingTools(missing.join("\n")));
    }

    Ok(())
}

/// Host tools for the emulated boot flow.
///
/// `qemu_img` is only needed when the image may be resized.
pub fn check_boot_host(emulator: &str, qemu_img: Option<&str>) -> Result<(), EnvironmentError> {
    let mut tools = LIFECYCLE_TOOLS.to_vec();
    tools.push((emulator, "qemu-system-arm"));
    if let Some(qemu_img) = qemu_img {
        tools.push((qemu_img, "qemu-utils"));
    }
    check_required_tools(&tools)
}

/// Host tools for the chroot flow.
pub fn check_chroot_host() -> Result<(), EnvironmentError> {
    let tools = LIFECYCLE_TOOLS
        .iter()
        .chain(CHROOT_TOOLS)
        .copied()
        .collect::<Vec<_>>();
    check_required_tools(&tools)
}

/// Loop devices, mounts and chroot all need root.
pub fn require_root() -> Result<(), PreconditionError> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        return Err(PreconditionError::NotRoot);
    }
    Ok(())
}
