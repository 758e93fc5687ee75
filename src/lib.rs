//! Provision a Raspberry Pi OS disk image for emulation or a cross-arch chroot.
//!
//! The core is a staged resource lifecycle: attach the image to a loop
//! device, mount its partitions, bind host pseudo-filesystems and the project
//! tree into the root, run a foreground session, and release everything in
//! exact reverse order on every exit path.
//!
//! - **Lifecycle** - Loop devices, mounts and the [`ResourceStack`] that unwinds them
//! - **Stages** - The chroot and emulated-boot acquisition sequences
//! - **Sessions** - `chroot` shell and `qemu-system-aarch64` in the foreground
//! - **Process** - The [`CommandExecutor`] boundary for all host commands
//! - **Preflight** - Privilege and host tool checks
//!
//! # Architecture
//!
//! ```text
//! rpi-image (binary)
//!     │
//!     ├── config ── TOML + CLI overrides → ChrootOptions / BootOptions
//!     │
//!     └── stages::{run_chroot, run_boot}
//!             │
//!             ├── lifecycle::{LoopDeviceBinder, MountPoint} ──► ResourceStack
//!             ├── session::{ChrootSession, EmulatedBootSession}
//!             └── ResourceStack::drain (reverse order, failures logged)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use rpi_image::{run_chroot, Config, Interrupt, SystemExecutor};
//!
//! let config = Config::load_or_default(None)?;
//! let opts = config.chroot_options(vec![]);
//! let status = run_chroot(&SystemExecutor, &Interrupt::process(), &opts)?;
//! ```
//!
//! Only one invocation may work on a given image at a time; the loop and
//! mount tables are not locked.

pub mod config;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod preflight;
pub mod process;
pub mod qemu;
pub mod session;
pub mod signal;
pub mod stages;

pub use config::Config;
pub use error::{ProvisionError, Result};
pub use lifecycle::{LoopDevice, LoopDeviceBinder, Mount, MountPoint, ResourceStack};
pub use process::{Cmd, CommandExecutor, CommandOutput, SystemExecutor};
pub use signal::{Interrupt, InterruptGuard};
pub use stages::{run_boot, run_chroot, BootOptions, ChrootOptions, ProjectMode};
