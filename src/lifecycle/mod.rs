//! Acquisition and release of kernel resources.
//!
//! - [`LoopDeviceBinder`] attaches an image to a loop device
//! - [`MountPoint`] mounts partitions and bind sources
//! - [`ResourceStack`] records what was acquired and releases it in reverse
//!
//! Every acquisition is pushed onto the stack right after it succeeds, so the
//! stack is the single record of what this run must undo.

pub mod loopdev;
pub mod mount;
pub mod stack;

pub use loopdev::{LoopDevice, LoopDeviceBinder};
pub use mount::{Mount, MountKind, MountPoint};
pub use stack::{Release, ResourceStack, TeardownReport};
