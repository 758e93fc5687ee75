//! The emulator in the foreground.

use super::run_foreground;
use crate::error::ProvisionError;
use crate::process::CommandExecutor;
use crate::qemu::QemuBuilder;

pub struct EmulatedBootSession {
    pub qemu: QemuBuilder,
}

impl EmulatedBootSession {
    pub fn run(&self, exec: &dyn CommandExecutor) -> Result<i32, ProvisionError> {
        run_foreground(exec, &self.qemu.build(), "qemu-system-arm")
    }
}
