//! QEMU command construction for the Raspberry Pi boards.
//!
//! Provides `QemuBuilder` for the `qemu-system-aarch64` invocation,
//! `probe_machine()` for the supported-machine check and `find_boot_files()`
//! for locating the kernel and device tree on the mounted boot partition.

use crate::error::EnvironmentError;
use crate::process::{Cmd, CommandExecutor};
use std::io;
use std::path::{Path, PathBuf};

/// Base kernel command line; caller-supplied text is appended.
pub const KERNEL_CMDLINE: &str =
    "root=/dev/mmcblk0p2 rw rootwait console=serial0,115200 console=ttyAMA0";

/// Guest port exposed through the user-mode network's host forward.
const GUEST_SSH_PORT: u16 = 22;

/// Kernel, device tree and optional initramfs on the boot partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFiles {
    pub kernel: PathBuf,
    pub dtb: PathBuf,
    pub initrd: Option<PathBuf>,
}

/// File names looked up on the boot partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFileNames {
    pub kernel: String,
    pub dtb: String,
    pub initrd: String,
}

impl Default for BootFileNames {
    fn default() -> Self {
        Self {
            kernel: "kernel8.img".to_string(),
            dtb: "bcm2711-rpi-4-b.dtb".to_string(),
            initrd: "initramfs8".to_string(),
        }
    }
}

/// Locate boot artifacts in `boot_dir`. Kernel and DTB are required.
pub fn find_boot_files(
    boot_dir: &Path,
    names: &BootFileNames,
) -> Result<BootFiles, EnvironmentError> {
    let required = |name: &str| {
        let path = boot_dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(EnvironmentError::MissingBootArtifact {
                name: name.to_string(),
                dir: boot_dir.to_path_buf(),
            })
        }
    };

    let kernel = required(&names.kernel)?;
    let dtb = required(&names.dtb)?;
    let initrd = Some(boot_dir.join(&names.initrd)).filter(|p| p.is_file());

    Ok(BootFiles {
        kernel,
        dtb,
        initrd,
    })
}

/// Check that `emulator` knows `machine`.
///
/// A missing binary is fatal. If the probe itself fails (restricted
/// environments) the check is skipped; only a successful listing without the
/// machine is an error.
pub fn probe_machine(
    exec: &dyn CommandExecutor,
    emulator: &str,
    machine: &str,
) -> Result<(), EnvironmentError> {
    let cmd = Cmd::new(emulator).args(["-machine", "help"]);
    let out = match exec.output(&cmd) {
        Ok(out) => out,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(EnvironmentError::MissingBinary {
                binary: emulator.to_string(),
                package: "qemu-system-arm".to_string(),
            });
        }
        Err(err) => {
            tracing::warn!("machine probe could not run ({err}); skipping check");
            return Ok(());
        }
    };

    if !out.success() {
        tracing::warn!(
            "machine probe failed ({}); skipping check",
            out.failure_detail()
        );
        return Ok(());
    }

    let supported = out
        .stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == machine);
    if !supported {
        return Err(EnvironmentError::UnsupportedMachine(machine.to_string()));
    }
    Ok(())
}

/// Builder for the emulator command line.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    binary: String,
    machine: String,
    cpu: String,
    memory_mb: u32,
    cores: u32,
    boot: Option<BootFiles>,
    sd_image: Option<PathBuf>,
    extra_cmdline: String,
    host_ssh_port: u16,
    headless: bool,
}

impl QemuBuilder {
    pub fn new(binary: &str, machine: &str, cpu: &str) -> Self {
        Self {
            binary: binary.to_string(),
            machine: machine.to_string(),
            cpu: cpu.to_string(),
            memory_mb: 2048,
            cores: 4,
            boot: None,
            sd_image: None,
            extra_cmdline: String::new(),
            host_ssh_port: 2222,
            headless: false,
        }
    }

    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    pub fn boot_files(mut self, boot: BootFiles) -> Self {
        self.boot = Some(boot);
        self
    }

    /// Raw SD card backend. Must be the image file, not the loop device.
    pub fn sd_image(mut self, image: PathBuf) -> Self {
        self.sd_image = Some(image);
        self
    }

    pub fn extra_cmdline(mut self, extra: &str) -> Self {
        self.extra_cmdline = extra.trim().to_string();
        self
    }

    pub fn host_ssh_port(mut self, port: u16) -> Self {
        self.host_ssh_port = port;
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn kernel_cmdline(&self) -> String {
        if self.extra_cmdline.is_empty() {
            KERNEL_CMDLINE.to_string()
        } else {
            format!("{} {}", KERNEL_CMDLINE, self.extra_cmdline)
        }
    }

    pub fn build(&self) -> Cmd {
        let mut cmd = Cmd::new(&self.binary)
            .args(["-M", &self.machine])
            .args(["-cpu", &self.cpu])
            .args(["-m", &self.memory_mb.to_string()])
            .args(["-smp", &self.cores.to_string()]);

        if let Some(boot) = &self.boot {
            cmd = cmd
                .arg("-kernel")
                .arg_path(&boot.kernel)
                .arg("-dtb")
                .arg_path(&boot.dtb);
        }

        if let Some(image) = &self.sd_image {
            cmd = cmd.args([
                "-drive".to_string(),
                format!("if=sd,format=raw,file={}", image.display()),
            ]);
        }

        cmd = cmd
            .args(["-append".to_string(), self.kernel_cmdline()])
            .args(["-serial", "stdio"])
            .args([
                "-netdev".to_string(),
                format!(
                    "user,id=net0,hostfwd=tcp::{}-:{}",
                    self.host_ssh_port, GUEST_SSH_PORT
                ),
            ])
            .args(["-device", "usb-net,netdev=net0"]);

        if self.headless {
            cmd = cmd.args(["-display", "none"]);
        }

        if let Some(initrd) = self.boot.as_ref().and_then(|b| b.initrd.as_ref()) {
            cmd = cmd.arg("-initrd").arg_path(initrd);
        }

        cmd
    }
}
