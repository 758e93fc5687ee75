//! Emulated-boot flow: size check → probe → loop → boot partition → QEMU.

use super::{finish, Stager};
use crate::error::Result;
use crate::image::{self, ImageFile};
use crate::lifecycle::{Mount, ResourceStack};
use crate::process::CommandExecutor;
use crate::qemu::{self, BootFileNames, BootFiles, QemuBuilder};
use crate::session::EmulatedBootSession;
use crate::signal::Interrupt;
use std::path::PathBuf;

const BOOT_PARTITION: u32 = 1;

#[derive(Debug, Clone)]
pub struct EmulatorOptions {
    pub binary: String,
    pub machine: String,
    pub cpu: String,
    pub memory_mb: u32,
    pub cores: u32,
    pub ssh_port: u16,
    pub extra_args: String,
    pub headless: bool,
    pub boot_files: BootFileNames,
}

#[derive(Debug, Clone)]
pub struct BootOptions {
    pub image: PathBuf,
    pub mount_boot: PathBuf,
    /// Grow the image to a power-of-two GiB when needed.
    pub resize: bool,
    pub qemu_img: String,
    pub emulator: EmulatorOptions,
}

impl BootOptions {
    fn qemu(&self, image: &ImageFile, files: BootFiles) -> QemuBuilder {
        let emu = &self.emulator;
        QemuBuilder::new(&emu.binary, &emu.machine, &emu.cpu)
            .memory_mb(emu.memory_mb)
            .cores(emu.cores)
            .boot_files(files)
            .sd_image(image.path.clone())
            .extra_cmdline(&emu.extra_args)
            .host_ssh_port(emu.ssh_port)
            .headless(emu.headless)
    }
}

/// Attach the image, mount its boot partition and locate the boot files.
pub fn prepare(
    stager: &Stager<'_>,
    stack: &mut ResourceStack<'_>,
    opts: &BootOptions,
    image: &ImageFile,
) -> Result<BootFiles> {
    let device = stager.attach(stack, &image.path)?;
    stager.mount(
        stack,
        Mount::device(device.partition(BOOT_PARTITION), &opts.mount_boot),
    )?;
    let files = qemu::find_boot_files(&opts.mount_boot, &opts.emulator.boot_files)?;
    stager.checkpoint()?;
    Ok(files)
}

/// Boot the image under QEMU and return the emulator's exit status.
///
/// The emulator reads the image file directly; the loop device only serves
/// to read the kernel and device tree from the boot partition.
pub fn run_boot(
    exec: &dyn CommandExecutor,
    interrupt: &Interrupt,
    opts: &BootOptions,
) -> Result<i32> {
    let image = ImageFile::open(&opts.image)?;
    let image = image::ensure_sd_size(exec, &image, opts.resize, &opts.qemu_img)?;
    qemu::probe_machine(exec, &opts.emulator.binary, &opts.emulator.machine)?;

    let stager = Stager::new(exec, interrupt);
    let mut stack = ResourceStack::new(exec);

    let status = prepare(&stager, &mut stack, opts, &image).and_then(|files| {
        let session = EmulatedBootSession {
            qemu: opts.qemu(&image, files),
        };
        session.run(exec)
    });

    finish(&mut stack);
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EnvironmentError, ProvisionError};
    use crate::process::fake::FakeExecutor;
    use crate::process::CommandOutput;
    use std::fs;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn options(temp: &TempDir, size: u64) -> BootOptions {
        let image = temp.path().join("raspios.img");
        fs::File::create(&image).unwrap().set_len(size).unwrap();
        BootOptions {
            image,
            mount_boot: temp.path().join("mnt/rpi-boot"),
            resize: true,
            qemu_img: "qemu-img".to_string(),
            emulator: EmulatorOptions {
                binary: "qemu-system-aarch64".to_string(),
                machine: "raspi4b".to_string(),
                cpu: "cortex-a72".to_string(),
                memory_mb: 2048,
                cores: 4,
                ssh_port: 2222,
                extra_args: String::new(),
                headless: true,
                boot_files: BootFileNames::default(),
            },
        }
    }

    fn populate_boot(opts: &BootOptions, with_dtb: bool) {
        fs::create_dir_all(&opts.mount_boot).unwrap();
        fs::write(opts.mount_boot.join("kernel8.img"), b"k").unwrap();
        if with_dtb {
            fs::write(opts.mount_boot.join("bcm2711-rpi-4-b.dtb"), b"d").unwrap();
        }
    }

    fn machine_list(exec: &FakeExecutor) {
        exec.respond(
            "qemu-system-aarch64 -machine help",
            CommandOutput {
                stdout: "Supported machines are:\nraspi4b  Raspberry Pi 4B\n".to_string(),
                ..Default::default()
            },
        );
    }

    #[test]
    fn test_boot_flow_order() {
        let temp = TempDir::new().unwrap();
        let opts = options(&temp, 4 * GIB);
        populate_boot(&opts, true);
        let exec = FakeExecutor::new();
        machine_list(&exec);
        exec.set_foreground_code(0);

        let status = run_boot(&exec, &Interrupt::manual(), &opts).unwrap();
        assert_eq!(status, 0);

        let boot = opts.mount_boot.display().to_string();
        let image = opts.image.display().to_string();
        let programs: Vec<String> = exec
            .calls()
            .into_iter()
            .filter(|c| !c.starts_with("mountpoint"))
            .collect();
        assert_eq!(programs.len(), 6);
        assert_eq!(programs[0], "qemu-system-aarch64 -machine help");
        assert_eq!(programs[1], format!("losetup -P -f --show {image}"));
        assert_eq!(programs[2], format!("mount /dev/loop7p1 {boot}"));
        assert!(programs[3].starts_with("qemu-system-aarch64 -M raspi4b"));
        assert!(programs[3].contains(&format!("file={image}")));
        assert!(!programs[3].contains("/dev/loop7"));
        assert_eq!(programs[4], format!("umount {boot}"));
        assert_eq!(programs[5], "losetup -d /dev/loop7");
    }

    #[test]
    fn test_missing_dtb_aborts_and_still_detaches() {
        let temp = TempDir::new().unwrap();
        let opts = options(&temp, 4 * GIB);
        populate_boot(&opts, false);
        let exec = FakeExecutor::new();
        machine_list(&exec);

        let err = run_boot(&exec, &Interrupt::manual(), &opts).unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::Environment(EnvironmentError::MissingBootArtifact { ref name, .. })
                if name == "bcm2711-rpi-4-b.dtb"
        ));
        assert_eq!(exec.calls_to("qemu-system-aarch64").len(), 1);
        assert_eq!(exec.calls().last().unwrap(), "losetup -d /dev/loop7");
        assert!(exec.mounted().is_empty());
        assert!(exec.attached_loops().is_empty());
    }

    #[test]
    fn test_unsupported_machine_fails_before_acquisition() {
        let temp = TempDir::new().unwrap();
        let mut opts = options(&temp, 4 * GIB);
        opts.emulator.machine = "raspi5b".to_string();
        let exec = FakeExecutor::new();
        machine_list(&exec);

        let err = run_boot(&exec, &Interrupt::manual(), &opts).unwrap_err();

        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("'raspi5b'"));
        assert!(exec.calls_to("losetup").is_empty());
    }

    #[test]
    fn test_unaligned_image_is_resized_first() {
        let temp = TempDir::new().unwrap();
        let opts = options(&temp, 3_700_000_000);
        populate_boot(&opts, true);
        let exec = FakeExecutor::new();
        machine_list(&exec);

        run_boot(&exec, &Interrupt::manual(), &opts).unwrap();

        let calls = exec.calls();
        assert_eq!(
            calls[0],
            format!("qemu-img resize -f raw {} {}", opts.image.display(), 4 * GIB)
        );
    }

    #[test]
    fn test_unaligned_image_without_resize_is_a_precondition_error() {
        let temp = TempDir::new().unwrap();
        let mut opts = options(&temp, 3_700_000_000);
        opts.resize = false;
        let exec = FakeExecutor::new();

        let err = run_boot(&exec, &Interrupt::manual(), &opts).unwrap_err();

        assert_eq!(err.exit_code(), 2);
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_emulator_exit_status_becomes_tool_status() {
        let temp = TempDir::new().unwrap();
        let opts = options(&temp, 2 * GIB);
        populate_boot(&opts, true);
        let exec = FakeExecutor::new();
        machine_list(&exec);
        exec.set_foreground_code(3);

        assert_eq!(run_boot(&exec, &Interrupt::manual(), &opts).unwrap(), 3);
        assert_eq!(exec.calls().last().unwrap(), "losetup -d /dev/loop7");
    }

    #[test]
    fn test_interrupt_after_boot_mount_unmounts_and_detaches() {
        let temp = TempDir::new().unwrap();
        let opts = options(&temp, 2 * GIB);
        populate_boot(&opts, true);
        let exec = FakeExecutor::new();
        machine_list(&exec);
        let interrupt = Interrupt::manual();
        exec.interrupt_on("mount /dev/loop7p1", &interrupt);

        let err = run_boot(&exec, &interrupt, &opts).unwrap_err();

        assert_eq!(err.exit_code(), 130);
        assert_eq!(exec.calls_to("qemu-system-aarch64").len(), 1);
        assert_eq!(
            exec.calls_to("umount"),
            vec![format!("umount {}", opts.mount_boot.display())]
        );
        assert_eq!(exec.calls().last().unwrap(), "losetup -d /dev/loop7");
        assert!(exec.attached_loops().is_empty());
    }

    #[test]
    fn test_interrupt_during_emulator_still_releases_everything() {
        let temp = TempDir::new().unwrap();
        let opts = options(&temp, 2 * GIB);
        populate_boot(&opts, true);
        let exec = FakeExecutor::new();
        machine_list(&exec);
        let interrupt = Interrupt::manual();
        exec.interrupt_on("qemu-system-aarch64 -M", &interrupt);
        exec.set_foreground_code(130);

        assert_eq!(run_boot(&exec, &interrupt, &opts).unwrap(), 130);
        assert!(exec.mounted().is_empty());
        assert!(exec.attached_loops().is_empty());
    }

    #[test]
    fn test_interrupt_before_acquisition() {
        let temp = TempDir::new().unwrap();
        let opts = options(&temp, 2 * GIB);
        let exec = FakeExecutor::new();
        machine_list(&exec);
        let interrupt = Interrupt::manual();
        interrupt.trigger();

        let err = run_boot(&exec, &interrupt, &opts).unwrap_err();

        assert!(matches!(err, ProvisionError::Interrupted));
        assert!(exec.calls_to("losetup").is_empty());
    }
}
