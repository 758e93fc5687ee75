//! Chroot flow: loop → root → boot → interpreter → host binds → project → shell.

use super::{finish, ProjectStaging, Stager};
use crate::error::{PreconditionError, Result};
use crate::image::ImageFile;
use crate::lifecycle::{Mount, ResourceStack};
use crate::process::CommandExecutor;
use crate::session::ChrootSession;
use crate::signal::Interrupt;
use std::path::PathBuf;

/// Partition holding the root filesystem.
const ROOT_PARTITION: u32 = 2;
/// FAT partition with firmware, kernel and device trees.
const BOOT_PARTITION: u32 = 1;

#[derive(Debug, Clone)]
pub struct ChrootOptions {
    pub image: PathBuf,
    pub mount_root: PathBuf,
    pub mount_boot: PathBuf,
    /// Static user-mode emulator on the host, e.g. `/usr/bin/qemu-aarch64-static`.
    pub interpreter: PathBuf,
    /// Directory inside the root that receives the interpreter.
    pub interpreter_dir: PathBuf,
    pub shell: String,
    /// Host directories bound into the root, in order.
    pub binds: Vec<PathBuf>,
    pub project: Option<ProjectStaging>,
    /// Runs instead of the interactive shell when non-empty.
    pub command: Vec<String>,
}

fn check_preconditions(opts: &ChrootOptions) -> Result<ImageFile> {
    let image = ImageFile::open(&opts.image)?;
    if !opts.interpreter.is_file() {
        return Err(PreconditionError::InterpreterMissing(opts.interpreter.clone()).into());
    }
    if let Some(project) = &opts.project {
        if !project.src.exists() {
            return Err(PreconditionError::ProjectSourceMissing(project.src.clone()).into());
        }
    }
    Ok(image)
}

/// Acquire everything the chroot session needs, pushing each resource onto
/// `stack` as it is acquired.
pub fn prepare(
    stager: &Stager<'_>,
    stack: &mut ResourceStack<'_>,
    opts: &ChrootOptions,
    image: &ImageFile,
) -> Result<()> {
    let device = stager.attach(stack, &image.path)?;
    stager.mount(
        stack,
        Mount::device(device.partition(ROOT_PARTITION), &opts.mount_root),
    )?;
    stager.mount(
        stack,
        Mount::device(device.partition(BOOT_PARTITION), &opts.mount_boot),
    )?;
    stager.install_interpreter(&opts.mount_root, &opts.interpreter, &opts.interpreter_dir)?;
    stager.bind_host_dirs(stack, &opts.mount_root, &opts.binds)?;
    if let Some(project) = &opts.project {
        stager.stage_project(stack, &opts.mount_root, project)?;
    }
    stager.checkpoint()
}

/// Enter the image as a chroot and return the shell's exit status.
///
/// Everything acquired is released before this returns, whether the session
/// ran, acquisition failed partway, or an interrupt arrived.
pub fn run_chroot(
    exec: &dyn CommandExecutor,
    interrupt: &Interrupt,
    opts: &ChrootOptions,
) -> Result<i32> {
    let image = check_preconditions(opts)?;
    let stager = Stager::new(exec, interrupt);
    let mut stack = ResourceStack::new(exec);

    let status = prepare(&stager, &mut stack, opts, &image).and_then(|()| {
        tracing::info!("entering chroot at {}", opts.mount_root.display());
        ChrootSession {
            root: opts.mount_root.clone(),
            shell: opts.shell.clone(),
            command: opts.command.clone(),
        }
        .run(exec)
    });

    finish(&mut stack);
    status
}
