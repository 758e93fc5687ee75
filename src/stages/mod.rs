//! Staged acquisition for the chroot and emulated-boot flows.
//!
//! Each flow validates its preconditions, builds a [`ResourceStack`] step by
//! step, hands the prepared tree to a session and drains the stack on every
//! exit path. A step only starts once the previous step's kernel resource is
//! in place, and an interrupt stops acquisition at the next step boundary.

pub mod boot;
pub mod chroot;
pub mod files;

pub use boot::{run_boot, BootOptions};
pub use chroot::{run_chroot, ChrootOptions};

use crate::error::{AcquisitionError, ProvisionError, Result};
use crate::lifecycle::{LoopDevice, LoopDeviceBinder, Mount, MountPoint, ResourceStack};
use crate::process::CommandExecutor;
use crate::signal::Interrupt;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// How the project tree is exposed inside the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProjectMode {
    /// Live bind mount, released at teardown.
    #[default]
    Bind,
    /// Independent recursive copy, left in the image.
    Copy,
}

/// A host project directory to make available inside the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectStaging {
    pub src: PathBuf,
    /// Path inside the root, e.g. `/opt/project`.
    pub dst: PathBuf,
    pub mode: ProjectMode,
}

/// Acquisition steps shared by both flows.
pub struct Stager<'a> {
    exec: &'a dyn CommandExecutor,
    interrupt: &'a Interrupt,
}

impl<'a> Stager<'a> {
    pub fn new(exec: &'a dyn CommandExecutor, interrupt: &'a Interrupt) -> Self {
        Self { exec, interrupt }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.interrupt.is_requested() {
            tracing::warn!("interrupt received, aborting acquisition");
            return Err(ProvisionError::Interrupted);
        }
        Ok(())
    }

    /// Attach the image and push its detach.
    pub fn attach(&self, stack: &mut ResourceStack<'_>, image: &Path) -> Result<LoopDevice> {
        self.checkpoint()?;
        let device = LoopDeviceBinder::new(self.exec).attach(image)?;
        stack.push(device.clone());
        Ok(device)
    }

    /// Mount and push the unmount. A target that is already mounted is
    /// skipped and not pushed, since this run does not own it.
    pub fn mount(&self, stack: &mut ResourceStack<'_>, mount: Mount) -> Result<bool> {
        self.checkpoint()?;
        match MountPoint::new(self.exec).mount(&mount) {
            Ok(()) => {
                stack.push(mount);
                Ok(true)
            }
            Err(err) if err.is_recoverable() => {
                tracing::warn!("{err}; leaving it in place");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Bind each host directory onto the same path under `root`.
    pub fn bind_host_dirs(
        &self,
        stack: &mut ResourceStack<'_>,
        root: &Path,
        dirs: &[PathBuf],
    ) -> Result<()> {
        for dir in dirs {
            let target = root.join(files::strip_root(dir));
            self.mount(stack, Mount::bind(dir, target))?;
        }
        Ok(())
    }

    pub fn install_interpreter(
        &self,
        root: &Path,
        interpreter: &Path,
        dest_dir: &Path,
    ) -> Result<()> {
        self.checkpoint()?;
        files::install_interpreter(root, interpreter, dest_dir).map_err(|source| {
            AcquisitionError::Staging {
                what: "interpreter".to_string(),
                source,
            }
        })?;
        Ok(())
    }

    /// Bind (pushed) or copy (not pushed) the project under `root`.
    pub fn stage_project(
        &self,
        stack: &mut ResourceStack<'_>,
        root: &Path,
        project: &ProjectStaging,
    ) -> Result<()> {
        let target = root.join(files::strip_root(&project.dst));
        match project.mode {
            ProjectMode::Bind => {
                self.mount(stack, Mount::bind(&project.src, target))?;
            }
            ProjectMode::Copy => {
                self.checkpoint()?;
                files::copy_tree(&project.src, &target).map_err(|source| {
                    AcquisitionError::Staging {
                        what: format!("project copy into {}", target.display()),
                        source,
                    }
                })?;
                tracing::info!(
                    "copied {} to {}",
                    project.src.display(),
                    target.display()
                );
            }
        }
        Ok(())
    }
}

/// Drain and log anything teardown could not release.
fn finish(stack: &mut ResourceStack<'_>) {
    let report = stack.drain();
    for (label, err) in &report.failures {
        tracing::warn!("still held after teardown: {label} ({err})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeExecutor;
    use tempfile::TempDir;

    #[test]
    fn test_interrupt_stops_before_attach() {
        let exec = FakeExecutor::new();
        let interrupt = Interrupt::manual();
        interrupt.trigger();
        let stager = Stager::new(&exec, &interrupt);
        let mut stack = ResourceStack::new(&exec);

        let err = stager
            .attach(&mut stack, Path::new("/srv/raspios.img"))
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Interrupted));
        assert!(stack.is_empty());
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_already_mounted_target_is_not_pushed() {
        let temp = TempDir::new().unwrap();
        let exec = FakeExecutor::new();
        exec.premount(&temp.path().display().to_string());
        let interrupt = Interrupt::manual();
        let stager = Stager::new(&exec, &interrupt);
        let mut stack = ResourceStack::new(&exec);

        let mounted = stager
            .mount(&mut stack, Mount::device("/dev/loop7p2", temp.path()))
            .unwrap();

        assert!(!mounted);
        assert!(stack.is_empty());
        drop(stack);
        assert_eq!(exec.mounted(), vec![temp.path().display().to_string()]);
    }

    #[test]
    fn test_copy_mode_pushes_nothing() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("proj");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("Makefile"), "all:\n").unwrap();
        let root = temp.path().join("root");
        let exec = FakeExecutor::new();
        let interrupt = Interrupt::manual();
        let stager = Stager::new(&exec, &interrupt);
        let mut stack = ResourceStack::new(&exec);

        stager
            .stage_project(
                &mut stack,
                &root,
                &ProjectStaging {
                    src,
                    dst: PathBuf::from("/opt/proj"),
                    mode: ProjectMode::Copy,
                },
            )
            .unwrap();

        assert!(stack.is_empty());
        assert!(root.join("opt/proj/Makefile").is_file());
    }
}
