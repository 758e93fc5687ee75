//! TOML configuration.
//!
//! Values come from built-in defaults, then an optional config file, then
//! command-line flags (applied by the binary on the loaded [`Config`]).
//!
//! ```toml
//! [paths]
//! image = "/srv/rpi/raspios.img"
//! mount_root = "/mnt/rpi-root"
//!
//! [chroot]
//! shell = "/bin/zsh"
//! project_src = "~/src/tmc5130"
//! project_dst = "/opt/tmc5130"
//! project_mode = "copy"
//!
//! [emulator]
//! memory_mb = 4096
//! headless = true
//! ```

use crate::error::PreconditionError;
use crate::image::fetch::DEFAULT_IMAGE_URL;
use crate::qemu::BootFileNames;
use crate::stages::boot::EmulatorOptions;
use crate::stages::{BootOptions, ChrootOptions, ProjectMode, ProjectStaging};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

const CONFIG_DIR: &str = "rpi-image";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub chroot: ChrootConfig,
    pub emulator: EmulatorConfig,
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub image: PathBuf,
    pub mount_root: PathBuf,
    pub mount_boot: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            image: PathBuf::from("raspios.img"),
            mount_root: PathBuf::from("/mnt/rpi-root"),
            mount_boot: PathBuf::from("/mnt/rpi-boot"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChrootConfig {
    pub interpreter: PathBuf,
    pub interpreter_dir: PathBuf,
    pub shell: String,
    pub binds: Vec<PathBuf>,
    pub project_src: Option<PathBuf>,
    pub project_dst: PathBuf,
    pub project_mode: ProjectMode,
}

impl Default for ChrootConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("/usr/bin/qemu-aarch64-static"),
            interpreter_dir: PathBuf::from("/usr/bin"),
            shell: "/bin/bash".to_string(),
            binds: ["/dev", "/proc", "/sys", "/run"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            project_src: None,
            project_dst: PathBuf::from("/opt/project"),
            project_mode: ProjectMode::Bind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorConfig {
    pub binary: String,
    pub qemu_img: String,
    pub machine: String,
    pub cpu: String,
    pub memory_mb: u32,
    pub cores: u32,
    pub ssh_port: u16,
    pub extra_args: String,
    pub headless: bool,
    pub resize: bool,
    pub kernel: String,
    pub dtb: String,
    pub initrd: String,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        let names = BootFileNames::default();
        Self {
            binary: "qemu-system-aarch64".to_string(),
            qemu_img: "qemu-img".to_string(),
            machine: "raspi4b".to_string(),
            cpu: "cortex-a72".to_string(),
            memory_mb: 2048,
            cores: 4,
            ssh_port: 2222,
            extra_args: String::new(),
            headless: false,
            resize: true,
            kernel: names.kernel,
            dtb: names.dtb,
            initrd: names.initrd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub url: String,
    /// Defaults to the current directory.
    pub workdir: Option<PathBuf>,
    pub sha256: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_IMAGE_URL.to_string(),
            workdir: None,
            sha256: None,
        }
    }
}

impl Config {
    /// Parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config '{}'", path.display()))?;
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/rpi-image/config.toml` (or the platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load `explicit` if given, else the default file if it exists, else
    /// built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!("using config {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), PreconditionError> {
        let emu = &self.emulator;
        if emu.memory_mb == 0 {
            return Err(PreconditionError::Invalid(
                "emulator memory must be greater than zero".to_string(),
            ));
        }
        if emu.cores == 0 {
            return Err(PreconditionError::Invalid(
                "emulator core count must be greater than zero".to_string(),
            ));
        }
        if self.paths.mount_root == self.paths.mount_boot {
            return Err(PreconditionError::Invalid(format!(
                "root and boot mount points must differ (both {})",
                self.paths.mount_root.display()
            )));
        }
        check_inside_root(&self.chroot.project_dst, "project destination")?;
        check_inside_root(&self.chroot.interpreter_dir, "interpreter directory")?;
        for bind in &self.chroot.binds {
            if !bind.is_absolute() {
                return Err(PreconditionError::Invalid(format!(
                    "bind source must be absolute, got '{}'",
                    bind.display()
                )));
            }
            check_inside_root(bind, "bind source")?;
        }
        Ok(())
    }

    /// Options for the chroot flow. `command` replaces the shell when non-empty.
    pub fn chroot_options(&self, command: Vec<String>) -> ChrootOptions {
        let project = self.chroot.project_src.as_ref().map(|src| ProjectStaging {
            src: expand_home(src),
            dst: self.chroot.project_dst.clone(),
            mode: self.chroot.project_mode,
        });

        ChrootOptions {
            image: expand_home(&self.paths.image),
            mount_root: self.paths.mount_root.clone(),
            mount_boot: self.paths.mount_boot.clone(),
            interpreter: self.chroot.interpreter.clone(),
            interpreter_dir: self.chroot.interpreter_dir.clone(),
            shell: self.chroot.shell.clone(),
            binds: self.chroot.binds.clone(),
            project,
            command,
        }
    }

    pub fn boot_options(&self) -> BootOptions {
        let emu = &self.emulator;
        BootOptions {
            image: expand_home(&self.paths.image),
            mount_boot: self.paths.mount_boot.clone(),
            resize: emu.resize,
            qemu_img: emu.qemu_img.clone(),
            emulator: EmulatorOptions {
                binary: emu.binary.clone(),
                machine: emu.machine.clone(),
                cpu: emu.cpu.clone(),
                memory_mb: emu.memory_mb,
                cores: emu.cores,
                ssh_port: emu.ssh_port,
                extra_args: emu.extra_args.clone(),
                headless: emu.headless,
                boot_files: BootFileNames {
                    kernel: emu.kernel.clone(),
                    dtb: emu.dtb.clone(),
                    initrd: emu.initrd.clone(),
                },
            },
        }
    }
}

/// Reject paths that would escape the mounted root once joined under it.
fn check_inside_root(path: &Path, field: &str) -> Result<(), PreconditionError> {
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(PreconditionError::Invalid(format!(
            "{field} contains '..': '{}'",
            path.display()
        )));
    }
    Ok(())
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
