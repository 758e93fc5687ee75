//! Error taxonomy for provisioning runs.
//!
//! Every layer except teardown fails fast and lets the
//! [`ResourceStack`](crate::lifecycle::ResourceStack) unwind. Teardown
//! failures inside a run are logged by the stack; only an explicit release
//! requested by the user (`rpi-image detach`) surfaces one.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to attach or detach a loop device.
#[derive(Debug, Error)]
pub enum BinderError {
    #[error("no free loop device available for {image}: {detail}")]
    NoFreeDevice { image: PathBuf, detail: String },

    #[error("cannot open image {image}: {detail}")]
    ImageUnreadable { image: PathBuf, detail: String },

    #[error("losetup returned no device for {0}")]
    EmptyDevice(PathBuf),

    #[error("failed to detach {device}: {detail}")]
    Detach { device: String, detail: String },

    #[error("failed to run losetup: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failure to mount or unmount a single target.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("{0} is already mounted")]
    AlreadyMounted(PathBuf),

    #[error("mount source {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("permission denied mounting {0} (are you root?)")]
    PermissionDenied(PathBuf),

    #[error("{0} is busy")]
    TargetBusy(PathBuf),

    #[error("cannot create mount point {path}: {source}")]
    CreateTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mount of {target} failed: {detail}")]
    Failed { target: PathBuf, detail: String },

    #[error("failed to run mount command: {0}")]
    Spawn(#[source] std::io::Error),
}

impl MountError {
    /// Recoverable errors skip the step instead of aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MountError::AlreadyMounted(_))
    }
}

/// Invalid input detected before any resource is acquired.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("image not found: {0}")]
    ImageMissing(PathBuf),

    #[error("project source not found: {0}")]
    ProjectSourceMissing(PathBuf),

    #[error(
        "image size {size} bytes is not a power-of-two number of GiB; \
         resize to {target} bytes or drop --no-resize"
    )]
    ImageSize { size: u64, target: u64 },

    #[error("cross-architecture interpreter not found on host: {0}")]
    InterpreterMissing(PathBuf),

    #[error("this command needs root privileges (run with sudo)")]
    NotRoot,

    #[error("{0}")]
    Invalid(String),
}

/// Host environment can't support the requested operation.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("required binary '{binary}' not found (install: {package})")]
    MissingBinary { binary: String, package: String },

    #[error("missing required host tools:\n{0}")]
    MissingTools(String),

    #[error("the installed emulator does not support machine '{0}'")]
    UnsupportedMachine(String),

    #[error("boot artifact {name} not found in {dir}")]
    MissingBootArtifact { name: String, dir: PathBuf },
}

/// A resource could not be acquired; everything acquired before it is released.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error(transparent)]
    Binder(#[from] BinderError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("failed to stage {what}: {source}")]
    Staging {
        what: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A release action failed.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error(transparent)]
    Binder(#[from] BinderError),

    #[error(transparent)]
    Mount(#[from] MountError),
}

/// Top-level error of a provisioning run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error("interrupted while preparing the image")]
    Interrupted,

    #[error(transparent)]
    Release(#[from] TeardownError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    /// Process exit code used by the CLI for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            ProvisionError::Precondition(_) => 2,
            ProvisionError::Environment(_) => 3,
            ProvisionError::Acquisition(_) => 4,
            ProvisionError::Interrupted => 130,
            ProvisionError::Release(_) | ProvisionError::Other(_) => 1,
        }
    }
}

impl From<MountError> for ProvisionError {
    fn from(err: MountError) -> Self {
        ProvisionError::Acquisition(AcquisitionError::Mount(err))
    }
}

impl From<BinderError> for ProvisionError {
    fn from(err: BinderError) -> Self {
        ProvisionError::Acquisition(AcquisitionError::Binder(err))
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
