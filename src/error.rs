//! Error taxonomy
//!
//! Every error is attributable to a single VM. None of them is fatal to the
//! process; unexpected QEMU exits are not errors at all.

use crate::config::constants::{Architecture, DisplayDevice, DriveInterface, ImageType, NetworkDevice, ShareMode, Target};
use std::io;
use std::path::PathBuf;
use uuid::Uuid;

/// A single broken invariant found while validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("name must not be empty")]
    EmptyName,
    #[error("name '{0}' cannot be used as a bundle directory")]
    InvalidName(String),
    #[error("target {target} is not available for {architecture}")]
    TargetMismatch { architecture: Architecture, target: Target },
    #[error("at most one display is supported, found {0}")]
    TooManyDisplays(usize),
    #[error("display device {device} is not available for {architecture}")]
    DisplayDevice { architecture: Architecture, device: DisplayDevice },
    #[error("network {index}: device {device} is not available for {architecture}")]
    NetworkDevice { index: usize, architecture: Architecture, device: NetworkDevice },
    #[error("network {index}: bridged mode needs a bridge interface")]
    MissingBridgeInterface { index: usize },
    #[error("directory sharing via {0} needs a share path")]
    MissingSharePath(ShareMode),
    #[error("drive {index}: interface {interface} is not available for {architecture}")]
    DriveInterface { index: usize, architecture: Architecture, interface: DriveInterface },
    #[error("drive {index}: interface {interface} cannot hold a {image_type} image")]
    DriveCombination { index: usize, interface: DriveInterface, image_type: ImageType },
    #[error("drive {index}: {architecture} has no UEFI firmware for a variable store")]
    EfiVarsUnsupported { index: usize, architecture: Architecture },
    #[error("drive {index}: a fixed drive needs an image")]
    MissingImage { index: usize },
    #[error("drive {index}: a UEFI variable store needs UEFI boot")]
    EfiVarsWithoutUefi { index: usize },
    #[error("{feature} needs a SPICE display")]
    SpiceRequired { feature: &'static str },
    #[error("{architecture} has no 9p transport for directory sharing")]
    VirtfsUnsupported { architecture: Architecture },
    #[error("{feature} needs a USB controller")]
    UsbBusRequired { feature: &'static str },
    #[error("target {target} has no PCI bus for a USB controller")]
    UsbControllerUnsupported { target: Target },
    #[error("{architecture} has no UEFI firmware")]
    UefiUnsupported { architecture: Architecture },
    #[error("{architecture} has no TPM device")]
    TpmUnsupported { architecture: Architecture },
}

/// All invariant violations of one configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {}", .violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

/// Argument synthesis hit an input it cannot express.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("target {target} is not available for {architecture}")]
    TargetMismatch { architecture: Architecture, target: Target },
    #[error("at most one display is supported, found {0}")]
    TooManyDisplays(usize),
    #[error("display device {device} is not available for {architecture}")]
    UnsupportedDisplay { architecture: Architecture, device: DisplayDevice },
    #[error("network {index}: device {device} is not available for {architecture}")]
    UnsupportedNetwork { index: usize, architecture: Architecture, device: NetworkDevice },
    #[error("network {index}: bridged mode needs a bridge interface")]
    MissingBridgeInterface { index: usize },
    #[error("directory sharing via {0} needs a share path")]
    MissingSharePath(ShareMode),
    #[error("{architecture} has no 9p transport for directory sharing")]
    VirtfsUnsupported { architecture: Architecture },
    #[error("drive {index}: interface {interface} is not available for {architecture}")]
    UnsupportedDriveInterface { index: usize, architecture: Architecture, interface: DriveInterface },
    #[error("drive {index}: interface {interface} cannot hold a {image_type} image")]
    UnsupportedDriveCombination { index: usize, interface: DriveInterface, image_type: ImageType },
    #[error("drive {index}: a fixed drive needs an image")]
    MissingImage { index: usize },
    #[error("drive {index}: a UEFI variable store needs UEFI boot")]
    EfiVarsWithoutUefi { index: usize },
    #[error("{architecture} has no UEFI firmware")]
    UefiUnsupported { architecture: Architecture },
    #[error("{architecture} has no TPM device")]
    TpmUnsupported { architecture: Architecture },
    #[error("{feature} needs a SPICE display")]
    SpiceRequired { feature: &'static str },
    #[error("{feature} needs a USB controller")]
    UsbBusRequired { feature: &'static str },
    #[error("target {target} has no PCI bus for a USB controller")]
    UsbControllerUnsupported { target: Target },
}

/// A bundle could not be read back.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("VM {uuid} is already loaded from {}", .first.display())]
    DuplicateIdentity { uuid: Uuid, first: PathBuf },
}

/// Disk I/O failed while adding or removing a bundle.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("name '{0}' is already used by another VM")]
    NameTaken(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PersistenceError::Io { path: path.into(), source }
    }
}

/// Starting a VM failed; the VM stays idle.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{binary} not found (searched {})", .searched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    ExecutableNotFound { binary: String, searched: Vec<PathBuf> },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("failed to spawn {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors surfaced by [`crate::vm::manager::VmManager`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("VM '{0}' not found")]
    NotFound(String),
    #[error("VM '{name}' is running (pid {pid}); stop it before removing")]
    StillRunning { name: String, pid: u32 },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Persistence(PersistenceError::Invalid(err))
    }
}
