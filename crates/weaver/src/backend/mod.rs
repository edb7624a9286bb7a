//! Hypervisor process management.

mod qemu;

pub use qemu::QemuBackend;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use weaver_core::{Drive, DriveInterface, DriveMedia, ImageFormat, MacAddress, ResourceConfig, Result};

/// A drive as handed to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveAttachment {
    /// File the hypervisor opens: the drive itself or its overlay.
    pub file: PathBuf,
    pub format: ImageFormat,
    pub interface: DriveInterface,
    pub media: DriveMedia,
    pub index: Option<u32>,
    pub read_only: bool,
}

impl DriveAttachment {
    /// Attaches the drive's own backing file.
    pub fn direct(drive: &Drive) -> Self {
        Self {
            file: drive.path().to_path_buf(),
            format: drive.format(),
            interface: drive.interface(),
            media: drive.media(),
            index: drive.index(),
            read_only: drive.is_read_only(),
        }
    }

    /// Attaches a qcow2 overlay in place of the drive's backing file.
    pub fn overlay(drive: &Drive, overlay: &Path) -> Self {
        Self {
            file: overlay.to_path_buf(),
            format: ImageFormat::Qcow2,
            ..Self::direct(drive)
        }
    }
}

/// A guest NIC and the host tap it is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicAttachment {
    pub tap: String,
    pub mac: MacAddress,
    pub model: String,
}

/// Everything needed to launch one hypervisor process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub resources: ResourceConfig,
    pub drives: Vec<DriveAttachment>,
    pub nics: Vec<NicAttachment>,
    pub control_socket: PathBuf,
    pub serial_sockets: Vec<PathBuf>,
    /// Receives the hypervisor's stderr.
    pub log_file: PathBuf,
    pub accel: Option<String>,
    pub kernel: Option<PathBuf>,
    pub kernel_append: Option<String>,
    pub boot_order: Option<String>,
    pub extra_args: Vec<String>,
}

/// How a hypervisor process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmmExit {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
}

/// A running hypervisor process.
#[async_trait]
pub trait VmmProcess: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// Returns the exit status if the process has already exited.
    async fn try_wait(&self) -> Result<Option<VmmExit>>;

    async fn wait(&self) -> Result<VmmExit>;

    /// Asks the process to exit (SIGTERM).
    async fn terminate(&self) -> Result<()>;

    /// Kills the process (SIGKILL).
    async fn kill(&self) -> Result<()>;
}

/// Launches hypervisor processes.
#[async_trait]
pub trait HypervisorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Creates a qcow2 overlay at `overlay` backed by `drive`.
    async fn create_overlay(&self, drive: &Drive, overlay: &Path) -> Result<()>;

    /// Starts the process. The control and serial sockets in `spec` may not
    /// accept connections immediately.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn VmmProcess>>;
}
