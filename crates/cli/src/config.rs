//! Machine description files.
//!
//! ```toml
//! cpus = 2
//! memory_mib = 4096
//! bridge = "br0"
//! adapters = ["52:54:00:12:34:56"]
//!
//! [[drive]]
//! path = "debian.qcow2"
//! interface = "virtio"
//!
//! [host]
//! accel = "kvm"
//! connect_timeout = 20
//! ```
//!
//! Relative drive and kernel paths are resolved against the directory of
//! the file. Without a `[host]` table the host configuration comes from the
//! environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use weaver::{Drive, DriveInterface, DriveMedia, HostConfig, ImageFormat};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineFile {
    pub cpus: Option<u32>,
    pub memory_mib: Option<u32>,
    pub ephemeral: Option<bool>,
    pub kernel: Option<PathBuf>,
    pub append: Option<String>,
    pub boot_order: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub extra_serials: usize,
    /// Existing host bridge the adapters are linked to.
    pub bridge: Option<String>,
    #[serde(default)]
    pub adapters: Vec<String>,
    #[serde(default, rename = "drive")]
    pub drives: Vec<DriveEntry>,
    pub host: Option<HostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriveEntry {
    pub path: PathBuf,
    pub format: Option<ImageFormat>,
    #[serde(default)]
    pub interface: DriveInterface,
    #[serde(default)]
    pub media: DriveMedia,
    pub index: Option<u32>,
    #[serde(default)]
    pub read_only: bool,
}

impl MachineFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut file = Self::parse(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        if let Some(base) = path.parent() {
            file.resolve_paths(base);
        }
        Ok(file)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn host_config(&self) -> HostConfig {
        self.host.clone().unwrap_or_else(HostConfig::from_env)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for drive in &mut self.drives {
            if drive.path.is_relative() {
                drive.path = base.join(&drive.path);
            }
        }
        if let Some(kernel) = self.kernel.as_mut().filter(|k| k.is_relative()) {
            *kernel = base.join(&*kernel);
        }
    }
}

impl DriveEntry {
    pub fn plain(path: PathBuf) -> Self {
        Self {
            path,
            format: None,
            interface: DriveInterface::default(),
            media: DriveMedia::default(),
            index: None,
            read_only: false,
        }
    }

    pub fn to_drive(&self) -> weaver::Result<Drive> {
        let mut drive = Drive::new(&self.path)?
            .with_interface(self.interface)
            .with_media(self.media);
        if let Some(format) = self.format {
            drive = drive.with_format(format);
        }
        if let Some(index) = self.index {
            drive = drive.with_index(index);
        }
        if self.read_only {
            drive = drive.read_only();
        }
        Ok(drive)
    }
}
