//! Host-wide configuration.
//!
//! A [`HostConfig`] is built once at startup and handed to machine builders
//! and network constructors. Nothing in weaver reads the environment after
//! that point.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_QEMU: &str = "qemu-system-x86_64";
const DEFAULT_QEMU_IMG: &str = "qemu-img";
const DEFAULT_IP: &str = "ip";

/// Smallest console buffer accepted; anything lower drops boot banners.
const MIN_CONSOLE_BUFFER: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Hypervisor binary.
    pub qemu: PathBuf,
    /// Image tool used to create ephemeral overlays.
    pub qemu_img: PathBuf,
    /// `ip(8)` binary used for bridges, taps and links.
    pub ip: PathBuf,
    /// Parent of per-machine runtime directories. Defaults to the system temp dir.
    pub runtime_dir: Option<PathBuf>,
    /// Hypervisor accelerator, `None` for plain emulation.
    pub accel: Option<String>,
    /// How long `start()` keeps retrying the control and console sockets.
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// How long a graceful stop waits before falling back to a kill.
    #[serde(with = "secs")]
    pub shutdown_timeout: Duration,
    /// Default deadline for a single control channel command.
    #[serde(with = "secs")]
    pub command_timeout: Duration,
    /// Bytes of unmatched console output kept per serial port.
    pub console_buffer_limit: usize,
    /// How often the DHCP wait polls host state.
    #[serde(with = "secs")]
    pub dhcp_poll_interval: Duration,
    /// dnsmasq-style lease file consulted by the DHCP wait.
    pub lease_file: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            qemu: PathBuf::from(DEFAULT_QEMU),
            qemu_img: PathBuf::from(DEFAULT_QEMU_IMG),
            ip: PathBuf::from(DEFAULT_IP),
            runtime_dir: None,
            accel: Some("kvm".to_string()),
            connect_timeout: Duration::from_secs(50),
            shutdown_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
            console_buffer_limit: 1024 * 1024,
            dhcp_poll_interval: Duration::from_millis(500),
            lease_file: None,
        }
    }
}

impl HostConfig {
    /// Builds a configuration from `WEAVER_*` environment variables, resolving
    /// binaries that were not given explicitly through `PATH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.qemu = binary_from_env("WEAVER_QEMU", DEFAULT_QEMU);
        config.qemu_img = binary_from_env("WEAVER_QEMU_IMG", DEFAULT_QEMU_IMG);
        config.ip = binary_from_env("WEAVER_IP", DEFAULT_IP);

        if let Ok(dir) = std::env::var("WEAVER_RUNTIME_DIR") {
            config.runtime_dir = Some(PathBuf::from(dir));
        }
        if let Ok(file) = std::env::var("WEAVER_LEASE_FILE") {
            config.lease_file = Some(PathBuf::from(file));
        }
        if let Ok(accel) = std::env::var("WEAVER_ACCEL") {
            config.accel = if accel.is_empty() || accel == "none" {
                None
            } else {
                Some(accel)
            };
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
            ("command_timeout", self.command_timeout),
            ("dhcp_poll_interval", self.dhcp_poll_interval),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.console_buffer_limit < MIN_CONSOLE_BUFFER {
            return Err(Error::InvalidConfig(format!(
                "console_buffer_limit must be at least {MIN_CONSOLE_BUFFER} bytes"
            )));
        }
        Ok(())
    }

    pub fn runtime_root(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn with_runtime_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.runtime_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

fn binary_from_env(var: &str, default: &str) -> PathBuf {
    if let Ok(path) = std::env::var(var) {
        return PathBuf::from(path);
    }
    which::which(default).unwrap_or_else(|_| PathBuf::from(default))
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
