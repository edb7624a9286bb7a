mod drive;
mod mac;

pub use drive::{Drive, DriveInterface, DriveMedia, ImageFormat};
pub use mac::MacAddress;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// CPU and memory given to a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub cpus: u32,
    pub memory_mib: u32,
}

impl ResourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(Error::InvalidConfig("cpu count must be positive".into()));
        }
        if self.memory_mib == 0 {
            return Err(Error::InvalidConfig("memory size must be positive".into()));
        }
        Ok(())
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mib: 1024,
        }
    }
}
