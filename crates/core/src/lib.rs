//! Shared types for weaver: configuration, errors and the declarative
//! pieces of a machine (drives, MAC addresses, resources).

pub mod channel;
pub mod config;
pub mod error;
pub mod types;

pub use channel::{ChannelIo, ChannelStream};
pub use config::HostConfig;
pub use error::{Error, Result, SnapshotFailure};
pub use types::{Drive, DriveInterface, DriveMedia, ImageFormat, MacAddress, ResourceConfig};
