//! Disposable QEMU machines for integration tests.
//!
//! Weaver boots virtual machines from existing disk images, drives their
//! serial consoles, saves and restores snapshots, and wires their NICs into
//! host networks, all from async Rust. It is meant for tests that need a
//! real operating system on the other end of a wire.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use weaver::{Adapter, Drive, HostConfig, IpCommand, Machine, Network};
//!
//! # async fn example() -> weaver::Result<()> {
//! let config = HostConfig::from_env();
//! let host = Arc::new(IpCommand::from_config(&config));
//! let adapter = Adapter::parse("52:54:00:12:34:56")?;
//!
//! let network = Network::switch(host.clone(), &config).await?;
//! let machine = Machine::builder(&config)
//!     .cpus(2)
//!     .memory_mib(4096)
//!     .drive(Drive::new("./debian.qcow2")?)
//!     .adapter(adapter.clone())
//!     .host_networking(host)
//!     .build()?;
//!
//! machine
//!     .run(async |m| {
//!         let console = m.console()?;
//!         console.expect("login:", Duration::from_secs(30)).await?;
//!         network.add_adapter(&adapter).await?;
//!         m.take_snapshot("boot").await?;
//!         Ok(())
//!     })
//!     .await?;
//! network.teardown().await
//! # }
//! ```
//!
//! Machines and networks release what they created on the host when
//! stopped or torn down, and as a last resort when dropped.
//!
//! With the `test-utils` feature, [`test_utils::FakeBackend`] stands in for
//! QEMU and `weaver_net::testing::MemoryHost` for the host's link table.

pub mod backend;
mod console;
mod control;
mod machine;
mod snapshot;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use backend::{HypervisorBackend, QemuBackend, VmmExit, VmmProcess};
pub use console::{ConsoleChannel, ConsoleMatch};
pub use control::{ControlChannel, RunStatus};
pub use machine::{Machine, MachineBuilder, MachineState};
pub use snapshot::{SnapshotInfo, parse_snapshot_table};

pub use weaver_core::{
    Drive, DriveInterface, DriveMedia, Error, HostConfig, ImageFormat, MacAddress,
    ResourceConfig, Result, SnapshotFailure,
};
pub use weaver_net::{
    Adapter, AddressWatch, HostNetworking, IpCommand, NetError, Network, Topology,
    adapters_from_mac_list,
};
