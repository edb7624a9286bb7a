//! Host-side network topology for weaver machines.
//!
//! A [`Network`] joins [`Adapter`]s through bridges, taps and veth links it
//! creates on the host via a [`HostNetworking`] implementation, normally
//! [`IpCommand`].

mod adapter;
mod dhcp;
mod error;
mod host;
mod ip;
pub mod names;
mod network;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adapter::{Adapter, PortLease, adapters_from_mac_list};
pub use dhcp::{AddressBaseline, AddressWatch, find_lease};
pub use error::NetError;
pub use host::{HostNetworking, LinkInfo, Neighbor};
pub use ip::IpCommand;
pub use network::{DEFAULT_DHCP_TIMEOUT, Network, Topology};
