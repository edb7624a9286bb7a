//! Boundary to the host kernel's networking state.

use crate::NetError;
use async_trait::async_trait;
use std::net::IpAddr;
use weaver_core::MacAddress;

/// A network interface as seen on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    /// `bridge`, `veth`, `tun`, ... when the kernel reports one.
    pub kind: Option<String>,
    pub master: Option<String>,
    pub up: bool,
}

/// An entry of the host neighbour (ARP/NDP) table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub address: IpAddr,
    pub mac: Option<MacAddress>,
    pub device: Option<String>,
    /// Kernel neighbour states such as `REACHABLE` or `FAILED`.
    pub states: Vec<String>,
}

impl Neighbor {
    /// True when the kernel confirmed the entry recently. `STALE` entries
    /// can outlive the guest that created them by hours.
    pub fn is_confirmed(&self) -> bool {
        self.states
            .iter()
            .any(|s| matches!(s.as_str(), "REACHABLE" | "DELAY" | "PROBE"))
    }
}

/// Creates and deletes host network primitives.
///
/// Implementations only execute what they are asked to; name allocation,
/// collision checks and ownership live in [`Network`](crate::Network) and
/// [`Adapter`](crate::Adapter).
#[async_trait]
pub trait HostNetworking: Send + Sync {
    async fn links(&self) -> Result<Vec<LinkInfo>, NetError>;

    async fn link_exists(&self, name: &str) -> Result<bool, NetError> {
        Ok(self.links().await?.iter().any(|l| l.name == name))
    }

    async fn add_bridge(&self, name: &str) -> Result<(), NetError>;

    /// Creates a persistent tap device the hypervisor can open by name.
    async fn add_tap(&self, name: &str) -> Result<(), NetError>;

    async fn add_veth(&self, name: &str, peer: &str) -> Result<(), NetError>;

    async fn set_master(&self, link: &str, bridge: &str) -> Result<(), NetError>;

    async fn set_up(&self, link: &str) -> Result<(), NetError>;

    async fn set_down(&self, link: &str) -> Result<(), NetError>;

    /// Deletes a link. Deleting one end of a veth pair deletes both.
    async fn delete_link(&self, name: &str) -> Result<(), NetError>;

    async fn neighbors(&self) -> Result<Vec<Neighbor>, NetError>;
}
