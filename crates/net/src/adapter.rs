//! Virtual NIC identities and their host-side ports.

use crate::host::HostNetworking;
use crate::names::{self, NameGuard};
use crate::NetError;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use weaver_core::{MacAddress, Result};

const DEFAULT_MODEL: &str = "e1000";

/// A guest network interface identity.
///
/// Cloning an `Adapter` yields another handle to the same interface: the
/// machine that exposes it to the guest and the network it is plugged into
/// share it. Only [`Network`](crate::Network) changes which network an
/// adapter belongs to.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

struct AdapterInner {
    mac: MacAddress,
    model: String,
    binding: Mutex<Binding>,
    port: tokio::sync::Mutex<PortState>,
}

#[derive(Default)]
struct Binding {
    network: Option<u64>,
    address: Option<IpAddr>,
}

#[derive(Default)]
struct PortState {
    holders: usize,
    names: Option<(NameGuard, NameGuard)>,
}

impl Adapter {
    pub fn new(mac: MacAddress) -> Self {
        Self::with_model(mac, DEFAULT_MODEL)
    }

    /// Creates an adapter with a specific emulated NIC model (`e1000`, `virtio-net-pci`, ...).
    pub fn with_model(mac: MacAddress, model: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                mac,
                model: model.into(),
                binding: Mutex::new(Binding::default()),
                port: tokio::sync::Mutex::new(PortState::default()),
            }),
        }
    }

    pub fn parse(mac: &str) -> Result<Self> {
        Ok(Self::new(mac.parse()?))
    }

    pub fn mac(&self) -> MacAddress {
        self.inner.mac
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub fn uid(&self) -> String {
        self.inner.mac.uid()
    }

    /// Tap device the hypervisor attaches the guest NIC to.
    pub fn tap_name(&self) -> String {
        names::tap_name(&self.uid())
    }

    /// Bridge that joins the tap with every link this adapter is plugged into.
    pub fn port_bridge_name(&self) -> String {
        names::port_bridge_name(&self.uid())
    }

    /// Address observed for this adapter while plugged, if any.
    pub fn address(&self) -> Option<IpAddr> {
        self.binding().address
    }

    /// Id of the network this adapter is plugged into.
    pub fn network_id(&self) -> Option<u64> {
        self.binding().network
    }

    pub fn is_plugged(&self) -> bool {
        self.network_id().is_some()
    }

    /// True when both handles refer to the same adapter.
    pub fn same_as(&self, other: &Adapter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn binding(&self) -> std::sync::MutexGuard<'_, Binding> {
        self.inner
            .binding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn claim(&self, network: u64) -> std::result::Result<(), NetError> {
        let mut binding = self.binding();
        match binding.network {
            Some(existing) => Err(NetError::AlreadyPlugged {
                mac: self.mac().to_string(),
                network: existing,
            }),
            None => {
                binding.network = Some(network);
                Ok(())
            }
        }
    }

    pub(crate) fn unclaim(&self, network: u64) {
        let mut binding = self.binding();
        if binding.network == Some(network) {
            binding.network = None;
            binding.address = None;
        }
    }

    /// Records an observed address; ignored if the adapter moved networks meanwhile.
    pub(crate) fn set_address(&self, network: u64, address: IpAddr) -> bool {
        let mut binding = self.binding();
        if binding.network != Some(network) {
            return false;
        }
        binding.address = Some(address);
        true
    }

    /// Takes a reference on this adapter's host port, creating the port
    /// bridge and tap on first use.
    pub async fn acquire_port(
        &self,
        host: &dyn HostNetworking,
    ) -> std::result::Result<PortLease, NetError> {
        let mut port = self.inner.port.lock().await;

        if port.holders == 0 {
            let bridge = NameGuard::reserve(self.port_bridge_name())?;
            let tap = NameGuard::reserve(self.tap_name())?;
            for name in [bridge.name(), tap.name()] {
                if host.link_exists(name).await? {
                    return Err(NetError::NameCollision(name.to_string()));
                }
            }

            create_port(host, bridge.name(), tap.name()).await?;
            info!(mac = %self.mac(), bridge = bridge.name(), tap = tap.name(), "created adapter port");
            port.names = Some((bridge, tap));
        }

        port.holders += 1;
        Ok(PortLease {
            adapter: self.clone(),
            released: false,
        })
    }
}

async fn create_port(
    host: &dyn HostNetworking,
    bridge: &str,
    tap: &str,
) -> std::result::Result<(), NetError> {
    host.add_bridge(bridge).await?;

    let result: std::result::Result<(), NetError> = async {
        host.set_up(bridge).await?;
        host.add_tap(tap).await?;
        host.set_master(tap, bridge).await?;
        host.set_up(tap).await
    }
    .await;

    if let Err(e) = result {
        for name in [tap, bridge] {
            if let Err(cleanup) = host.delete_link(name).await {
                debug!(link = name, error = %cleanup, "port rollback");
            }
        }
        return Err(e);
    }
    Ok(())
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("mac", &self.mac())
            .field("model", &self.model())
            .field("network", &self.network_id())
            .field("address", &self.address())
            .finish()
    }
}

/// One holder's reference on an adapter's host port.
///
/// Must be handed back with [`release`](Self::release); the port is
/// deleted when the last lease is released.
#[must_use = "port leases must be released"]
pub struct PortLease {
    adapter: Adapter,
    released: bool,
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortLease")
            .field("mac", &self.adapter.mac())
            .field("released", &self.released)
            .finish()
    }
}

impl PortLease {
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub async fn release(mut self, host: &dyn HostNetworking) -> std::result::Result<(), NetError> {
        self.released = true;
        let mut port = self.adapter.inner.port.lock().await;
        port.holders = port.holders.saturating_sub(1);
        if port.holders > 0 {
            return Ok(());
        }

        let Some((bridge, tap)) = port.names.take() else {
            return Ok(());
        };

        let mut first_error = None;
        for name in [tap.name(), bridge.name()] {
            if let Err(e) = host.delete_link(name).await {
                warn!(link = name, error = %e, "failed to delete adapter port link");
                first_error.get_or_insert(e);
            }
        }
        info!(mac = %self.adapter.mac(), "removed adapter port");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(mac = %self.adapter.mac(), "adapter port lease dropped without release");
        }
    }
}

/// Builds adapters from MAC strings, accepting colon and compact forms and
/// skipping anything malformed.
pub fn adapters_from_mac_list<S: AsRef<str>>(macs: &[S]) -> Vec<Adapter> {
    macs.iter()
        .filter_map(|mac| match mac.as_ref().parse::<MacAddress>() {
            Ok(mac) => Some(Adapter::new(mac)),
            Err(e) => {
                debug!(mac = mac.as_ref(), error = %e, "skipping MAC");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostOp, MemoryHost};

    fn adapter(mac: &str) -> Adapter {
        Adapter::parse(mac).unwrap()
    }

    #[test]
    fn derives_interface_names_from_mac() {
        let a = adapter("52:54:00:12:34:56");
        assert_eq!(a.tap_name(), "wvt-123456");
        assert_eq!(a.port_bridge_name(), "wvp-123456");
        assert_eq!(a.model(), "e1000");
    }

    #[test]
    fn clones_share_state() {
        let a = adapter("52:54:00:12:34:57");
        let b = a.clone();
        a.claim(7).unwrap();
        assert_eq!(b.network_id(), Some(7));
        assert!(a.same_as(&b));
        assert!(!a.same_as(&adapter("52:54:00:12:34:57")));
    }

    #[test]
    fn claim_is_exclusive() {
        let a = adapter("52:54:00:12:34:58");
        a.claim(1).unwrap();
        let err = a.claim(2).unwrap_err();
        assert!(matches!(err, NetError::AlreadyPlugged { network: 1, .. }));
        assert_eq!(a.network_id(), Some(1));
    }

    #[test]
    fn unclaim_clears_address_only_for_owner() {
        let a = adapter("52:54:00:12:34:59");
        a.claim(1).unwrap();
        assert!(a.set_address(1, "10.0.0.5".parse().unwrap()));
        a.unclaim(2);
        assert_eq!(a.network_id(), Some(1));
        a.unclaim(1);
        assert_eq!(a.network_id(), None);
        assert_eq!(a.address(), None);
        assert!(!a.set_address(1, "10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn mac_list_accepts_both_forms_and_skips_garbage() {
        let adapters =
            adapters_from_mac_list(&["52:54:00:aa:bb:cc", "525400DDEEFF", "not-a-mac"]);
        assert_eq!(adapters.len(), 2);
        assert_eq!(adapters[0].mac().to_string(), "52:54:00:AA:BB:CC");
        assert_eq!(adapters[1].mac().to_string(), "52:54:00:DD:EE:FF");
    }

    #[tokio::test]
    async fn port_is_reference_counted() {
        let host = MemoryHost::new();
        let a = adapter("52:54:00:00:10:01");

        let first = a.acquire_port(&host).await.unwrap();
        let second = a.acquire_port(&host).await.unwrap();
        assert!(host.has_link("wvp-001001"));
        assert_eq!(
            host.link("wvt-001001").unwrap().master.as_deref(),
            Some("wvp-001001")
        );

        first.release(&host).await.unwrap();
        assert!(host.has_link("wvt-001001"));

        second.release(&host).await.unwrap();
        assert!(!host.has_link("wvt-001001"));
        assert!(!host.has_link("wvp-001001"));
    }

    #[tokio::test]
    async fn existing_host_link_is_a_collision() {
        let host = MemoryHost::new().with_bridge("wvp-001002");
        let a = adapter("52:54:00:00:10:02");

        let err = a.acquire_port(&host).await.unwrap_err();
        assert!(matches!(err, NetError::NameCollision(ref n) if n == "wvp-001002"));
        assert!(!host.has_link("wvt-001002"));
    }

    #[tokio::test]
    async fn failed_port_creation_rolls_back() {
        let host = MemoryHost::new();
        host.fail(HostOp::AddTap, "wvt-001003");
        let a = adapter("52:54:00:00:10:03");

        assert!(a.acquire_port(&host).await.is_err());
        assert!(!host.has_link("wvp-001003"));

        // The names were not left reserved.
        host.clear_failures();
        let lease = a.acquire_port(&host).await.unwrap();
        lease.release(&host).await.unwrap();
    }
}
