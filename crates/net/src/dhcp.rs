//! Observing the address a guest obtained over DHCP.
//!
//! Weaver does not run a DHCP server. It watches host-side state for the
//! adapter's MAC instead: a dnsmasq-style lease file when one is configured,
//! otherwise the kernel neighbour table. Leases written before the wait
//! began and neighbour entries the kernel has not confirmed recently are
//! ignored, so a MAC reused across runs does not report the previous
//! guest's address.

use crate::host::HostNetworking;
use crate::NetError;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use weaver_core::{Error, HostConfig, MacAddress, Result};

/// Where and how often to look for an address.
#[derive(Debug, Clone)]
pub struct AddressWatch {
    pub lease_file: Option<PathBuf>,
    pub poll_interval: Duration,
}

impl AddressWatch {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            lease_file: config.lease_file.clone(),
            poll_interval: config.dhcp_poll_interval,
        }
    }

    /// Records the leases `mac` already holds. Take it before plugging the
    /// adapter and pass it to [`wait_since`](Self::wait_since).
    pub async fn baseline(&self, mac: MacAddress) -> std::result::Result<AddressBaseline, NetError> {
        let known = match &self.lease_file {
            Some(path) => match read_leases(path).await? {
                Some(contents) => leases(&contents, mac)
                    .map(|(line, _)| line.to_string())
                    .collect(),
                None => Vec::new(),
            },
            None => Vec::new(),
        };
        Ok(AddressBaseline { leases: known })
    }

    /// Polls until a new address for `mac` shows up or `timeout` elapses.
    pub async fn wait_for_address(
        &self,
        host: &dyn HostNetworking,
        mac: MacAddress,
        timeout: Duration,
    ) -> Result<IpAddr> {
        let baseline = self.baseline(mac).await?;
        self.wait_since(host, mac, &baseline, timeout).await
    }

    /// Polls until an address for `mac` not covered by `baseline` shows up
    /// or `timeout` elapses.
    pub async fn wait_since(
        &self,
        host: &dyn HostNetworking,
        mac: MacAddress,
        baseline: &AddressBaseline,
        timeout: Duration,
    ) -> Result<IpAddr> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(address) = self.lookup_since(host, mac, baseline).await? {
                info!(%mac, %address, "observed DHCP address");
                return Ok(address);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DhcpTimeout {
                    mac: mac.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// One look at the host state.
    pub async fn lookup(
        &self,
        host: &dyn HostNetworking,
        mac: MacAddress,
    ) -> std::result::Result<Option<IpAddr>, NetError> {
        self.lookup_since(host, mac, &AddressBaseline::default()).await
    }

    async fn lookup_since(
        &self,
        host: &dyn HostNetworking,
        mac: MacAddress,
        baseline: &AddressBaseline,
    ) -> std::result::Result<Option<IpAddr>, NetError> {
        let Some(path) = &self.lease_file else {
            return neighbor_for(host, mac).await;
        };
        let Some(contents) = read_leases(path).await? else {
            return Ok(None);
        };
        let found = leases(&contents, mac)
            .filter(|(line, _)| !baseline.leases.iter().any(|old| old == line))
            .map(|(_, address)| address)
            .last();
        Ok(found)
    }
}

/// Leases held before an adapter was plugged.
#[derive(Debug, Clone, Default)]
pub struct AddressBaseline {
    leases: Vec<String>,
}

async fn read_leases(path: &Path) -> std::result::Result<Option<String>, NetError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "lease file not present yet");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

async fn neighbor_for(
    host: &dyn HostNetworking,
    mac: MacAddress,
) -> std::result::Result<Option<IpAddr>, NetError> {
    let mut found: Option<IpAddr> = None;
    for neighbor in host.neighbors().await? {
        if neighbor.mac != Some(mac) || !neighbor.is_confirmed() {
            continue;
        }
        // Prefer IPv4; guests announce link-local v6 addresses long before DHCP.
        match (found, neighbor.address) {
            (Some(IpAddr::V4(_)), _) => {}
            (_, addr @ IpAddr::V4(_)) => found = Some(addr),
            (None, addr) => found = Some(addr),
            _ => {}
        }
    }
    Ok(found)
}

/// Lease lines for `mac`, oldest first, with their addresses.
fn leases(contents: &str, mac: MacAddress) -> impl Iterator<Item = (&str, IpAddr)> {
    contents.lines().filter_map(move |line| {
        let line = line.trim();
        let mut fields = line.split_whitespace();
        let _expiry = fields.next()?;
        let lease_mac: MacAddress = fields.next()?.parse().ok()?;
        let address: IpAddr = fields.next()?.parse().ok()?;
        (lease_mac == mac).then_some((line, address))
    })
}

/// Finds the most recent lease for `mac` in dnsmasq lease file format:
/// `<expiry> <mac> <address> <hostname> <client-id>`.
pub fn find_lease(contents: &str, mac: MacAddress) -> Option<IpAddr> {
    leases(contents, mac).map(|(_, address)| address).last()
}
