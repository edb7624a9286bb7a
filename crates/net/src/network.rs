//! Logical networks and the host resources behind them.

use crate::adapter::{Adapter, PortLease};
use crate::dhcp::AddressWatch;
use crate::host::HostNetworking;
use crate::names::{self, NameGuard};
use crate::NetError;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use weaver_core::{Error, HostConfig, Result};

/// DHCP wait used when the caller does not give one.
pub const DEFAULT_DHCP_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_NETWORK_ID: AtomicU64 = AtomicU64::new(1);

/// How a network's adapters are joined together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// Adapters join an existing host bridge.
    Host { bridge: String },
    /// Adapters join a private bridge owned by the network.
    Switch,
    /// Exactly two adapters joined point to point.
    Isolated,
}

impl Topology {
    fn kind(&self) -> &'static str {
        match self {
            Topology::Host { .. } => "host",
            Topology::Switch => "switch",
            Topology::Isolated => "isolated",
        }
    }
}

/// A veth pair between two bridges.
struct Link {
    near: NameGuard,
    far: NameGuard,
}

impl Link {
    async fn create(
        host: &dyn HostNetworking,
        anchor: &str,
        port: &str,
    ) -> std::result::Result<Self, NetError> {
        let (near, far) = names::next_link_pair();
        let near = NameGuard::reserve(near)?;
        let far = NameGuard::reserve(far)?;
        for name in [near.name(), far.name()] {
            if host.link_exists(name).await? {
                return Err(NetError::NameCollision(name.to_string()));
            }
        }

        host.add_veth(near.name(), far.name()).await?;
        let wired: std::result::Result<(), NetError> = async {
            host.set_master(near.name(), anchor).await?;
            host.set_master(far.name(), port).await?;
            host.set_up(near.name()).await?;
            host.set_up(far.name()).await
        }
        .await;

        if let Err(e) = wired {
            if let Err(cleanup) = host.delete_link(near.name()).await {
                debug!(link = near.name(), error = %cleanup, "link rollback");
            }
            return Err(e);
        }

        debug!(near = near.name(), far = far.name(), anchor, port, "created link");
        Ok(Self { near, far })
    }

    async fn delete(self, host: &dyn HostNetworking) -> std::result::Result<(), NetError> {
        debug!(near = self.near.name(), far = self.far.name(), "deleting link");
        host.delete_link(self.near.name()).await
    }
}

struct Plug {
    adapter: Adapter,
    link: Option<Link>,
    port: PortLease,
}

#[derive(Default)]
struct NetworkState {
    plugs: Vec<Plug>,
    /// Bridge created by a switch network.
    switch_bridge: Option<NameGuard>,
    closed: bool,
}

/// A logical network of adapters.
///
/// Host resources are created as adapters are plugged in and removed on
/// [`teardown`](Self::teardown). Use [`run`](Self::run) to scope a network
/// to a block; dropping a network that was not torn down cleans up
/// best-effort and logs a warning.
pub struct Network {
    id: u64,
    topology: Topology,
    host: Arc<dyn HostNetworking>,
    watch: AddressWatch,
    state: Mutex<NetworkState>,
}

impl Network {
    /// Creates a network, creating or verifying its anchor on the host.
    pub async fn new(
        topology: Topology,
        host: Arc<dyn HostNetworking>,
        config: &HostConfig,
    ) -> Result<Self> {
        let id = NEXT_NETWORK_ID.fetch_add(1, Ordering::Relaxed);
        let mut state = NetworkState::default();

        match &topology {
            Topology::Host { bridge } => {
                names::validate_ifname(bridge)?;
                let links = host.links().await?;
                match links.iter().find(|l| &l.name == bridge) {
                    Some(l) if l.kind.as_deref() == Some("bridge") => {}
                    Some(_) => {
                        return Err(NetError::Topology(format!("{bridge} is not a bridge")).into());
                    }
                    None => return Err(NetError::MissingLink(bridge.clone()).into()),
                }
            }
            Topology::Switch => {
                let bridge = NameGuard::reserve(names::next_switch_name())?;
                if host.link_exists(bridge.name()).await? {
                    return Err(NetError::NameCollision(bridge.name().to_string()).into());
                }
                host.add_bridge(bridge.name()).await?;
                if let Err(e) = host.set_up(bridge.name()).await {
                    if let Err(cleanup) = host.delete_link(bridge.name()).await {
                        debug!(bridge = bridge.name(), error = %cleanup, "switch rollback");
                    }
                    return Err(e.into());
                }
                state.switch_bridge = Some(bridge);
            }
            Topology::Isolated => {}
        }

        info!(network = id, topology = topology.kind(), "created network");
        Ok(Self {
            id,
            topology,
            host,
            watch: AddressWatch::from_config(config),
            state: Mutex::new(state),
        })
    }

    /// A network joined to the existing host bridge `bridge`.
    pub async fn host(
        bridge: impl Into<String>,
        host: Arc<dyn HostNetworking>,
        config: &HostConfig,
    ) -> Result<Self> {
        Self::new(
            Topology::Host {
                bridge: bridge.into(),
            },
            host,
            config,
        )
        .await
    }

    /// A network with its own private bridge.
    pub async fn switch(host: Arc<dyn HostNetworking>, config: &HostConfig) -> Result<Self> {
        Self::new(Topology::Switch, host, config).await
    }

    /// A point-to-point network between two adapters.
    pub async fn isolated(host: Arc<dyn HostNetworking>, config: &HostConfig) -> Result<Self> {
        Self::new(Topology::Isolated, host, config).await
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The bridge adapters are linked to, once there is one.
    pub async fn bridge_name(&self) -> Option<String> {
        let state = self.state.lock().await;
        self.anchor(&state)
    }

    pub async fn adapters(&self) -> Vec<Adapter> {
        let state = self.state.lock().await;
        state.plugs.iter().map(|p| p.adapter.clone()).collect()
    }

    fn anchor(&self, state: &NetworkState) -> Option<String> {
        match &self.topology {
            Topology::Host { bridge } => Some(bridge.clone()),
            Topology::Switch => state.switch_bridge.as_ref().map(|b| b.name().to_string()),
            Topology::Isolated => state.plugs.first().map(|p| p.adapter.port_bridge_name()),
        }
    }

    /// Plugs `adapter` into this network.
    ///
    /// Fails without side effects when the adapter is already plugged into
    /// any network, or when an isolated network already joins two adapters.
    pub async fn add_adapter(&self, adapter: &Adapter) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::InvalidState {
                operation: "add adapter",
                state: "torn down".to_string(),
            });
        }
        if self.topology == Topology::Isolated && state.plugs.len() >= 2 {
            return Err(NetError::Topology(format!(
                "isolated network {} already joins two adapters",
                self.id
            ))
            .into());
        }

        adapter.claim(self.id)?;
        match self.plug(&state, adapter).await {
            Ok(plug) => {
                state.plugs.push(plug);
                info!(network = self.id, mac = %adapter.mac(), "plugged adapter");
                Ok(())
            }
            Err(e) => {
                adapter.unclaim(self.id);
                Err(e.into())
            }
        }
    }

    async fn plug(
        &self,
        state: &NetworkState,
        adapter: &Adapter,
    ) -> std::result::Result<Plug, NetError> {
        let host = self.host.as_ref();
        let port = adapter.acquire_port(host).await?;

        let link = match self.anchor(state) {
            Some(anchor) => Link::create(host, &anchor, &adapter.port_bridge_name())
                .await
                .map(Some),
            // The first adapter of an isolated network is the anchor.
            None => Ok(None),
        };

        match link {
            Ok(link) => Ok(Plug {
                adapter: adapter.clone(),
                link,
                port,
            }),
            Err(e) => {
                if let Err(release) = port.release(host).await {
                    debug!(error = %release, "port rollback");
                }
                Err(e)
            }
        }
    }

    /// Plugs `adapter` and waits for it to obtain an address over DHCP.
    ///
    /// On [`Error::DhcpTimeout`] the adapter stays plugged; detaching or
    /// tearing down the network removes its link as usual.
    pub async fn add_adapter_and_wait(
        &self,
        adapter: &Adapter,
        timeout: Option<Duration>,
    ) -> Result<IpAddr> {
        let baseline = self.watch.baseline(adapter.mac()).await?;
        self.add_adapter(adapter).await?;

        let timeout = timeout.unwrap_or(DEFAULT_DHCP_TIMEOUT);
        let address = self
            .watch
            .wait_since(self.host.as_ref(), adapter.mac(), &baseline, timeout)
            .await?;
        if !adapter.set_address(self.id, address) {
            warn!(network = self.id, mac = %adapter.mac(), "adapter detached while waiting for DHCP");
        }
        Ok(address)
    }

    /// Unplugs `adapter`, removing its host-side resources.
    ///
    /// The adapter's binding is cleared even when host cleanup fails.
    pub async fn detach(&self, adapter: &Adapter) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(index) = state.plugs.iter().position(|p| p.adapter.same_as(adapter)) else {
            return Err(NetError::Topology(format!(
                "adapter {} is not plugged into network {}",
                adapter.mac(),
                self.id
            ))
            .into());
        };

        let plug = state.plugs.remove(index);
        let mut errors = Vec::new();

        // An isolated network's single link hangs off the anchor adapter's
        // port, so losing either end removes it.
        if self.topology == Topology::Isolated {
            for other in state.plugs.iter_mut() {
                if let Some(link) = other.link.take() {
                    if let Err(e) = link.delete(self.host.as_ref()).await {
                        errors.push(e.to_string());
                    }
                }
            }
        }

        errors.extend(unplug(self.host.as_ref(), self.id, plug).await);
        info!(network = self.id, mac = %adapter.mac(), "detached adapter");

        match errors.len() {
            0 => Ok(()),
            _ => Err(Error::NetworkResource(errors.join("; "))),
        }
    }

    /// Detaches every adapter and removes the network's own resources.
    ///
    /// Runs every step even if earlier ones fail. Calling it again is a no-op.
    pub async fn teardown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let errors = teardown_state(self.host.as_ref(), self.id, &mut state).await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(errors))
        }
    }

    /// Runs `body` with this network, tearing it down afterwards whatever
    /// the outcome. An error from `body` takes precedence over teardown
    /// errors, which are then only logged.
    pub async fn run<F, T>(self, body: F) -> Result<T>
    where
        F: AsyncFnOnce(&Network) -> Result<T>,
    {
        let outcome = body(&self).await;
        let teardown = self.teardown().await;
        match (outcome, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                warn!(network = self.id, error = %teardown, "teardown after failure");
                Err(e)
            }
        }
    }
}

async fn unplug(host: &dyn HostNetworking, network: u64, plug: Plug) -> Vec<String> {
    let mut errors = Vec::new();
    plug.adapter.unclaim(network);
    if let Some(link) = plug.link {
        if let Err(e) = link.delete(host).await {
            errors.push(e.to_string());
        }
    }
    if let Err(e) = plug.port.release(host).await {
        errors.push(e.to_string());
    }
    errors
}

async fn teardown_state(
    host: &dyn HostNetworking,
    network: u64,
    state: &mut NetworkState,
) -> Vec<String> {
    state.closed = true;
    let mut errors = Vec::new();

    // Later plugs may link to the first one's port in an isolated network.
    while let Some(plug) = state.plugs.pop() {
        errors.extend(unplug(host, network, plug).await);
    }

    if let Some(bridge) = state.switch_bridge.take() {
        if let Err(e) = host.delete_link(bridge.name()).await {
            errors.push(e.to_string());
        }
    }

    for e in &errors {
        warn!(network, error = %e, "network teardown step failed");
    }
    info!(network, "tore down network");
    errors
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.id)
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.closed {
            return;
        }
        warn!(network = self.id, "network dropped without teardown, cleaning up");

        let mut state = std::mem::take(state);
        state.closed = true;
        let host = self.host.clone();
        let id = self.id;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(network = id, "no runtime available, host resources leaked");
            return;
        };

        match runtime.runtime_flavor() {
            tokio::runtime::RuntimeFlavor::CurrentThread => {
                runtime.spawn(async move {
                    teardown_state(host.as_ref(), id, &mut state).await;
                });
            }
            _ => {
                // block_on cannot be called from within an async context.
                std::thread::scope(|s| {
                    s.spawn(|| {
                        runtime.block_on(teardown_state(host.as_ref(), id, &mut state));
                    });
                });
            }
        }
    }
}
